//! Human readable rendering of formula errors, with the offending part of the
//! formula underlined.

use log::trace;
use smallvec::SmallVec;

use crate::formula::CompileError;
use crate::span::Span;

pub struct Pretty<'f> {
    formula: &'f str,
}

impl<'f> Pretty<'f> {
    pub fn new(formula: &'f str) -> Self {
        Self { formula }
    }

    pub fn explain_builder(&self) -> ExplainBuilder<'f> {
        ExplainBuilder {
            formula: self.formula,
            error_context: None,
            explain_contexts: Default::default(),
        }
    }

    /// Explanation of a compile error, with a hint where one helps.
    pub fn explain(&self, error: &CompileError) -> Result<PrettyError, ExplainBuildError> {
        let mut builder = self.explain_builder();
        builder.error(Context::new(error.span(), error.to_string()));

        match error {
            CompileError::NotCalled { name, span } => {
                builder.push_context(Context::new(
                    span.after(),
                    format!("call it, as in `{name}(...)`"),
                ));
            }
            CompileError::RecordNotIndexed { span } => {
                builder.push_context(Context::new(span.after(), "index it here".to_string()));
            }
            CompileError::UnknownField { name, span } => {
                builder.push_context(Context::new(
                    *span,
                    format!("fields with unusual names are read as col[\"{name}\"]"),
                ));
            }
            _ => {}
        }

        builder.build()
    }
}

pub struct ExplainBuilder<'f> {
    formula: &'f str,
    error_context: Option<Context>,
    explain_contexts: SmallVec<[Context; 4]>,
}

impl ExplainBuilder<'_> {
    /// Add a note shown after the error.
    pub fn push_context(&mut self, context: Context) -> &mut Self {
        self.explain_contexts.push(context);
        self
    }

    pub fn error(&mut self, context: Context) -> &mut Self {
        self.error_context = Some(context);
        self
    }

    pub fn build(self) -> Result<PrettyError, ExplainBuildError> {
        let error = self
            .error_context
            .as_ref()
            .ok_or(ExplainBuildError::MissingErrorContext)?;
        trace!("Building explanation with {} notes", self.explain_contexts.len());

        let mut out = String::new();
        self.render(&mut out, "error", error, '^')?;
        for context in &self.explain_contexts {
            out.push('\n');
            self.render(&mut out, "note", context, '-')?;
        }
        Ok(PrettyError(out))
    }

    fn render(
        &self,
        out: &mut String,
        label: &str,
        context: &Context,
        marker: char,
    ) -> Result<(), ExplainBuildError> {
        let location = self.locate(context.span)?;
        let number = location.line.to_string();
        let gutter = " ".repeat(number.len());

        out.push_str(&format!("{label}: {}\n", context.message));
        out.push_str(&format!("{gutter} |\n"));
        out.push_str(&format!("{number} | {}\n", location.text));
        out.push_str(&format!(
            "{gutter} | {}{}",
            " ".repeat(location.column),
            marker.to_string().repeat(location.width)
        ));
        Ok(())
    }

    fn locate(&self, span: Span) -> Result<Location<'_>, ExplainBuildError> {
        let (start, end) = (span.start() as usize, span.end() as usize);
        let out_of_bounds = ExplainBuildError::OutOfBounds { start, end };
        let before = self.formula.get(..start).ok_or(out_of_bounds.clone())?;

        let line_start = before.rfind('\n').map_or(0, |i| i + 1);
        let line_end = self.formula[start..]
            .find('\n')
            .map_or(self.formula.len(), |i| start + i);
        let marked = self
            .formula
            .get(start..end.clamp(start, line_end))
            .ok_or(out_of_bounds)?;

        Ok(Location {
            line: before.matches('\n').count() + 1,
            text: &self.formula[line_start..line_end],
            column: self.formula[line_start..start].chars().count(),
            width: marked.chars().count().max(1),
        })
    }
}

struct Location<'f> {
    /// One-based.
    line: usize,
    text: &'f str,
    /// In characters.
    column: usize,
    width: usize,
}

#[derive(Debug, Clone)]
pub struct PrettyError(String);

impl std::fmt::Display for PrettyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Deref for PrettyError {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::convert::AsRef<str> for PrettyError {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExplainBuildError {
    #[error("Error context is missing")]
    MissingErrorContext,

    #[error("Span {start}..{end} is outside of the formula")]
    OutOfBounds { start: usize, end: usize },
}

#[derive(Debug, Clone)]
pub struct Context {
    span: Span,
    message: String,
}

impl Context {
    pub fn new(span: Span, message: String) -> Self {
        Self { span, message }
    }
}
