//! Formulas: parsing, binding against a capability snapshot, and evaluation
//! against one record at a time.
//!
//! A formula is compiled once into an [Expression]. Compilation resolves every
//! name it mentions: calls must target an allowed symbol, `module.member` must go
//! through an allowed import, and everything else is a field of the record.
//! Nothing outside the snapshot the expression was compiled with is reachable
//! at evaluation time.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::record::Record;
use crate::registry::{Capabilities, ImportNotAllowed};
use crate::span::Span;
use crate::value::{Fault, Value};

mod bind;
mod eval;
pub mod lex;
pub mod parse;

pub use parse::SyntaxError;

/// Reserved name that gives access to the whole record, as in `col["a b"]`.
pub const RECORD_BINDING: &str = "col";

/// Bounds on the values evaluation may produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_string_len: usize,
    pub max_list_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_string_len: 1 << 20,
            max_list_len: 65536,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    #[error("syntax error: {error}")]
    Syntax { error: SyntaxError, span: Span },

    #[error("name `{name}` is not an allowed function or type")]
    SymbolNotAllowed { name: String, span: Span },

    #[error("{error}")]
    ImportNotAllowed { error: ImportNotAllowed, span: Span },

    #[error("module `{module}` has no member `{member}`")]
    UnknownMember {
        module: String,
        member: String,
        span: Span,
    },

    #[error("`{name}` is a function and must be called")]
    NotCalled { name: String, span: Span },

    #[error("`{name}` is a constant and cannot be called")]
    ConstantCalled { name: String, span: Span },

    #[error("only functions and types can be called")]
    NotCallable { span: Span },

    #[error("attributes can only be read from modules")]
    AttributeNotAllowed { span: Span },

    #[error("unknown field `{name}`")]
    UnknownField { name: String, span: Span },

    #[error("{name}() takes {expected} ({given} given)")]
    Arity {
        name: String,
        expected: crate::host::Arity,
        given: usize,
        span: Span,
    },

    #[error("`col` can only be used with a field name, as in col[\"field\"]")]
    RecordNotIndexed { span: Span },
}

impl CompileError {
    /// Part of the formula the error refers to.
    pub fn span(&self) -> Span {
        use CompileError::*;
        match self {
            Syntax { span, .. }
            | SymbolNotAllowed { span, .. }
            | ImportNotAllowed { span, .. }
            | UnknownMember { span, .. }
            | NotCalled { span, .. }
            | ConstantCalled { span, .. }
            | NotCallable { span }
            | AttributeNotAllowed { span }
            | UnknownField { span, .. }
            | Arity { span, .. }
            | RecordNotIndexed { span } => *span,
        }
    }
}

/// Failure to evaluate a formula against one record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("record {position}: {fault}")]
pub struct EvalError {
    /// Zero-based position of the record in the input.
    pub position: u64,
    pub fault: Fault,
}

/// Compiles formulas against one capability snapshot.
pub struct Compiler<'a> {
    capabilities: &'a Arc<Capabilities>,
    fields: Option<BTreeSet<&'a str>>,
    limits: Limits,
}

impl<'a> Compiler<'a> {
    pub fn new(capabilities: &'a Arc<Capabilities>) -> Self {
        Self {
            capabilities,
            fields: None,
            limits: Limits::default(),
        }
    }

    /// Known field names of the records. With these, references to absent
    /// fields are rejected at compile time instead of failing every record.
    pub fn fields(mut self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.fields = Some(names.into_iter().collect());
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Parse and bind the formula. All binding errors are reported, not only the first.
    pub fn compile(&self, formula: &str) -> Result<Expression, Vec<CompileError>> {
        let ast = parse::parse(formula).map_err(|e| {
            let (error, span) = e.split();
            vec![CompileError::Syntax { error, span }]
        })?;

        let binder = bind::Binder::new(self.capabilities, self.fields.as_ref());
        let root = binder.bind(ast)?;

        Ok(Expression {
            source: formula.to_string(),
            root,
            limits: self.limits,
        })
    }
}

/// Compile with default limits and without field checks.
pub fn compile(formula: &str, capabilities: &Arc<Capabilities>) -> Result<Expression, Vec<CompileError>> {
    Compiler::new(capabilities).compile(formula)
}

/// Compiled formula, ready to be evaluated against any number of records.
#[derive(Debug)]
pub struct Expression {
    source: String,
    root: bind::Node,
    limits: Limits,
}

impl Expression {
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against one record. The result is always storable in a calc
    /// column: lists are rendered as text and non-finite floats are errors.
    pub fn evaluate(&self, record: &Record, position: u64) -> Result<Value, EvalError> {
        let eval = eval::Evaluator {
            record,
            limits: &self.limits,
        };
        eval.eval(&self.root)
            .and_then(|value| storable(value, &self.limits))
            .map_err(|fault| EvalError { position, fault })
    }
}

fn storable(value: Value, limits: &Limits) -> Result<Value, Fault> {
    match value {
        Value::Float(f) if !f.is_finite() => Err(Fault::Value(format!(
            "result {} cannot be stored",
            Value::Float(f)
        ))),
        Value::List(_) => crate::host::bounded_str(value.to_text(), limits),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::capabilities;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    fn eval(formula: &str, rec: &Record) -> Result<Value, Fault> {
        let caps = capabilities(&["abs", "len", "str", "int", "round", "upper"], &["math"]);
        let expr = compile(formula, &caps).unwrap();
        expr.evaluate(rec, 0).map_err(|e| e.fault)
    }

    fn compile_errors(formula: &str, fields: &[&str]) -> Vec<CompileError> {
        let caps = capabilities(&["abs", "len"], &["math"]);
        Compiler::new(&caps)
            .fields(fields.iter().copied())
            .compile(formula)
            .unwrap_err()
    }

    #[test]
    fn arithmetic_on_fields() {
        crate::init_log();
        let rec = record(&[("a", Value::Int(1)), ("b", Value::Int(2))]);
        assert_eq!(eval("a+b", &rec), Ok(Value::Int(3)));
        assert_eq!(eval("a/b", &rec), Ok(Value::Float(0.5)));
        assert_eq!(eval("a/0", &rec), Err(Fault::DivisionByZero));
        assert_eq!(eval("abs(a - b) * 10", &rec), Ok(Value::Int(10)));
        assert_eq!(eval("math.sqrt(b * 8)", &rec), Ok(Value::Float(4.0)));
        assert_eq!(eval("math.pi > 3", &rec), Ok(Value::Bool(true)));
    }

    #[test]
    fn record_binding() {
        let rec = record(&[("first name", Value::from("Ada"))]);
        assert_eq!(eval("upper(col['first name'])", &rec), Ok(Value::from("ADA")));
        assert_eq!(
            eval("col['missing']", &rec),
            Err(Fault::MissingField("missing".into()))
        );
    }

    #[test]
    fn results_are_storable() {
        let rec = Record::default();
        assert_eq!(eval("[1, 'a']", &rec), Ok(Value::from("[1, 'a']")));
        assert!(eval("math.inf", &rec).is_err());
    }

    #[test]
    fn nested_lists_are_bounded_as_a_whole() {
        let caps = capabilities(&["str"], &[]);
        let small = Limits {
            max_string_len: 16,
            max_list_len: 16,
        };
        let eval = |formula: &str| {
            Compiler::new(&caps)
                .limits(small)
                .compile(formula)
                .unwrap()
                .evaluate(&Record::default(), 0)
                .map_err(|e| e.fault)
        };

        assert!(matches!(
            eval("[[[1]*16]*16]*16"),
            Err(Fault::LimitExceeded { what: "list length", .. })
        ));
        assert!(matches!(
            eval("[[1]*8] + [[1]*8]"),
            Err(Fault::LimitExceeded { what: "list length", .. })
        ));
        assert!(matches!(
            eval("[[1, 2, 3], [4, 5, 6], [7, 8, 9], [10, 11, 12], [13, 14, 15]]"),
            Err(Fault::LimitExceeded { what: "list length", .. })
        ));
        assert!(matches!(
            eval("['abcdefgh'] * 3"),
            Err(Fault::LimitExceeded { what: "string length", .. })
        ));
        assert_eq!(eval("[[1]*2]*2"), Ok(Value::from("[[1, 1], [1, 1]]")));
    }

    #[test]
    fn stored_list_text_is_bounded() {
        let caps = capabilities(&[], &[]);
        let small = Limits {
            max_string_len: 16,
            max_list_len: 16,
        };
        let expr = Compiler::new(&caps).limits(small).compile("[1000] * 8").unwrap();
        assert!(matches!(
            expr.evaluate(&Record::default(), 0).map_err(|e| e.fault),
            Err(Fault::LimitExceeded { what: "string length", .. })
        ));
    }

    #[test]
    fn evaluation_errors_carry_position() {
        let caps = capabilities(&[], &[]);
        let expr = compile("x // 0", &caps).unwrap();
        let rec = record(&[("x", Value::Int(4))]);
        let err = expr.evaluate(&rec, 17).unwrap_err();
        assert_eq!(err.position, 17);
        assert_eq!(err.to_string(), "record 17: division by zero");
    }

    #[test]
    fn disallowed_import() {
        let caps = capabilities(&["abs"], &["math"]);
        let errors = compile("os.system('rm -rf /')", &caps).unwrap_err();
        assert!(matches!(
            &errors[..],
            [CompileError::ImportNotAllowed { error, .. }] if error.module == "os"
        ));
    }

    #[test]
    fn all_errors_are_collected() {
        let errors = compile_errors("eval(a) + nope + math.nothing + abs()", &["a"]);
        assert_eq!(errors.len(), 4, "{errors:?}");
        assert!(matches!(errors[0], CompileError::SymbolNotAllowed { ref name, .. } if name == "eval"));
        assert!(matches!(errors[1], CompileError::UnknownField { ref name, .. } if name == "nope"));
        assert!(matches!(errors[2], CompileError::UnknownMember { .. }));
        assert!(matches!(errors[3], CompileError::Arity { given: 0, .. }));
    }

    #[test]
    fn misuse_of_names() {
        assert!(matches!(compile_errors("abs", &[])[..], [CompileError::NotCalled { .. }]));
        assert!(matches!(compile_errors("math.sqrt", &[])[..], [CompileError::NotCalled { .. }]));
        assert!(matches!(compile_errors("math.pi()", &[])[..], [CompileError::ConstantCalled { .. }]));
        assert!(matches!(compile_errors("(1)(2)", &[])[..], [CompileError::NotCallable { .. }]));
        assert!(matches!(compile_errors("'a'.upper()", &[])[..], [CompileError::AttributeNotAllowed { .. }]));
        assert!(matches!(compile_errors("col + 1", &[])[..], [CompileError::RecordNotIndexed { .. }]));
    }

    #[test]
    fn field_named_like_record_binding() {
        let caps = capabilities(&[], &[]);
        let expr = Compiler::new(&caps).fields(["col"]).compile("col + 1").unwrap();
        let rec = record(&[("col", Value::Int(1))]);
        assert_eq!(expr.evaluate(&rec, 0), Ok(Value::Int(2)));
    }

    #[test]
    fn syntax_error_has_span() {
        let caps = capabilities(&[], &[]);
        let errors = compile("a +* b", &caps).unwrap_err();
        let [CompileError::Syntax { span, .. }] = &errors[..] else {
            panic!("expected a syntax error, got {errors:?}");
        };
        assert_eq!(span.start(), 3);
    }
}
