//! Allow-list definitions: flat YAML sequences of names, one per entry.
//!
//! ```yaml
//! # allowed_imports.yaml
//! - math
//! - re
//! ```
//!
//! The sequence is read with the marked event parser of `yaml_rust2`, so every
//! entry remembers the line it was written on and errors can point at it.

use std::path::PathBuf;

use lazy_regex::regex_is_match;
use yaml_rust2::{
    parser::{MarkedEventReceiver, Parser},
    scanner::Marker,
    Event,
};

use crate::registry::ConfigParseError;

/// Where an allow-list is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllowListSource {
    File(PathBuf),

    /// Definition held in memory. The name is only used in diagnostics.
    Inline { name: String, text: String },
}

/// One allowed name, with the line it was defined on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub line: usize,
}

impl AllowListSource {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        AllowListSource::File(path.into())
    }

    pub fn inline(name: impl Into<String>, text: impl Into<String>) -> Self {
        AllowListSource::Inline {
            name: name.into(),
            text: text.into(),
        }
    }

    /// Name of the source for diagnostics.
    pub fn origin(&self) -> String {
        match self {
            AllowListSource::File(path) => path.display().to_string(),
            AllowListSource::Inline { name, .. } => name.clone(),
        }
    }

    /// Read and validate the entries. Names are checked for shape and
    /// uniqueness here; whether the host provides them is up to the registry.
    pub fn read(&self) -> Result<Vec<Entry>, ConfigParseError> {
        let origin = self.origin();
        let text = match self {
            AllowListSource::File(path) => {
                std::fs::read_to_string(path).map_err(|error| ConfigParseError::Io {
                    origin: origin.clone(),
                    error,
                })?
            }
            AllowListSource::Inline { text, .. } => text.clone(),
        };
        log::trace!("reading allow-list from {origin}");
        parse(&origin, &text)
    }
}

fn parse(origin: &str, text: &str) -> Result<Vec<Entry>, ConfigParseError> {
    let mut receiver = ListReceiver::default();
    let mut parser = Parser::new(text.chars());
    parser
        .load(&mut receiver, true)
        .map_err(|error| ConfigParseError::Yaml {
            origin: origin.to_string(),
            error,
        })?;

    if let Some(problem) = receiver.problem {
        return Err(problem.into_error(origin));
    }
    if !receiver.seen_root {
        log::warn!("allow-list {origin} is empty, nothing will be allowed from it");
    }

    let mut entries: Vec<Entry> = Vec::with_capacity(receiver.entries.len());
    for entry in receiver.entries {
        if !regex_is_match!(r"^[A-Za-z_][A-Za-z0-9_]*$", &entry.name) {
            return Err(ConfigParseError::InvalidEntry {
                origin: origin.to_string(),
                line: entry.line,
                entry: entry.name,
            });
        }
        if let Some(first) = entries.iter().find(|e| e.name == entry.name) {
            return Err(ConfigParseError::Duplicate {
                origin: origin.to_string(),
                line: entry.line,
                first_line: first.line,
                name: entry.name,
            });
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// Structural problem found while receiving parser events.
#[derive(Debug)]
enum Problem {
    NotASequence { line: usize },
    InvalidEntry { line: usize, entry: String },
}

impl Problem {
    fn into_error(self, origin: &str) -> ConfigParseError {
        let origin = origin.to_string();
        match self {
            Problem::NotASequence { line } => ConfigParseError::NotASequence { origin, line },
            Problem::InvalidEntry { line, entry } => {
                ConfigParseError::InvalidEntry { origin, line, entry }
            }
        }
    }
}

/// Collects the scalars of a single top-level sequence.
#[derive(Default)]
struct ListReceiver {
    depth: usize,
    seen_root: bool,
    entries: Vec<Entry>,
    problem: Option<Problem>,
}

impl MarkedEventReceiver for ListReceiver {
    fn on_event(&mut self, ev: Event, mark: Marker) {
        if self.problem.is_some() {
            return;
        }
        if let Err(problem) = self.on_event_impl(ev, mark) {
            self.problem = Some(problem);
        }
    }
}

impl ListReceiver {
    fn on_event_impl(&mut self, ev: Event, mark: Marker) -> Result<(), Problem> {
        let line = mark.line();
        match ev {
            Event::Nothing
            | Event::StreamStart
            | Event::StreamEnd
            | Event::DocumentStart
            | Event::DocumentEnd => {}
            Event::SequenceStart(..) => {
                if self.depth > 0 {
                    return Err(Problem::InvalidEntry {
                        line,
                        entry: "<nested sequence>".to_string(),
                    });
                }
                if self.seen_root {
                    return Err(Problem::NotASequence { line });
                }
                self.seen_root = true;
                self.depth = 1;
            }
            Event::SequenceEnd => self.depth = 0,
            Event::MappingStart(..) => {
                if self.depth == 0 {
                    return Err(Problem::NotASequence { line });
                }
                return Err(Problem::InvalidEntry {
                    line,
                    entry: "<mapping>".to_string(),
                });
            }
            Event::MappingEnd => {}
            Event::Scalar(value, ..) => {
                if self.depth == 0 {
                    return Err(Problem::NotASequence { line });
                }
                self.entries.push(Entry {
                    name: value.trim().to_string(),
                    line,
                });
            }
            Event::Alias(_) => {
                return Err(Problem::InvalidEntry {
                    line,
                    entry: "<alias>".to_string(),
                });
            }
        }
        Ok(())
    }
}
