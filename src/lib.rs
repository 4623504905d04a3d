//! Colcalc computes calculated columns over record containers.
//! A client sends a batch request naming an input container, an output container and a
//! list of calc columns. Each calc column has a name and a formula. The output holds every
//! input record with one more field per calc column, carrying the value of its formula
//! for that record.
//!
//! # Formulas
//! Formulas are single expressions in a small language with Python-like syntax:
//! arithmetic, comparisons, `and`/`or`/`not`, conditional expressions
//! (`a if cond else b`), list literals, indexing, function calls and `module.member`
//! access. Fields of the record are read by bare name (`price * qty`) or through the
//! record binding (`col["unit price"]`).
//!
//! ## Sandbox
//! A formula can reach nothing that is not explicitly allowed. Two allow-lists are
//! loaded from YAML files:
//! - allowed builtins: functions and types that may be called by name, like `abs` or `str`;
//! - allowed imports: modules whose members may be used, like `math.sqrt`.
//!
//! Every name is resolved when the formula is compiled, against an immutable snapshot of
//! both lists. Anything else fails compilation, before a single record is read.
//! There are no loops, no assignments, no definitions and no attribute access on values,
//! so evaluation of one record always terminates. Sizes of produced strings and lists
//! are bounded.
//!
//! The lists can be reloaded while batches run. A batch keeps the snapshot it was
//! compiled with, and a reload that fails to load leaves the active snapshot in place.
//!
//! ## Failures
//! Errors of the whole batch (conflicting column names, formulas that do not compile,
//! unreadable input, unwritable output) fail it with a code and a message, and no output
//! appears. A formula failing on one record does not fail the batch: the calc field of
//! that record is null, and the failure is counted and sampled per column.
//!
//! # Containers
//! A container is a file with a schema header in the Avro JSON notation followed by one
//! JSON record per line, optionally gzip compressed. Output is written to a temporary
//! file next to the target and renamed into place once complete.

pub mod span;

/// Runtime values of formulas and the faults evaluation raises.
pub mod value;

/// Functions, types and modules the host can offer to formulas. Which of them a
/// formula actually sees is decided by the allow-lists.
pub mod host;

/// Formula language: lexer, parser, binding of names and evaluation.
pub mod formula;

pub mod record;

/// YAML allow-list files.
pub mod allowlist;

/// The allow-list snapshot in force and its reloads.
pub mod registry;

/// Record schemas and merging calc columns into them.
pub mod schema;

/// Reading and writing record containers.
pub mod container;

/// Batch transformation of a container.
pub mod transform;

/// Module to aid user in understanding formula errors.
pub mod explain;

pub mod config;

/// Request handling on top of everything else.
pub mod service;

/// Log line format shared by the binary and the tests.
pub fn log_format(
    write: &mut dyn std::io::Write,
    _: &mut flexi_logger::DeferredNow,
    record: &log::Record,
) -> std::io::Result<()> {
    write.write_all(
        format!(
            "[{} {}:{}] {} - {}",
            record.level(),
            record.file().unwrap_or_default(),
            record.line().unwrap_or_default(),
            record.module_path().unwrap_or_default(),
            record.args()
        )
        .as_bytes(),
    )
}

#[cfg(test)]
pub fn init_log() {
    use log::*;

    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = flexi_logger::Logger::with(LevelFilter::Trace)
            .format(log_format)
            .start();
    });
}
