//! Batch transformation: compute calc columns for every record of a container.
//!
//! A batch moves through `Validating → Compiling → Streaming → Finalizing` and
//! ends `Done` or `Failed`. Failures before streaming leave no output at all.
//! Failures while streaming drop the unfinished sink, which removes what was
//! written so far. Formula failures on single records never fail the batch;
//! they become nulls and are counted per column.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::container::{Container, SinkError, SourceError};
use crate::formula::{CompileError, Compiler, EvalError, Expression, Limits};
use crate::registry::{Capabilities, ConfigParseError};
use crate::schema::{self, SchemaConflict};
use crate::value::{InferredType, Value};

/// Output column defined by a formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalcColumn {
    #[serde(rename = "columnName")]
    pub name: String,
    #[serde(rename = "columnFormula")]
    pub formula: String,
}

impl CalcColumn {
    pub fn new(name: impl Into<String>, formula: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            formula: formula.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformRequest {
    pub input_file_name: String,
    pub output_file_name: String,
    #[serde(default)]
    pub calc_columns: Vec<CalcColumn>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformResponse {
    /// Empty when no output was produced.
    pub output_file_name: String,
    pub error_code: i32,
    pub error_message: String,
    /// One entry per calc column, in request order.
    pub column_errors: IndexMap<String, ColumnReport>,
    /// Records streamed to the output.
    pub records: u64,
    pub elapsed_ms: u64,
}

impl TransformResponse {
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Evaluation outcome of one calc column over the whole batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnReport {
    /// Records for which the formula failed and null was stored.
    pub failures: u64,
    /// First few failure messages, each naming its record.
    pub samples: Vec<String>,
    /// Type of the values produced, `None` if every record failed or produced null.
    pub inferred_type: Option<InferredType>,
}

impl ColumnReport {
    fn observe(&mut self, value: &Value) {
        self.inferred_type = InferredType::aggregate(self.inferred_type, value);
    }

    fn fail(&mut self, error: &EvalError, sample_limit: usize) {
        self.failures += 1;
        if self.samples.len() < sample_limit {
            self.samples.push(error.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validating,
    Compiling,
    Streaming,
    Finalizing,
    Done,
    Failed,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Formula of one column that failed to compile.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCompileError {
    pub column: String,
    pub formula: String,
    pub errors: Vec<CompileError>,
}

impl std::fmt::Display for ColumnCompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "column `{}` formula `{}`: ", self.column, self.formula)?;
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

/// Failure of a batch as a whole.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error(transparent)]
    Schema(#[from] SchemaConflict),

    #[error("{}", describe_compile(.0))]
    Compile(Vec<ColumnCompileError>),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("cancelled after {records} records")]
    Cancelled { records: u64 },

    #[error(transparent)]
    Config(#[from] ConfigParseError),
}

fn describe_compile(errors: &[ColumnCompileError]) -> String {
    let described: Vec<String> = errors.iter().map(ToString::to_string).collect();
    format!("compile errors: {}", described.join(" | "))
}

impl TransformError {
    /// Code reported in [TransformResponse::error_code]. Zero is success.
    pub fn code(&self) -> i32 {
        match self {
            TransformError::Schema(_) => 1,
            TransformError::Compile(_) => 2,
            TransformError::Source(_) => 3,
            TransformError::Sink(_) => 4,
            TransformError::Cancelled { .. } => 5,
            TransformError::Config(_) => 6,
        }
    }
}

/// Flag to abort a running batch from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub const DEFAULT_SAMPLE_LIMIT: usize = 5;

/// Runs batches against one container storage.
pub struct Transformer {
    container: Arc<dyn Container>,
    sample_limit: usize,
    limits: Limits,
}

/// State of one batch while it runs.
struct Batch<'r> {
    request: &'r TransformRequest,
    stage: Stage,
    reports: IndexMap<String, ColumnReport>,
    records: u64,
}

impl Batch<'_> {
    fn enter(&mut self, stage: Stage) {
        log::debug!(
            "{} -> {}: {} -> {stage}",
            self.request.input_file_name,
            self.request.output_file_name,
            self.stage
        );
        self.stage = stage;
    }
}

impl Transformer {
    pub fn new(container: Arc<dyn Container>) -> Self {
        Self {
            container,
            sample_limit: DEFAULT_SAMPLE_LIMIT,
            limits: Limits::default(),
        }
    }

    pub fn sample_limit(mut self, sample_limit: usize) -> Self {
        self.sample_limit = sample_limit;
        self
    }

    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Run a batch to completion. Never fails: failures are reported in the response.
    pub fn run(
        &self,
        request: &TransformRequest,
        capabilities: &Arc<Capabilities>,
        cancel: &CancelToken,
    ) -> TransformResponse {
        let started = Instant::now();
        let mut batch = Batch {
            request,
            stage: Stage::Validating,
            reports: IndexMap::new(),
            records: 0,
        };

        let outcome = self.execute(&mut batch, capabilities, cancel);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(path) => {
                batch.enter(Stage::Done);
                let failures: u64 = batch.reports.values().map(|r| r.failures).sum();
                log::info!(
                    "transformed {} records into {} in {elapsed_ms} ms, {failures} failed cells",
                    batch.records,
                    path.display()
                );
                TransformResponse {
                    output_file_name: request.output_file_name.clone(),
                    error_code: 0,
                    error_message: String::new(),
                    column_errors: batch.reports,
                    records: batch.records,
                    elapsed_ms,
                }
            }
            Err(error) => {
                log::warn!(
                    "transformation of {} failed while {}: {error}",
                    request.input_file_name,
                    batch.stage
                );
                batch.enter(Stage::Failed);
                TransformResponse {
                    output_file_name: String::new(),
                    error_code: error.code(),
                    error_message: error.to_string(),
                    column_errors: batch.reports,
                    records: batch.records,
                    elapsed_ms,
                }
            }
        }
    }

    fn execute(
        &self,
        batch: &mut Batch,
        capabilities: &Arc<Capabilities>,
        cancel: &CancelToken,
    ) -> Result<PathBuf, TransformError> {
        let request = batch.request;

        if self
            .container
            .same_location(&request.input_file_name, &request.output_file_name)
        {
            return Err(SinkError::SameAsInput {
                origin: request.output_file_name.clone(),
            }
            .into());
        }
        let source = self.container.open_source(&request.input_file_name)?;
        let output_schema = schema::merge(source.schema(), &request.calc_columns)?;

        batch.enter(Stage::Compiling);
        let compiled = {
            let compiler = Compiler::new(capabilities)
                .fields(source.schema().field_names())
                .limits(self.limits);
            compile_all(&compiler, &request.calc_columns)?
        };
        batch.reports = request
            .calc_columns
            .iter()
            .map(|column| (column.name.clone(), ColumnReport::default()))
            .collect();

        batch.enter(Stage::Streaming);
        let mut sink = self
            .container
            .create_sink(&request.output_file_name, &output_schema)?;
        for (position, record) in source.enumerate() {
            if cancel.is_cancelled() {
                return Err(TransformError::Cancelled {
                    records: batch.records,
                });
            }
            let mut record = record?;
            let position = position as u64;

            let values: Vec<Value> = compiled
                .iter()
                .zip(batch.reports.values_mut())
                .map(|(expression, report)| match expression.evaluate(&record, position) {
                    Ok(value) => {
                        report.observe(&value);
                        value
                    }
                    Err(error) => {
                        log::trace!("`{}`: {error}", expression.source());
                        report.fail(&error, self.sample_limit);
                        Value::Null
                    }
                })
                .collect();
            for (column, value) in request.calc_columns.iter().zip(values) {
                record.insert(column.name.clone(), value);
            }

            sink.append(&record)?;
            batch.records += 1;
        }

        batch.enter(Stage::Finalizing);
        if cancel.is_cancelled() {
            return Err(TransformError::Cancelled {
                records: batch.records,
            });
        }
        Ok(sink.finish()?)
    }
}

/// Compile every formula, collecting the errors of all of them.
fn compile_all(compiler: &Compiler, columns: &[CalcColumn]) -> Result<Vec<Expression>, TransformError> {
    let mut compiled = Vec::with_capacity(columns.len());
    let mut failed = Vec::new();
    for column in columns {
        match compiler.compile(&column.formula) {
            Ok(expression) => compiled.push(expression),
            Err(errors) => failed.push(ColumnCompileError {
                column: column.name.clone(),
                formula: column.formula.clone(),
                errors,
            }),
        }
    }
    if failed.is_empty() {
        Ok(compiled)
    } else {
        Err(TransformError::Compile(failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{Codec, JsonlContainer, RecordSink, RecordSource};
    use crate::record::Record;
    use crate::registry::tests::capabilities;
    use crate::schema::{Field, FieldType, Primitive, Schema};
    use pretty_assertions::assert_eq;

    struct Fixture {
        dir: tempfile::TempDir,
        container: Arc<JsonlContainer>,
    }

    impl Fixture {
        fn new(rows: &[(i64, i64)]) -> Self {
            crate::init_log();
            let dir = tempfile::tempdir().unwrap();
            let container = Arc::new(JsonlContainer::new(dir.path(), Codec::Null));
            let schema = Schema::new(
                "Row",
                vec![
                    Field::new("a", FieldType::Primitive(Primitive::Long)),
                    Field::new("b", FieldType::Primitive(Primitive::Long)),
                ],
            );
            let records: Vec<Record> = rows
                .iter()
                .map(|(a, b)| {
                    [("a".to_string(), Value::Int(*a)), ("b".to_string(), Value::Int(*b))]
                        .into_iter()
                        .collect()
                })
                .collect();
            container.write_all("in.jsonl", &schema, &records).unwrap();
            Self { dir, container }
        }

        fn run(&self, columns: &[(&str, &str)], cancel: &CancelToken) -> TransformResponse {
            let request = TransformRequest {
                input_file_name: "in.jsonl".to_string(),
                output_file_name: "out.jsonl".to_string(),
                calc_columns: columns.iter().map(|(n, f)| CalcColumn::new(*n, *f)).collect(),
            };
            let caps = capabilities(&["abs", "int", "str"], &["math"]);
            Transformer::new(self.container.clone())
                .sample_limit(2)
                .run(&request, &caps, cancel)
        }

        fn output(&self) -> Option<Vec<Record>> {
            if !self.dir.path().join("out.jsonl").exists() {
                return None;
            }
            Some(self.container.read_all("out.jsonl").unwrap().1)
        }
    }

    #[test]
    fn failures_are_counted_and_sampled() {
        let fixture = Fixture::new(&[(1, 0), (2, 1), (3, 0), (4, 0)]);
        let response = fixture.run(&[("q", "a // b"), ("s", "a + b")], &CancelToken::new());
        assert!(response.is_success(), "{response:?}");
        assert_eq!(response.records, 4);

        let q = &response.column_errors["q"];
        assert_eq!(q.failures, 3);
        assert_eq!(
            q.samples,
            vec!["record 0: division by zero", "record 2: division by zero"]
        );
        assert_eq!(q.inferred_type, Some(InferredType::Int));
        assert_eq!(response.column_errors["s"], ColumnReport {
            failures: 0,
            samples: vec![],
            inferred_type: Some(InferredType::Int),
        });

        let output = fixture.output().unwrap();
        assert_eq!(output[1].get("q"), Some(&Value::Int(2)));
        assert_eq!(output[0].get("q"), Some(&Value::Null));
        assert_eq!(output[0].get("s"), Some(&Value::Int(1)));
    }

    #[test]
    fn types_aggregate_over_records() {
        let fixture = Fixture::new(&[(1, 2), (3, 4)]);
        let response = fixture.run(
            &[("x", "a / b if a > 1 else a"), ("t", "str(a) if a > 1 else a")],
            &CancelToken::new(),
        );
        assert_eq!(response.column_errors["x"].inferred_type, Some(InferredType::Double));
        assert_eq!(response.column_errors["t"].inferred_type, Some(InferredType::String));
    }

    #[test]
    fn compile_errors_of_all_columns_are_reported() {
        let fixture = Fixture::new(&[(1, 2)]);
        let response = fixture.run(&[("x", "eval(a)"), ("y", "a +"), ("z", "a")], &CancelToken::new());
        assert_eq!(response.error_code, 2);
        assert!(response.error_message.contains("column `x`"), "{}", response.error_message);
        assert!(response.error_message.contains("column `y`"), "{}", response.error_message);
        assert!(!response.error_message.contains("column `z`"));
        assert!(response.output_file_name.is_empty());
        assert!(fixture.output().is_none());
    }

    #[test]
    fn unknown_field_fails_compilation() {
        let fixture = Fixture::new(&[(1, 2)]);
        let response = fixture.run(&[("x", "a + c")], &CancelToken::new());
        assert_eq!(response.error_code, 2);
        assert!(response.error_message.contains("unknown field `c`"));
    }

    #[test]
    fn cancelled_batch_leaves_no_output() {
        let fixture = Fixture::new(&[(1, 2), (3, 4)]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let response = fixture.run(&[("x", "a")], &cancel);
        assert_eq!(response.error_code, 5);
        assert!(fixture.output().is_none());
        let leftovers: Vec<_> = std::fs::read_dir(fixture.dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    /// Names of the files left in the fixture directory.
    fn files(fixture: &Fixture) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(fixture.dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn unreadable_record_after_written_ones_leaves_no_output() {
        use std::io::Write;

        let fixture = Fixture::new(&[(1, 2), (3, 4)]);
        let mut input = std::fs::OpenOptions::new()
            .append(true)
            .open(fixture.dir.path().join("in.jsonl"))
            .unwrap();
        writeln!(input, "not json").unwrap();
        drop(input);

        let response = fixture.run(&[("x", "a + b")], &CancelToken::new());
        assert_eq!(response.error_code, 3, "{response:?}");
        assert_eq!(response.records, 2);
        assert!(response.error_message.contains("in.jsonl:4"), "{}", response.error_message);
        assert!(fixture.output().is_none());
        assert_eq!(files(&fixture), vec!["in.jsonl"]);
    }

    /// Source that cancels the batch when its second record is read.
    struct CancelOnSecond {
        inner: Box<dyn RecordSource>,
        cancel: CancelToken,
        read: usize,
    }

    impl Iterator for CancelOnSecond {
        type Item = Result<Record, SourceError>;

        fn next(&mut self) -> Option<Self::Item> {
            self.read += 1;
            if self.read == 2 {
                self.cancel.cancel();
            }
            self.inner.next()
        }
    }

    impl RecordSource for CancelOnSecond {
        fn schema(&self) -> &Schema {
            self.inner.schema()
        }
    }

    struct Interrupted {
        inner: Arc<JsonlContainer>,
        cancel: CancelToken,
    }

    impl Container for Interrupted {
        fn open_source(&self, name: &str) -> Result<Box<dyn RecordSource>, SourceError> {
            Ok(Box::new(CancelOnSecond {
                inner: self.inner.open_source(name)?,
                cancel: self.cancel.clone(),
                read: 0,
            }))
        }

        fn create_sink(&self, name: &str, schema: &Schema) -> Result<Box<dyn RecordSink>, SinkError> {
            self.inner.create_sink(name, schema)
        }

        fn same_location(&self, a: &str, b: &str) -> bool {
            self.inner.same_location(a, b)
        }
    }

    #[test]
    fn cancelling_mid_stream_discards_written_records() {
        let fixture = Fixture::new(&[(1, 2), (3, 4), (5, 6)]);
        let cancel = CancelToken::new();
        let container = Arc::new(Interrupted {
            inner: fixture.container.clone(),
            cancel: cancel.clone(),
        });
        let request = TransformRequest {
            input_file_name: "in.jsonl".to_string(),
            output_file_name: "out.jsonl".to_string(),
            calc_columns: vec![CalcColumn::new("x", "a * b")],
        };

        let response = Transformer::new(container).run(&request, &capabilities(&[], &[]), &cancel);
        assert_eq!(response.error_code, 5, "{response:?}");
        assert_eq!(response.records, 1);
        assert!(fixture.output().is_none());
        assert_eq!(files(&fixture), vec!["in.jsonl"]);
    }

    #[test]
    fn output_must_differ_from_input() {
        let fixture = Fixture::new(&[(1, 2)]);
        let request = TransformRequest {
            input_file_name: "in.jsonl".to_string(),
            output_file_name: "./in.jsonl".to_string(),
            calc_columns: vec![],
        };
        let response = Transformer::new(fixture.container.clone()).run(
            &request,
            &capabilities(&[], &[]),
            &CancelToken::new(),
        );
        assert_eq!(response.error_code, 4);
    }

    #[test]
    fn missing_input_is_a_source_error() {
        let fixture = Fixture::new(&[]);
        let request = TransformRequest {
            input_file_name: "nope.jsonl".to_string(),
            output_file_name: "out.jsonl".to_string(),
            calc_columns: vec![CalcColumn::new("c", "1")],
        };
        let response = Transformer::new(fixture.container.clone()).run(
            &request,
            &capabilities(&[], &[]),
            &CancelToken::new(),
        );
        assert_eq!(response.error_code, 3);
        assert!(response.column_errors.is_empty());
    }

    #[test]
    fn wire_names() {
        let request: TransformRequest = serde_json::from_str(
            r#"{"inputFileName":"in","outputFileName":"out",
                "calcColumns":[{"columnName":"c","columnFormula":"a+b"}]}"#,
        )
        .unwrap();
        assert_eq!(request.calc_columns, vec![CalcColumn::new("c", "a+b")]);

        let mut response = TransformResponse {
            output_file_name: "out".into(),
            error_code: 0,
            error_message: String::new(),
            column_errors: IndexMap::new(),
            records: 1,
            elapsed_ms: 3,
        };
        response.column_errors.insert(
            "c".into(),
            ColumnReport {
                failures: 0,
                samples: vec![],
                inferred_type: Some(InferredType::Double),
            },
        );
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({
                "outputFileName": "out",
                "errorCode": 0,
                "errorMessage": "",
                "columnErrors": {"c": {"failures": 0, "samples": [], "inferredType": "DOUBLE"}},
                "records": 1,
                "elapsedMs": 3
            })
        );
    }
}
