//! Record containers: files that carry a schema followed by a stream of records.
//!
//! Batches only ever see the traits here. Reading is a [RecordSource] that
//! yields records one at a time, writing is a [RecordSink] that becomes visible
//! under its final name only once [RecordSink::finish] succeeded.

use std::path::PathBuf;

use crate::record::Record;
use crate::schema::Schema;

mod jsonl;

pub use jsonl::JsonlContainer;

/// Streaming reader of one container file.
pub trait RecordSource: Iterator<Item = Result<Record, SourceError>> {
    fn schema(&self) -> &Schema;
}

/// Streaming writer of one container file.
pub trait RecordSink {
    fn append(&mut self, record: &Record) -> Result<(), SinkError>;

    /// Flush everything and publish the file. A sink dropped without
    /// finishing leaves nothing behind.
    fn finish(self: Box<Self>) -> Result<PathBuf, SinkError>;
}

/// Storage the container files live in.
pub trait Container: Send + Sync {
    fn open_source(&self, name: &str) -> Result<Box<dyn RecordSource>, SourceError>;

    fn create_sink(&self, name: &str, schema: &Schema) -> Result<Box<dyn RecordSink>, SinkError>;

    /// Whether two names refer to the same file.
    fn same_location(&self, a: &str, b: &str) -> bool;
}

/// Compression of a written container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Null,
    #[default]
    Deflate,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot open {origin}: {error}")]
    Open {
        origin: String,
        #[source]
        error: std::io::Error,
    },

    #[error("{origin}: read failed: {error}")]
    Io {
        origin: String,
        #[source]
        error: std::io::Error,
    },

    #[error("{origin}: no schema header")]
    MissingSchema { origin: String },

    #[error("{origin}: invalid schema: {error}")]
    Schema {
        origin: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("{origin}:{line}: {error}")]
    Json {
        origin: String,
        line: usize,
        #[source]
        error: serde_json::Error,
    },

    #[error("{origin}:{line}: record is not a JSON object")]
    NotAnObject { origin: String, line: usize },

    #[error("{origin}:{line}: field `{field}` is missing")]
    MissingField {
        origin: String,
        line: usize,
        field: String,
    },

    #[error("{origin}:{line}: field `{field}` is not in the schema")]
    UnknownField {
        origin: String,
        line: usize,
        field: String,
    },

    #[error("{origin}:{line}: value of field `{field}` does not match its type")]
    TypeMismatch {
        origin: String,
        line: usize,
        field: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("cannot create {origin}: {error}")]
    Create {
        origin: String,
        #[source]
        error: std::io::Error,
    },

    #[error("{origin}: write failed: {error}")]
    Io {
        origin: String,
        #[source]
        error: std::io::Error,
    },

    #[error("{origin}: cannot encode record: {error}")]
    Json {
        origin: String,
        #[source]
        error: serde_json::Error,
    },

    #[error("{origin}: record {record}: value of field `{field}` does not match its type")]
    TypeMismatch {
        origin: String,
        record: u64,
        field: String,
    },

    #[error("{origin}: output would overwrite the input")]
    SameAsInput { origin: String },
}
