//! Schema-headed JSON Lines.
//!
//! The first line holds the schema, every following line is one record object
//! with the fields in schema order. The whole file may be gzip compressed; the
//! reader recognizes that by the magic bytes.

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::NamedTempFile;

use super::{Codec, Container, RecordSink, RecordSource, SinkError, SourceError};
use crate::record::Record;
use crate::schema::Schema;
use crate::value::Value;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Container files under one root directory.
#[derive(Debug, Clone)]
pub struct JsonlContainer {
    root: PathBuf,
    codec: Codec,
}

impl JsonlContainer {
    pub fn new(root: impl Into<PathBuf>, codec: Codec) -> Self {
        Self {
            root: root.into(),
            codec,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Path with the directory part canonicalized, for files that may not exist yet.
    fn location(&self, name: &str) -> PathBuf {
        let path = self.path(name);
        if let Ok(path) = path.canonicalize() {
            return path;
        }
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        match (dir.canonicalize(), path.file_name()) {
            (Ok(dir), Some(file)) => dir.join(file),
            _ => path,
        }
    }

    /// Write a complete container in one go.
    pub fn write_all<'r>(
        &self,
        name: &str,
        schema: &Schema,
        records: impl IntoIterator<Item = &'r Record>,
    ) -> Result<PathBuf, SinkError> {
        let mut sink = self.create_sink(name, schema)?;
        for record in records {
            sink.append(record)?;
        }
        sink.finish()
    }

    /// Read a complete container in one go.
    pub fn read_all(&self, name: &str) -> Result<(Schema, Vec<Record>), SourceError> {
        let source = self.open_source(name)?;
        let schema = source.schema().clone();
        let records = source.collect::<Result<Vec<_>, _>>()?;
        Ok((schema, records))
    }
}

impl Container for JsonlContainer {
    fn open_source(&self, name: &str) -> Result<Box<dyn RecordSource>, SourceError> {
        let path = self.path(name);
        let origin = path.display().to_string();
        let file = File::open(&path).map_err(|error| SourceError::Open {
            origin: origin.clone(),
            error,
        })?;

        let mut reader = BufReader::new(file);
        let compressed = reader
            .fill_buf()
            .map_err(|error| SourceError::Io {
                origin: origin.clone(),
                error,
            })?
            .starts_with(&GZIP_MAGIC);
        let reader: Box<dyn BufRead> = if compressed {
            Box::new(BufReader::new(GzDecoder::new(reader)))
        } else {
            Box::new(reader)
        };

        log::debug!("reading {origin} (compressed: {compressed})");
        JsonlSource::open(origin, reader).map(|s| Box::new(s) as Box<dyn RecordSource>)
    }

    fn create_sink(&self, name: &str, schema: &Schema) -> Result<Box<dyn RecordSink>, SinkError> {
        let path = self.path(name);
        let origin = path.display().to_string();
        let dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let tmp = NamedTempFile::new_in(dir).map_err(|error| SinkError::Create {
            origin: origin.clone(),
            error,
        })?;

        let buffered = BufWriter::new(tmp);
        let writer = match self.codec {
            Codec::Null => Writer::Plain(buffered),
            Codec::Deflate => Writer::Gzip(GzEncoder::new(buffered, Compression::default())),
        };

        let mut sink = JsonlSink {
            path,
            origin,
            schema: schema.clone(),
            writer,
            written: 0,
        };
        write_line(&mut sink.writer, &sink.origin, schema)?;
        log::debug!("writing {} with codec {:?}", sink.origin, self.codec);
        Ok(Box::new(sink))
    }

    fn same_location(&self, a: &str, b: &str) -> bool {
        self.location(a) == self.location(b)
    }
}

struct JsonlSource {
    origin: String,
    reader: Box<dyn BufRead>,
    schema: Schema,
    line_number: usize,
}

impl JsonlSource {
    fn open(origin: String, reader: Box<dyn BufRead>) -> Result<Self, SourceError> {
        let mut source = Self {
            origin,
            reader,
            schema: Schema::new("", Vec::new()),
            line_number: 0,
        };
        let header = match source.next_line() {
            Some(line) => line?,
            None => {
                return Err(SourceError::MissingSchema {
                    origin: source.origin,
                })
            }
        };
        source.schema = serde_json::from_str(&header).map_err(|error| SourceError::Schema {
            origin: source.origin.clone(),
            error,
        })?;
        Ok(source)
    }

    /// Next non-empty line.
    fn next_line(&mut self) -> Option<Result<String, SourceError>> {
        let mut line = String::new();
        loop {
            line.clear();
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line_number += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    return Some(Ok(line));
                }
                Err(error) => {
                    return Some(Err(SourceError::Io {
                        origin: self.origin.clone(),
                        error,
                    }))
                }
            }
        }
    }

    fn decode(&self, line: &str) -> Result<Record, SourceError> {
        let (origin, line_number) = (&self.origin, self.line_number);
        let json: serde_json::Value = serde_json::from_str(line).map_err(|error| SourceError::Json {
            origin: origin.clone(),
            line: line_number,
            error,
        })?;
        let serde_json::Value::Object(mut object) = json else {
            return Err(SourceError::NotAnObject {
                origin: origin.clone(),
                line: line_number,
            });
        };

        let mut record = Record::with_capacity(self.schema.fields.len());
        for field in &self.schema.fields {
            let value = match object.remove(&field.name) {
                Some(json) => field.ty.decode(&json),
                // Absent optional fields read as null.
                None => match field.ty.decode(&serde_json::Value::Null) {
                    Some(null) => Some(null),
                    None => {
                        return Err(SourceError::MissingField {
                            origin: origin.clone(),
                            line: line_number,
                            field: field.name.clone(),
                        })
                    }
                },
            };
            let Some(value) = value else {
                return Err(SourceError::TypeMismatch {
                    origin: origin.clone(),
                    line: line_number,
                    field: field.name.clone(),
                });
            };
            record.insert(field.name.clone(), value);
        }

        if let Some((extra, _)) = object.into_iter().next() {
            return Err(SourceError::UnknownField {
                origin: origin.clone(),
                line: line_number,
                field: extra,
            });
        }
        Ok(record)
    }
}

impl Iterator for JsonlSource {
    type Item = Result<Record, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.next_line()? {
            Ok(line) => line,
            Err(e) => return Some(Err(e)),
        };
        Some(self.decode(&line))
    }
}

impl RecordSource for JsonlSource {
    fn schema(&self) -> &Schema {
        &self.schema
    }
}

enum Writer {
    Plain(BufWriter<NamedTempFile>),
    Gzip(GzEncoder<BufWriter<NamedTempFile>>),
}

impl Writer {
    fn inner(&mut self) -> &mut dyn Write {
        match self {
            Writer::Plain(w) => w,
            Writer::Gzip(w) => w,
        }
    }

    fn into_file(self) -> io::Result<NamedTempFile> {
        let buffered = match self {
            Writer::Plain(w) => w,
            Writer::Gzip(w) => w.finish()?,
        };
        buffered.into_inner().map_err(|e| e.into_error())
    }
}

struct JsonlSink {
    path: PathBuf,
    origin: String,
    schema: Schema,
    writer: Writer,
    written: u64,
}

fn write_line(writer: &mut Writer, origin: &str, value: &impl serde::Serialize) -> Result<(), SinkError> {
    let out = writer.inner();
    serde_json::to_writer(&mut *out, value).map_err(|error| {
        if error.is_io() {
            SinkError::Io {
                origin: origin.to_string(),
                error: error.into(),
            }
        } else {
            SinkError::Json {
                origin: origin.to_string(),
                error,
            }
        }
    })?;
    out.write_all(b"\n").map_err(|error| SinkError::Io {
        origin: origin.to_string(),
        error,
    })
}

/// Record fields in schema order; fields the record lacks are written as null.
struct Ordered<'a> {
    schema: &'a Schema,
    record: &'a Record,
}

impl serde::Serialize for Ordered<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_map(self.schema.fields.iter().map(|field| {
            let value = self.record.get(&field.name).unwrap_or(&Value::Null);
            (&field.name, value)
        }))
    }
}

impl RecordSink for JsonlSink {
    fn append(&mut self, record: &Record) -> Result<(), SinkError> {
        for field in &self.schema.fields {
            let value = record.get(&field.name).unwrap_or(&Value::Null);
            if !field.ty.accepts(value) {
                return Err(SinkError::TypeMismatch {
                    origin: self.origin.clone(),
                    record: self.written,
                    field: field.name.clone(),
                });
            }
        }

        let line = Ordered {
            schema: &self.schema,
            record,
        };
        write_line(&mut self.writer, &self.origin, &line)?;
        self.written += 1;
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<PathBuf, SinkError> {
        let JsonlSink {
            path,
            origin,
            writer,
            written,
            ..
        } = *self;
        let io = |error| SinkError::Io {
            origin: origin.clone(),
            error,
        };

        let file = writer.into_file().map_err(io)?;
        file.as_file().sync_all().map_err(io)?;
        file.persist(&path).map_err(|e| io(e.error))?;

        log::debug!("{origin}: {written} records written");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Field, FieldType, Primitive};
    use pretty_assertions::assert_eq;

    fn schema() -> Schema {
        Schema::new(
            "Row",
            vec![
                Field::new("a", FieldType::Primitive(Primitive::Long)),
                Field::new("b", FieldType::Primitive(Primitive::String)),
            ],
        )
    }

    fn record(a: i64, b: &str) -> Record {
        [("a".to_string(), Value::Int(a)), ("b".to_string(), Value::from(b))]
            .into_iter()
            .collect()
    }

    #[test]
    fn write_and_read_with_both_codecs() {
        let dir = tempfile::tempdir().unwrap();
        for codec in [Codec::Null, Codec::Deflate] {
            let container = JsonlContainer::new(dir.path(), codec);
            let records = vec![record(1, "x"), record(2, "y")];
            container.write_all("data.jsonl", &schema(), &records).unwrap();

            let (read_schema, read_records) = container.read_all("data.jsonl").unwrap();
            assert_eq!(read_schema, schema());
            assert_eq!(read_records, records);

            let bytes = std::fs::read(dir.path().join("data.jsonl")).unwrap();
            assert_eq!(bytes.starts_with(&GZIP_MAGIC), codec == Codec::Deflate);
        }
    }

    #[test]
    fn plain_layout() {
        let dir = tempfile::tempdir().unwrap();
        let container = JsonlContainer::new(dir.path(), Codec::Null);
        // Field order follows the schema, not the record.
        let swapped: Record = [("b".to_string(), Value::from("x")), ("a".to_string(), Value::Int(1))]
            .into_iter()
            .collect();
        container.write_all("plain.jsonl", &schema(), [&swapped]).unwrap();

        let text = std::fs::read_to_string(dir.path().join("plain.jsonl")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(r#"{"type":"record","name":"Row","fields":["#));
        assert_eq!(lines[1], r#"{"a":1,"b":"x"}"#);
    }

    #[test]
    fn unfinished_sink_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let container = JsonlContainer::new(dir.path(), Codec::Deflate);
        let mut sink = container.create_sink("out.jsonl", &schema()).unwrap();
        sink.append(&record(1, "x")).unwrap();
        drop(sink);

        assert!(!dir.path().join("out.jsonl").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn sink_rejects_mistyped_values() {
        let dir = tempfile::tempdir().unwrap();
        let container = JsonlContainer::new(dir.path(), Codec::Null);
        let mut sink = container.create_sink("out.jsonl", &schema()).unwrap();
        let bad: Record = [("a".to_string(), Value::from("nope"))].into_iter().collect();
        assert!(matches!(
            sink.append(&bad),
            Err(SinkError::TypeMismatch { field, .. }) if field == "a"
        ));
    }

    #[test]
    fn source_errors_carry_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let container = JsonlContainer::new(dir.path(), Codec::Null);
        let header = serde_json::to_string(&schema()).unwrap();
        let write = |name: &str, body: &str| {
            std::fs::write(dir.path().join(name), format!("{header}\n{body}")).unwrap();
        };

        write("mismatch.jsonl", "{\"a\":1,\"b\":\"x\"}\n\n{\"a\":\"1\",\"b\":\"x\"}\n");
        let results: Vec<_> = container.open_source("mismatch.jsonl").unwrap().collect();
        assert!(results[0].is_ok());
        assert!(matches!(
            &results[1],
            Err(SourceError::TypeMismatch { line: 4, field, .. }) if field == "a"
        ));

        write("missing.jsonl", "{\"a\":1}\n");
        let mut source = container.open_source("missing.jsonl").unwrap();
        assert!(matches!(source.next(), Some(Err(SourceError::MissingField { .. }))));

        write("extra.jsonl", "{\"a\":1,\"b\":\"x\",\"c\":0}\n");
        let mut source = container.open_source("extra.jsonl").unwrap();
        assert!(matches!(source.next(), Some(Err(SourceError::UnknownField { .. }))));

        std::fs::write(dir.path().join("empty.jsonl"), "").unwrap();
        assert!(matches!(
            container.open_source("empty.jsonl").err(),
            Some(SourceError::MissingSchema { .. })
        ));
        assert!(matches!(
            container.open_source("absent.jsonl").err(),
            Some(SourceError::Open { .. })
        ));
    }

    #[test]
    fn same_location_resolves_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let container = JsonlContainer::new(dir.path(), Codec::Null);
        assert!(container.same_location("a.jsonl", "sub/../a.jsonl"));
        assert!(!container.same_location("a.jsonl", "b.jsonl"));
    }
}
