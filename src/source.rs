//! Record sources consumed by the fetch gate.
//!
//! A source is only ever touched from inside the fetch gate's lock, so
//! implementations need `Send` but no internal synchronization.

use crate::record::Record;
use crate::{PipelineError, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

/// Something that yields records in a fixed order.
pub trait RecordSource: Send {
    /// Human readable description for logs and metadata.
    fn describe(&self) -> String;

    /// Produce the next record, or `None` once the input is exhausted.
    fn next_record(&mut self) -> Result<Option<Record>>;

    /// Cumulative bytes consumed from the underlying input.
    fn bytes_read(&self) -> u64;

    /// Total input size in bytes, when known up front.
    fn total_bytes(&self) -> Option<u64> {
        None
    }

    /// Total number of entries, when known up front.
    fn entries(&self) -> Option<u64> {
        None
    }

    /// Index of the next entry that `next_record` will return.
    fn position(&self) -> u64;

    /// Discard the first `count` entries. Returns how many were actually skipped.
    fn skip(&mut self, count: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < count {
            if self.next_record()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }
}

/// Reads one JSON record per line.
///
/// Lines are either full records (`{"id": 3, "payload": "..."}`) or bare JSON
/// values, in which case the line number becomes the id and the raw line the
/// payload. Blank lines are ignored.
pub struct JsonLinesSource {
    path: PathBuf,
    reader: BufReader<File>,
    line: String,
    bytes_read: u64,
    total_bytes: u64,
    position: u64,
}

impl JsonLinesSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| PipelineError::io_path("open", &path, e))?;
        let total_bytes = file
            .metadata()
            .map_err(|e| PipelineError::io_path("stat", &path, e))?
            .len();

        tracing::debug!("Opened {} ({} bytes)", path.display(), total_bytes);

        Ok(Self {
            path,
            reader: BufReader::new(file),
            line: String::new(),
            bytes_read: 0,
            total_bytes,
            position: 0,
        })
    }

    fn parse_line(&self, line: &str) -> Result<Record> {
        let value: serde_json::Value =
            serde_json::from_str(line).map_err(|e| PipelineError::Source {
                entry: self.position,
                message: format!("{}: {}", self.path.display(), e),
            })?;

        if value.get("id").is_some_and(|id| id.is_u64()) {
            serde_json::from_value(value).map_err(|e| PipelineError::Source {
                entry: self.position,
                message: format!("{}: {}", self.path.display(), e),
            })
        } else {
            Ok(Record::new(self.position, line.as_bytes().to_vec()))
        }
    }
}

impl RecordSource for JsonLinesSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        loop {
            self.line.clear();
            let n = self
                .reader
                .read_line(&mut self.line)
                .map_err(|e| PipelineError::io_path("read", &self.path, e))?;
            if n == 0 {
                return Ok(None);
            }
            self.bytes_read += n as u64;

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let record = self.parse_line(trimmed)?;
            self.position += 1;
            return Ok(Some(record));
        }
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn total_bytes(&self) -> Option<u64> {
        Some(self.total_bytes)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

/// In-memory source, mostly for embedding and tests.
///
/// Each record counts its payload length towards `bytes_read`.
pub struct MemorySource {
    records: VecDeque<Record>,
    entries: u64,
    total_bytes: u64,
    bytes_read: u64,
    position: u64,
    fail_at: Option<u64>,
}

impl MemorySource {
    pub fn new(records: Vec<Record>) -> Self {
        let total_bytes = records.iter().map(|r| r.payload.len() as u64).sum();
        Self {
            entries: records.len() as u64,
            records: records.into(),
            total_bytes,
            bytes_read: 0,
            position: 0,
            fail_at: None,
        }
    }

    /// `count` records with ids `0..count` and payload `"record-<id>"`.
    pub fn sequential(count: u64) -> Self {
        Self::new(
            (0..count)
                .map(|id| Record::new(id, format!("record-{}", id).into_bytes()))
                .collect(),
        )
    }

    /// Make `next_record` fail once the given entry index is reached.
    pub fn failing_at(mut self, entry: u64) -> Self {
        self.fail_at = Some(entry);
        self
    }
}

impl RecordSource for MemorySource {
    fn describe(&self) -> String {
        format!("memory ({} records)", self.entries)
    }

    fn next_record(&mut self) -> Result<Option<Record>> {
        if self.fail_at == Some(self.position) {
            return Err(PipelineError::Source {
                entry: self.position,
                message: "injected failure".to_string(),
            });
        }
        let Some(record) = self.records.pop_front() else {
            return Ok(None);
        };
        self.bytes_read += record.payload.len() as u64;
        self.position += 1;
        Ok(Some(record))
    }

    fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    fn total_bytes(&self) -> Option<u64> {
        Some(self.total_bytes)
    }

    fn entries(&self) -> Option<u64> {
        Some(self.entries)
    }

    fn position(&self) -> u64 {
        self.position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_source_skip_and_count() {
        let mut source = MemorySource::sequential(5);
        assert_eq!(source.entries(), Some(5));
        assert_eq!(source.skip(2).unwrap(), 2);

        let next = source.next_record().unwrap().unwrap();
        assert_eq!(next.id, 2);
        assert_eq!(source.position(), 3);

        assert_eq!(source.skip(10).unwrap(), 2);
        assert!(source.next_record().unwrap().is_none());
    }

    #[test]
    fn test_memory_source_injected_failure() {
        let mut source = MemorySource::sequential(3).failing_at(1);
        assert!(source.next_record().unwrap().is_some());
        assert!(matches!(
            source.next_record(),
            Err(PipelineError::Source { entry: 1, .. })
        ));
    }

    #[test]
    fn test_json_lines_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"id": 10, "payload": "first"}}"#).unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"value": 3}}"#).unwrap();
        file.flush().unwrap();

        let mut source = JsonLinesSource::open(file.path()).unwrap();
        let first = source.next_record().unwrap().unwrap();
        assert_eq!(first.id, 10);
        assert_eq!(first.payload, b"first");

        let second = source.next_record().unwrap().unwrap();
        assert_eq!(second.id, 1);
        assert_eq!(second.payload_text(), r#"{"value": 3}"#);

        assert!(source.next_record().unwrap().is_none());
        assert_eq!(source.bytes_read(), source.total_bytes().unwrap());
    }

    #[test]
    fn test_json_lines_source_bad_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        file.flush().unwrap();

        let mut source = JsonLinesSource::open(file.path()).unwrap();
        assert!(matches!(
            source.next_record(),
            Err(PipelineError::Source { entry: 0, .. })
        ));
    }

    #[test]
    fn test_json_lines_source_missing_file() {
        let result = JsonLinesSource::open("/nonexistent/records.jsonl");
        assert!(matches!(result, Err(PipelineError::Io { .. })));
    }
}
