//! Line format of output files and the run metadata record.
//!
//! Every output file is JSON lines. A file starts with a `schema` line, data
//! rows are `record` lines, and the primary file additionally collects
//! `metadata` lines; the last one is authoritative.

use crate::record::{ObservationSchema, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// One line of an output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputLine {
    Schema(ObservationSchema),
    Record {
        seq: u64,
        #[serde(flatten)]
        record: Record,
    },
    Metadata(RunMetadata),
}

impl OutputLine {
    /// Serialize as a single newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Metadata written at a shard rotation while the run is still going.
    Running,
    Completed,
    /// Stopped by the user before the input was exhausted.
    Stopped,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Stopped => "stopped",
            RunStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Stage entry recorded in the metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub name: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

/// Aggregate description of a run, written to the primary output file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub input: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub stages: Vec<StageInfo>,
    pub worker_count: usize,
    /// Records handed out by the fetch gate.
    pub records_fetched: u64,
    /// Rows actually written; dropped records are not included.
    pub records_written: u64,
    pub records_dropped: u64,
    /// Number of output files, the primary included.
    pub shard_count: usize,
    pub split_size_bytes: u64,
    pub compression_level: i32,
    pub bytes_written: u64,
    pub elapsed_secs: f64,
    /// Total time spent in each stage across workers, in milliseconds.
    #[serde(default)]
    pub stage_time_ms: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunMetadata {
    pub fn new(input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            input: input.into(),
            started_at: now,
            updated_at: now,
            status: RunStatus::Running,
            stages: Vec::new(),
            worker_count: 1,
            records_fetched: 0,
            records_written: 0,
            records_dropped: 0,
            shard_count: 1,
            split_size_bytes: 0,
            compression_level: 0,
            bytes_written: 0,
            elapsed_secs: 0.0,
            stage_time_ms: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }
}

/// Path of shard `index`; shard 0 is the primary file itself.
pub fn shard_path(primary: &Path, index: usize) -> PathBuf {
    if index == 0 {
        return primary.to_path_buf();
    }
    let mut name = primary.as_os_str().to_owned();
    name.push(format!(".{}", index));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldDef, ValueKind};

    #[test]
    fn test_shard_path() {
        let primary = Path::new("/data/out.jsonl");
        assert_eq!(shard_path(primary, 0), PathBuf::from("/data/out.jsonl"));
        assert_eq!(shard_path(primary, 3), PathBuf::from("/data/out.jsonl.3"));
    }

    #[test]
    fn test_record_line_layout() {
        let mut record = Record::new(4, b"hi".to_vec());
        record.observations.set("len", 2i64);
        let line = OutputLine::Record { seq: 9, record };
        let text = String::from_utf8(line.to_line().unwrap()).unwrap();
        assert_eq!(
            text,
            "{\"kind\":\"record\",\"seq\":9,\"id\":4,\"payload\":\"hi\",\"observations\":{\"len\":2}}\n"
        );
        let back: OutputLine = serde_json::from_str(text.trim_end()).unwrap();
        assert_eq!(back, line);
    }

    #[test]
    fn test_schema_and_metadata_lines() {
        let schema =
            ObservationSchema::from_fields(&[FieldDef::new("len", ValueKind::Int)]).unwrap();
        let text = serde_json::to_string(&OutputLine::Schema(schema)).unwrap();
        assert_eq!(text, r#"{"kind":"schema","fields":{"len":"int"}}"#);

        let mut meta = RunMetadata::new("in.jsonl");
        meta.status = RunStatus::Completed;
        let text = serde_json::to_string(&OutputLine::Metadata(meta.clone())).unwrap();
        assert!(text.starts_with(r#"{"kind":"metadata","input":"in.jsonl""#));
        assert!(text.contains(r#""status":"completed""#));
        let back: OutputLine = serde_json::from_str(&text).unwrap();
        assert_eq!(back, OutputLine::Metadata(meta));
    }
}
