//! Output stores: where committed rows end up.
//!
//! A store owns the current shard handle. It is only ever driven by the
//! shard manager from inside the commit gate's lock, so implementations need
//! `Send` but no internal synchronization.

use super::format::{shard_path, OutputLine, RunMetadata};
use crate::record::{ObservationSchema, Record};
use crate::{PipelineError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Destination for committed rows.
pub trait OutputStore: Send {
    fn describe(&self) -> String;

    /// Create the primary shard and write its schema line.
    fn open(&mut self, schema: &ObservationSchema) -> Result<()>;

    /// Append one row to the current shard. Returns the row size in bytes.
    fn append(&mut self, seq: u64, record: &Record) -> Result<u64>;

    /// Flush buffered rows of the current shard.
    fn flush(&mut self) -> Result<()>;

    /// Close the current shard and continue in shard `index`.
    fn open_shard(&mut self, index: usize) -> Result<()>;

    /// Append a metadata record to the primary shard.
    fn write_metadata(&mut self, metadata: &RunMetadata) -> Result<()>;

    /// Close the current shard for good.
    fn close(&mut self) -> Result<()>;
}

/// Writer for one output file, optionally zstd compressed.
enum ShardWriter {
    Plain(BufWriter<File>),
    Zstd(zstd::stream::write::Encoder<'static, BufWriter<File>>),
}

impl ShardWriter {
    fn new(file: File, compression_level: i32) -> std::io::Result<Self> {
        let buffered = BufWriter::with_capacity(256 * 1024, file);
        if compression_level > 0 {
            Ok(ShardWriter::Zstd(zstd::stream::write::Encoder::new(
                buffered,
                compression_level,
            )?))
        } else {
            Ok(ShardWriter::Plain(buffered))
        }
    }

    /// Finish the zstd frame (if any) and flush everything to the file.
    fn finish(self) -> std::io::Result<()> {
        match self {
            ShardWriter::Plain(mut w) => w.flush(),
            ShardWriter::Zstd(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for ShardWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            ShardWriter::Plain(w) => w.write(buf),
            ShardWriter::Zstd(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            ShardWriter::Plain(w) => w.flush(),
            ShardWriter::Zstd(w) => w.flush(),
        }
    }
}

/// The row as written: a copy of the record, its payload left out unless kept.
fn stored_row(record: &Record, store_payload: bool) -> Record {
    if store_payload {
        return record.clone();
    }
    Record {
        payload: Vec::new(),
        ..record.clone()
    }
}

/// JSON-lines files on local disk.
///
/// Shard sizes count uncompressed row bytes, so rotation points do not depend
/// on the compression level.
pub struct FileStore {
    primary: PathBuf,
    compression_level: i32,
    store_payload: bool,
    schema_line: Vec<u8>,
    writer: Option<ShardWriter>,
    shard_index: usize,
}

impl FileStore {
    pub fn new(primary: impl Into<PathBuf>, compression_level: i32) -> Self {
        Self {
            primary: primary.into(),
            compression_level,
            store_payload: true,
            schema_line: Vec::new(),
            writer: None,
            shard_index: 0,
        }
    }

    /// With `false`, rows keep identity and observations but not the payload.
    pub fn with_payload(mut self, store_payload: bool) -> Self {
        self.store_payload = store_payload;
        self
    }

    pub fn primary(&self) -> &Path {
        &self.primary
    }

    fn create(&self, path: &Path) -> Result<ShardWriter> {
        let file = File::create(path).map_err(|e| PipelineError::io_path("create", path, e))?;
        ShardWriter::new(file, self.compression_level)
            .map_err(|e| PipelineError::io_path("start compressor for", path, e))
    }

    fn finish_current(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            let path = shard_path(&self.primary, self.shard_index);
            writer
                .finish()
                .map_err(|e| PipelineError::io_path("finish", &path, e))?;
        }
        Ok(())
    }

    fn current(&mut self) -> Result<&mut ShardWriter> {
        self.writer.as_mut().ok_or_else(|| {
            PipelineError::io(
                "output store is not open",
                std::io::Error::from(std::io::ErrorKind::NotConnected),
            )
        })
    }
}

impl OutputStore for FileStore {
    fn describe(&self) -> String {
        self.primary.display().to_string()
    }

    fn open(&mut self, schema: &ObservationSchema) -> Result<()> {
        if let Some(parent) = self.primary.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| PipelineError::io_path("create directory", parent, e))?;
        }
        self.schema_line = OutputLine::Schema(schema.clone()).to_line()?;
        self.shard_index = 0;

        let mut writer = self.create(&self.primary)?;
        writer
            .write_all(&self.schema_line)
            .map_err(|e| PipelineError::io_path("write", &self.primary, e))?;
        self.writer = Some(writer);

        tracing::info!(
            "Writing output to {} (compression level {})",
            self.primary.display(),
            self.compression_level
        );
        Ok(())
    }

    fn append(&mut self, seq: u64, record: &Record) -> Result<u64> {
        let line = OutputLine::Record {
            seq,
            record: stored_row(record, self.store_payload),
        }
        .to_line()?;
        let index = self.shard_index;
        let primary = self.primary.clone();
        self.current()?
            .write_all(&line)
            .map_err(|e| PipelineError::io_path("write", &shard_path(&primary, index), e))?;
        Ok(line.len() as u64)
    }

    fn flush(&mut self) -> Result<()> {
        let path = shard_path(&self.primary, self.shard_index);
        match self.writer.as_mut() {
            Some(writer) => writer
                .flush()
                .map_err(|e| PipelineError::io_path("flush", &path, e)),
            None => Ok(()),
        }
    }

    fn open_shard(&mut self, index: usize) -> Result<()> {
        self.finish_current()?;

        let path = shard_path(&self.primary, index);
        let mut writer = self.create(&path)?;
        writer
            .write_all(&self.schema_line)
            .map_err(|e| PipelineError::io_path("write", &path, e))?;
        self.writer = Some(writer);
        self.shard_index = index;

        tracing::info!("Opened output shard {}", path.display());
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> Result<()> {
        let line = OutputLine::Metadata(metadata.clone()).to_line()?;

        if self.shard_index == 0 && self.writer.is_some() {
            let primary = self.primary.clone();
            return self
                .current()?
                .write_all(&line)
                .map_err(|e| PipelineError::io_path("write metadata to", &primary, e));
        }

        // The primary is closed: append a new frame to it.
        let file = OpenOptions::new()
            .append(true)
            .open(&self.primary)
            .map_err(|e| PipelineError::io_path("reopen", &self.primary, e))?;
        let mut writer = ShardWriter::new(file, self.compression_level)
            .map_err(|e| PipelineError::io_path("start compressor for", &self.primary, e))?;
        writer
            .write_all(&line)
            .map_err(|e| PipelineError::io_path("write metadata to", &self.primary, e))?;
        writer
            .finish()
            .map_err(|e| PipelineError::io_path("finish", &self.primary, e))
    }

    fn close(&mut self) -> Result<()> {
        self.finish_current()
    }
}

/// Rows and metadata captured by a [`MemoryStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryOutput {
    pub schema: Option<ObservationSchema>,
    /// One entry per shard, rows in append order.
    pub shards: Vec<Vec<(u64, Record)>>,
    pub metadata: Vec<RunMetadata>,
    pub flushes: usize,
    pub closed: bool,
}

impl MemoryOutput {
    /// All rows across shards in order.
    pub fn rows(&self) -> impl Iterator<Item = &(u64, Record)> {
        self.shards.iter().flatten()
    }

    pub fn sequence_numbers(&self) -> Vec<u64> {
        self.rows().map(|(seq, _)| *seq).collect()
    }
}

/// In-memory store for tests and embedding.
///
/// Row sizes are the serialized line length, or a fixed synthetic size when
/// one is set. The captured output stays reachable through [`MemoryStore::output`]
/// after the store has been handed to a pipeline.
pub struct MemoryStore {
    output: Arc<Mutex<MemoryOutput>>,
    row_size: Option<u64>,
    fail_after: Option<u64>,
    appended: u64,
    store_payload: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            output: Arc::new(Mutex::new(MemoryOutput::default())),
            row_size: None,
            fail_after: None,
            appended: 0,
            store_payload: true,
        }
    }

    /// Report every row as `bytes` long.
    pub fn with_row_size(mut self, bytes: u64) -> Self {
        self.row_size = Some(bytes);
        self
    }

    /// Fail every append after the first `rows` succeeded.
    pub fn failing_after(mut self, rows: u64) -> Self {
        self.fail_after = Some(rows);
        self
    }

    /// Capture rows without their payload.
    pub fn with_payload(mut self, store_payload: bool) -> Self {
        self.store_payload = store_payload;
        self
    }

    /// Shared handle to the captured output.
    pub fn output(&self) -> Arc<Mutex<MemoryOutput>> {
        Arc::clone(&self.output)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryOutput> {
        self.output.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStore for MemoryStore {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    fn open(&mut self, schema: &ObservationSchema) -> Result<()> {
        let mut out = self.lock();
        out.schema = Some(schema.clone());
        out.shards = vec![Vec::new()];
        Ok(())
    }

    fn append(&mut self, seq: u64, record: &Record) -> Result<u64> {
        if self.fail_after.is_some_and(|limit| self.appended >= limit) {
            return Err(PipelineError::io(
                format!("append row {}", seq),
                std::io::Error::other("injected write failure"),
            ));
        }
        let row = stored_row(record, self.store_payload);
        let size = match self.row_size {
            Some(size) => size,
            None => OutputLine::Record {
                seq,
                record: row.clone(),
            }
            .to_line()?
            .len() as u64,
        };
        let mut out = self.lock();
        match out.shards.last_mut() {
            Some(shard) => shard.push((seq, row)),
            None => out.shards.push(vec![(seq, row)]),
        }
        drop(out);
        self.appended += 1;
        Ok(size)
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }

    fn open_shard(&mut self, index: usize) -> Result<()> {
        let mut out = self.lock();
        out.shards.resize_with(index + 1, Vec::new);
        Ok(())
    }

    fn write_metadata(&mut self, metadata: &RunMetadata) -> Result<()> {
        self.lock().metadata.push(metadata.clone());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::format::RunStatus;
    use std::io::Read;

    fn read_lines(path: &Path, compressed: bool) -> Vec<serde_json::Value> {
        let mut bytes = Vec::new();
        File::open(path).unwrap().read_to_end(&mut bytes).unwrap();
        if compressed {
            bytes = zstd::stream::decode_all(bytes.as_slice()).unwrap();
        }
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    fn exercise(store: &mut FileStore) {
        store.open(&ObservationSchema::default()).unwrap();
        store.append(0, &Record::new(0, b"a".to_vec())).unwrap();
        store.flush().unwrap();
        store.write_metadata(&RunMetadata::new("in")).unwrap();
        store.open_shard(1).unwrap();
        store.append(1, &Record::new(1, b"b".to_vec())).unwrap();
        let mut last = RunMetadata::new("in");
        last.status = RunStatus::Completed;
        store.close().unwrap();
        store.write_metadata(&last).unwrap();
    }

    #[test]
    fn test_file_store_plain() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("out.jsonl");
        let mut store = FileStore::new(&primary, 0);
        exercise(&mut store);

        let lines = read_lines(&primary, false);
        let kinds: Vec<&str> = lines.iter().map(|l| l["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["schema", "record", "metadata", "metadata"]);
        assert_eq!(lines[3]["status"], "completed");

        let shard = read_lines(&shard_path(&primary, 1), false);
        assert_eq!(shard.len(), 2);
        assert_eq!(shard[1]["seq"], 1);
    }

    #[test]
    fn test_file_store_zstd_frames() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("out.jsonl.zst");
        let mut store = FileStore::new(&primary, 3);
        exercise(&mut store);

        // primary is two concatenated frames
        let lines = read_lines(&primary, true);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3]["kind"], "metadata");
        assert_eq!(read_lines(&shard_path(&primary, 1), true).len(), 2);
    }

    #[test]
    fn test_file_store_observations_only() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("out.jsonl");
        let mut store = FileStore::new(&primary, 0).with_payload(false);
        store.open(&ObservationSchema::default()).unwrap();

        let mut record = Record::new(7, b"large raw payload".to_vec());
        record.observations.set("len", 17i64);
        let written = store.append(0, &record).unwrap();
        store.close().unwrap();

        let lines = read_lines(&primary, false);
        assert_eq!(lines[1]["id"], 7);
        assert_eq!(lines[1]["observations"]["len"], 17);
        assert!(lines[1].get("payload").is_none());
        // size accounting follows what was actually written
        let text = std::fs::read_to_string(&primary).unwrap();
        assert_eq!(written as usize, text.lines().nth(1).unwrap().len() + 1);
    }

    #[test]
    fn test_file_store_unwritable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blocker"), b"").unwrap();
        let mut store = FileStore::new(dir.path().join("blocker").join("out.jsonl"), 0);
        assert!(matches!(
            store.open(&ObservationSchema::default()),
            Err(PipelineError::Io { .. })
        ));
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryStore::new().with_row_size(10).failing_after(2);
        let output = store.output();
        store.open(&ObservationSchema::default()).unwrap();
        assert_eq!(store.append(0, &Record::new(0, Vec::new())).unwrap(), 10);
        store.open_shard(1).unwrap();
        store.append(1, &Record::new(1, Vec::new())).unwrap();
        assert!(store.append(2, &Record::new(2, Vec::new())).is_err());

        let out = output.lock().unwrap();
        assert_eq!(out.shards.len(), 2);
        assert_eq!(out.sequence_numbers(), vec![0, 1]);
    }
}
