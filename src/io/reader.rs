//! Reading back an output written by [`FileStore`](super::FileStore).

use super::format::{shard_path, OutputLine, RunMetadata};
use crate::record::{ObservationSchema, Record};
use crate::{PipelineError, Result};
use std::path::{Path, PathBuf};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Decoded lines of a single output file, compressed or not.
fn read_lines(path: &Path) -> Result<Vec<OutputLine>> {
    let mut bytes = std::fs::read(path).map_err(|e| PipelineError::io_path("read", path, e))?;
    if bytes.starts_with(&ZSTD_MAGIC) {
        bytes = zstd::stream::decode_all(bytes.as_slice())
            .map_err(|e| PipelineError::io_path("decompress", path, e))?;
    }

    let text = String::from_utf8_lossy(&bytes);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(PipelineError::from))
        .collect()
}

/// Reader over a primary output file and its numbered shards.
#[derive(Debug)]
pub struct OutputReader {
    primary: PathBuf,
    schema: ObservationSchema,
    metadata: Vec<RunMetadata>,
    primary_rows: Vec<(u64, Record)>,
}

impl OutputReader {
    pub fn open(primary: impl AsRef<Path>) -> Result<Self> {
        let primary = primary.as_ref().to_path_buf();
        let mut schema = ObservationSchema::default();
        let mut metadata = Vec::new();
        let mut primary_rows = Vec::new();

        for line in read_lines(&primary)? {
            match line {
                OutputLine::Schema(s) => schema = s,
                OutputLine::Record { seq, record } => primary_rows.push((seq, record)),
                OutputLine::Metadata(m) => metadata.push(m),
            }
        }

        Ok(Self {
            primary,
            schema,
            metadata,
            primary_rows,
        })
    }

    pub fn schema(&self) -> &ObservationSchema {
        &self.schema
    }

    /// The authoritative (last written) metadata record.
    pub fn metadata(&self) -> Option<&RunMetadata> {
        self.metadata.last()
    }

    /// Every metadata record in the order it was written.
    pub fn metadata_history(&self) -> &[RunMetadata] {
        &self.metadata
    }

    /// All output files, the primary first.
    ///
    /// Uses the shard count from the metadata; without metadata (an
    /// interrupted run) numbered shards are looked up on disk.
    pub fn shard_paths(&self) -> Vec<PathBuf> {
        match self.metadata() {
            Some(meta) => (0..meta.shard_count.max(1))
                .map(|i| shard_path(&self.primary, i))
                .collect(),
            None => {
                let mut paths = vec![self.primary.clone()];
                loop {
                    let next = shard_path(&self.primary, paths.len());
                    if !next.exists() {
                        break paths;
                    }
                    paths.push(next);
                }
            }
        }
    }

    /// All rows across the primary and its shards, in file order.
    pub fn rows(&self) -> Result<Vec<(u64, Record)>> {
        let mut rows = self.primary_rows.clone();
        for path in self.shard_paths().iter().skip(1) {
            for line in read_lines(path)? {
                if let OutputLine::Record { seq, record } = line {
                    rows.push((seq, record));
                }
            }
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{FileStore, OutputStore};
    use crate::io::format::RunStatus;

    #[test]
    fn test_reads_across_shards() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("out.jsonl");
        let mut store = FileStore::new(&primary, 1);
        store.open(&ObservationSchema::default()).unwrap();
        store.append(0, &Record::new(10, b"x".to_vec())).unwrap();
        store.write_metadata(&RunMetadata::new("in")).unwrap();
        store.open_shard(1).unwrap();
        store.append(1, &Record::new(11, b"y".to_vec())).unwrap();
        store.close().unwrap();

        let mut last = RunMetadata::new("in");
        last.status = RunStatus::Completed;
        last.shard_count = 2;
        store.write_metadata(&last).unwrap();

        let reader = OutputReader::open(&primary).unwrap();
        assert_eq!(reader.metadata_history().len(), 2);
        assert_eq!(reader.metadata().unwrap().status, RunStatus::Completed);

        let ids: Vec<u64> = reader.rows().unwrap().iter().map(|(_, r)| r.id).collect();
        assert_eq!(ids, vec![10, 11]);
    }

    #[test]
    fn test_finds_shards_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let primary = dir.path().join("out.jsonl");
        let mut store = FileStore::new(&primary, 0);
        store.open(&ObservationSchema::default()).unwrap();
        store.open_shard(1).unwrap();
        store.open_shard(2).unwrap();
        store.close().unwrap();

        let reader = OutputReader::open(&primary).unwrap();
        assert!(reader.metadata().is_none());
        assert_eq!(reader.shard_paths().len(), 3);
    }
}
