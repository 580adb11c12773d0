//! Shard rotation.
//!
//! The shard manager lives inside the commit gate's mutex; every method runs
//! with that lock held, so it needs no synchronization of its own.

use super::Metrics;
use crate::io::{OutputStore, RunMetadata, RunStatus};
use crate::record::{ObservationSchema, Record};
use crate::Result;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct ShardManager {
    store: Box<dyn OutputStore>,
    split_threshold: u64,
    bytes_in_shard: u64,
    shard_index: usize,
    metadata: RunMetadata,
    metrics: Arc<Metrics>,
    started: Instant,
}

impl ShardManager {
    /// `metadata` carries the static part of the run description; counters
    /// and timings are filled in whenever it is written.
    pub fn new(
        store: Box<dyn OutputStore>,
        split_threshold: u64,
        metadata: RunMetadata,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            split_threshold: split_threshold.max(1),
            bytes_in_shard: 0,
            shard_index: 0,
            metadata,
            metrics,
            started: Instant::now(),
        }
    }

    pub fn open(&mut self, schema: &ObservationSchema) -> Result<()> {
        self.store.open(schema)
    }

    pub fn shard_index(&self) -> usize {
        self.shard_index
    }

    /// Bytes counted against the current shard, including the overshoot
    /// carried over from the row that triggered the last rotation.
    pub fn bytes_in_shard(&self) -> u64 {
        self.bytes_in_shard
    }

    /// Append one row and rotate if the shard reached the threshold.
    pub fn append(&mut self, seq: u64, record: &Record) -> Result<()> {
        let start = Instant::now();
        let written = self.store.append(seq, record)?;
        self.bytes_in_shard += written;
        self.metrics.add_bytes_written(written);
        self.metrics.add_record_written();

        let result = if self.bytes_in_shard >= self.split_threshold {
            self.rotate()
        } else {
            Ok(())
        };
        self.metrics.add_write_time(start.elapsed());
        result
    }

    /// Flush the current shard, record progress in the primary file and
    /// continue in the next numbered shard.
    fn rotate(&mut self) -> Result<()> {
        self.store.flush()?;

        // the metadata already counts the shard about to be opened
        self.refresh_metadata(RunStatus::Running, self.shard_index + 2);
        self.store.write_metadata(&self.metadata)?;

        self.store.open_shard(self.shard_index + 1)?;
        self.shard_index += 1;
        // keep the overshoot so rotations track total bytes / threshold
        self.bytes_in_shard -= self.split_threshold;
        self.metrics.add_shard_rotation();

        tracing::info!(
            "Rotated output to shard {} after {} rows",
            self.shard_index,
            self.metadata.records_written
        );
        Ok(())
    }

    fn refresh_metadata(&mut self, status: RunStatus, shard_count: usize) {
        let snapshot = self.metrics.snapshot();
        let meta = &mut self.metadata;
        meta.updated_at = Utc::now();
        meta.status = status;
        meta.records_fetched = snapshot.records_fetched;
        meta.records_written = snapshot.records_written;
        meta.records_dropped = snapshot.records_dropped;
        meta.bytes_written = snapshot.bytes_written;
        meta.shard_count = shard_count;
        meta.elapsed_secs = self.started.elapsed().as_secs_f64();
    }

    /// Flush and close the last shard, then write the final metadata to the
    /// primary file.
    ///
    /// The metadata is written even when closing the shard failed, so a
    /// failed run still leaves a self-describing primary file where possible.
    pub fn finalize(
        &mut self,
        status: RunStatus,
        stage_times: &BTreeMap<String, Duration>,
        warnings: Vec<String>,
    ) -> Result<RunMetadata> {
        let closed = self.store.flush().and_then(|_| self.store.close());

        self.refresh_metadata(status, self.shard_index + 1);
        self.metadata.stage_time_ms = stage_times
            .iter()
            .map(|(name, t)| (name.clone(), t.as_secs_f64() * 1000.0))
            .collect();
        self.metadata.warnings = warnings;

        self.store.write_metadata(&self.metadata)?;
        closed?;

        tracing::info!(
            "Output {} finalized: {} rows in {} shard(s), status {}",
            self.store.describe(),
            self.metadata.records_written,
            self.metadata.shard_count,
            status
        );
        Ok(self.metadata.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;

    fn manager(store: MemoryStore, threshold: u64) -> ShardManager {
        let mut manager = ShardManager::new(
            Box::new(store),
            threshold,
            RunMetadata::new("test"),
            Metrics::new(),
        );
        manager.open(&ObservationSchema::default()).unwrap();
        manager
    }

    #[test]
    fn test_rotation_count() {
        // M = 25 records of r = 40 bytes with S = 200: floor(1000 / 200) = 5
        let store = MemoryStore::new().with_row_size(40);
        let output = store.output();
        let mut manager = manager(store, 200);

        for seq in 0..25 {
            manager.append(seq, &Record::new(seq, Vec::new())).unwrap();
        }
        assert_eq!(manager.shard_index(), 5);

        let meta = manager
            .finalize(RunStatus::Completed, &BTreeMap::new(), Vec::new())
            .unwrap();
        assert_eq!(meta.shard_count, 6);

        let out = output.lock().unwrap();
        assert_eq!(out.shards.len(), 6);
        assert_eq!(out.sequence_numbers(), (0..25).collect::<Vec<_>>());
        // one metadata line per rotation plus the final one
        assert_eq!(out.metadata.len(), 6);
        assert_eq!(out.metadata[0].status, RunStatus::Running);
        assert_eq!(out.metadata[0].records_written, 5);
        assert_eq!(out.metadata.last().unwrap().records_written, 25);
        assert!(out.closed);
    }

    #[test]
    fn test_rotation_count_with_uneven_rows() {
        // r = 30 does not divide S = 100: floor(10 * 30 / 100) = 3
        let store = MemoryStore::new().with_row_size(30);
        let output = store.output();
        let mut manager = manager(store, 100);

        for seq in 0..10 {
            manager.append(seq, &Record::new(seq, Vec::new())).unwrap();
        }
        assert_eq!(manager.shard_index(), 3);
        assert_eq!(manager.bytes_in_shard(), 0);

        let rows_per_shard: Vec<usize> = output.lock().unwrap().shards.iter().map(|s| s.len()).collect();
        assert_eq!(rows_per_shard, vec![4, 3, 3, 0]);
    }

    #[test]
    fn test_no_rotation_below_threshold() {
        let store = MemoryStore::new().with_row_size(10);
        let mut manager = manager(store, 1000);
        for seq in 0..99 {
            manager.append(seq, &Record::new(seq, Vec::new())).unwrap();
        }
        assert_eq!(manager.shard_index(), 0);
        assert_eq!(manager.bytes_in_shard(), 990);
    }

    #[test]
    fn test_failed_append_propagates() {
        let store = MemoryStore::new().failing_after(1);
        let mut manager = manager(store, 1000);
        manager.append(0, &Record::new(0, Vec::new())).unwrap();
        assert!(manager.append(1, &Record::new(1, Vec::new())).is_err());
    }
}
