//! Throughput monitoring and metrics collection.

use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const MB: f64 = 1024.0 * 1024.0;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Metrics for a pipeline run, shared by the gates and workers.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total bytes consumed from the source
    pub bytes_read: AtomicU64,

    /// Total row bytes handed to the output store
    pub bytes_written: AtomicU64,

    /// Records handed out by the fetch gate
    pub records_fetched: AtomicU64,

    /// Rows appended to the output
    pub records_written: AtomicU64,

    /// Records dropped by a stage (no-op commits)
    pub records_dropped: AtomicU64,

    /// Shard rotations
    pub shard_rotations: AtomicU64,

    /// Stale or repeated sequence numbers seen at commit
    pub duplicate_sequences: AtomicU64,

    /// Schema violations found while validating observations
    pub schema_violations: AtomicU64,

    /// Stage transforms that panicked
    pub stage_panics: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-component timing (in microseconds for precision)
    /// Time spent pulling records from the source (microseconds)
    pub read_us: AtomicU64,

    /// Time spent in stage transforms, summed over workers (microseconds)
    pub transform_us: AtomicU64,

    /// Time spent appending to the output store (microseconds)
    pub write_us: AtomicU64,

    /// Time workers spent waiting for their turn at the commit gate (microseconds)
    pub commit_wait_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    /// Record bytes read.
    pub fn add_bytes_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes written.
    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_record_fetched(&self) {
        self.records_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_record_dropped(&self) {
        self.records_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_shard_rotation(&self) {
        self.shard_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_duplicate_sequence(&self) {
        self.duplicate_sequences.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_schema_violations(&self, count: u64) {
        self.schema_violations.fetch_add(count, Ordering::Relaxed);
    }

    pub fn add_stage_panic(&self) {
        self.stage_panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent reading from the source.
    pub fn add_read_time(&self, duration: Duration) {
        self.read_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent in stage transforms.
    pub fn add_transform_time(&self, duration: Duration) {
        self.transform_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent writing output.
    pub fn add_write_time(&self, duration: Duration) {
        self.write_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record time spent waiting at the ordering barrier.
    pub fn add_commit_wait(&self, duration: Duration) {
        self.commit_wait_us.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Get read throughput in MB/s over the whole run.
    pub fn read_throughput_mbps(&self) -> f64 {
        let bytes = self.bytes_read.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            bytes as f64 / MB / elapsed
        } else {
            0.0
        }
    }

    /// Get committed records per second.
    pub fn records_per_second(&self) -> f64 {
        let records = self.records_written.load(Ordering::Relaxed)
            + self.records_dropped.load(Ordering::Relaxed);
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            records as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            records_fetched: self.records_fetched.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
            shard_rotations: self.shard_rotations.load(Ordering::Relaxed),
            duplicate_sequences: self.duplicate_sequences.load(Ordering::Relaxed),
            schema_violations: self.schema_violations.load(Ordering::Relaxed),
            stage_panics: self.stage_panics.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            read_throughput_mbps: self.read_throughput_mbps(),
            records_per_second: self.records_per_second(),
            read_secs: secs(&self.read_us),
            transform_secs: secs(&self.transform_us),
            write_secs: secs(&self.write_us),
            commit_wait_secs: secs(&self.commit_wait_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub records_fetched: u64,
    pub records_written: u64,
    pub records_dropped: u64,
    pub shard_rotations: u64,
    pub duplicate_sequences: u64,
    pub schema_violations: u64,
    pub stage_panics: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub read_throughput_mbps: f64,
    pub records_per_second: f64,
    /// Total time spent reading the source (seconds)
    pub read_secs: f64,
    /// Total CPU time spent in stages (seconds, summed across workers)
    pub transform_secs: f64,
    /// Total time spent writing output (seconds)
    pub write_secs: f64,
    /// Total time workers waited for their commit turn (seconds, summed across workers)
    pub commit_wait_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_component_time = self.read_secs + self.transform_secs + self.write_secs;
        let (read_pct, transform_pct, write_pct) = if total_component_time > 0.0 {
            (
                self.read_secs / total_component_time * 100.0,
                self.transform_secs / total_component_time * 100.0,
                self.write_secs / total_component_time * 100.0,
            )
        } else {
            (0.0, 0.0, 0.0)
        };

        write!(
            f,
            "Records: {} fetched, {} written, {} dropped | Shards: {} | \
             Read: {:.2} MB @ {:.2} MB/s | Write: {:.2} MB | \
             Rate: {:.1} records/s | Elapsed: {:.1}s | \
             Time: read {:.0}% | stages {:.0}% | write {:.0}%",
            self.records_fetched,
            self.records_written,
            self.records_dropped,
            self.shard_rotations + 1,
            self.bytes_read as f64 / MB,
            self.read_throughput_mbps,
            self.bytes_written as f64 / MB,
            self.records_per_second,
            self.elapsed.as_secs_f64(),
            read_pct,
            transform_pct,
            write_pct,
        )
    }
}

/// End-of-run reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
}

impl MetricsReporter {
    /// Create a new metrics reporter.
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self { metrics }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Records fetched: {}", snapshot.records_fetched);
        println!("Records written: {}", snapshot.records_written);
        println!("Records dropped: {}", snapshot.records_dropped);
        println!("Output shards: {}", snapshot.shard_rotations + 1);
        println!("Data read: {:.2} MB", snapshot.bytes_read as f64 / MB);
        println!("Data written: {:.2} MB", snapshot.bytes_written as f64 / MB);
        println!("Read throughput: {:.2} MB/s", snapshot.read_throughput_mbps);
        println!("Processing rate: {:.1} records/s", snapshot.records_per_second);

        if snapshot.duplicate_sequences > 0 || snapshot.schema_violations > 0 || snapshot.stage_panics > 0 {
            println!("\n--- Anomalies ---");
            println!("Duplicate sequence numbers: {}", snapshot.duplicate_sequences);
            println!("Schema violations: {}", snapshot.schema_violations);
            println!("Stage panics: {}", snapshot.stage_panics);
        }

        let total_component = snapshot.read_secs + snapshot.transform_secs + snapshot.write_secs;
        if total_component > 0.0 {
            println!("\n--- Component Time Breakdown ---");
            println!("Source read: {:>7.1}s ({:>5.1}%)", snapshot.read_secs, snapshot.read_secs / total_component * 100.0);
            println!("Stages:      {:>7.1}s ({:>5.1}%)", snapshot.transform_secs, snapshot.transform_secs / total_component * 100.0);
            println!("Output:      {:>7.1}s ({:>5.1}%)", snapshot.write_secs, snapshot.write_secs / total_component * 100.0);
            println!("Commit wait: {:>7.1}s", snapshot.commit_wait_secs);
        }
        println!("========================\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.add_bytes_read(1000);
        metrics.add_bytes_read(500);

        assert_eq!(metrics.bytes_read.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_metrics_snapshot() {
        let metrics = Metrics::new();

        metrics.add_record_fetched();
        metrics.add_record_fetched();
        metrics.add_record_written();
        metrics.add_record_dropped();
        metrics.add_shard_rotation();
        metrics.add_schema_violations(3);

        let snapshot = metrics.snapshot();

        assert_eq!(snapshot.records_fetched, 2);
        assert_eq!(snapshot.records_written, 1);
        assert_eq!(snapshot.records_dropped, 1);
        assert_eq!(snapshot.shard_rotations, 1);
        assert_eq!(snapshot.schema_violations, 3);
    }

    #[test]
    fn test_timing_metrics() {
        let metrics = Metrics::new();

        metrics.add_read_time(Duration::from_millis(100));
        metrics.add_transform_time(Duration::from_millis(50));
        metrics.add_write_time(Duration::from_millis(75));
        metrics.add_commit_wait(Duration::from_millis(5));

        let snapshot = metrics.snapshot();

        assert!((snapshot.read_secs - 0.1).abs() < 0.001);
        assert!((snapshot.transform_secs - 0.05).abs() < 0.001);
        assert!((snapshot.write_secs - 0.075).abs() < 0.001);
        assert!((snapshot.commit_wait_secs - 0.005).abs() < 0.001);
    }

    #[test]
    fn test_snapshot_display() {
        let metrics = Metrics::new();
        for _ in 0..100 {
            metrics.add_record_fetched();
            metrics.add_record_written();
        }
        metrics.add_shard_rotation();

        let display = format!("{}", metrics.snapshot());

        assert!(display.contains("100 fetched"));
        assert!(display.contains("100 written"));
        assert!(display.contains("Shards: 2"));
    }

    #[test]
    fn test_zero_elapsed_no_panic() {
        let metrics = Metrics {
            start_time: None,
            ..Default::default()
        };

        metrics.add_bytes_read(1000);

        assert_eq!(metrics.read_throughput_mbps(), 0.0);
        assert_eq!(metrics.records_per_second(), 0.0);
    }

    #[test]
    fn test_save_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let metrics = Metrics::new();
        metrics.add_record_written();
        metrics.snapshot().save_to_file(&path).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["records_written"], 1);
    }
}
