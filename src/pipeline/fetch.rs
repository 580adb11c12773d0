//! The fetch gate: the single, serialized entry point to the source.
//!
//! Sequence numbers are assigned here, under the same lock that reads the
//! source, so the set of handed-out numbers is always `0..fetched`.

use super::context::{FetchPermit, RunContext};
use crate::record::Record;
use crate::source::RecordSource;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// What a worker gets from the fetch gate.
#[derive(Debug)]
pub enum Fetched {
    Record { seq: u64, record: Record },
    EndOfStream,
}

struct FetchInner {
    source: Box<dyn RecordSource>,
    next_seq: u64,
    exhausted: bool,
}

/// Source position figures for the progress estimator, readable without the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceProgress {
    pub bytes_read: u64,
    pub total_bytes: Option<u64>,
    pub position: u64,
    pub entries: Option<u64>,
}

pub struct FetchGate {
    inner: Mutex<FetchInner>,
    ctx: Arc<RunContext>,
    limit: u64,
    fetched: AtomicU64,
    /// Set once no further record will be handed out.
    drained: AtomicBool,
    bytes_read: AtomicU64,
    position: AtomicU64,
    total_bytes: Option<u64>,
    entries: Option<u64>,
}

impl FetchGate {
    /// `limit` caps the number of records handed out; `u64::MAX` for no cap.
    pub fn new(source: Box<dyn RecordSource>, limit: u64, ctx: Arc<RunContext>) -> Self {
        let bytes_read = source.bytes_read();
        let position = source.position();
        let total_bytes = source.total_bytes();
        let entries = source.entries();
        Self {
            inner: Mutex::new(FetchInner {
                source,
                next_seq: 0,
                exhausted: false,
            }),
            ctx,
            limit,
            fetched: AtomicU64::new(0),
            drained: AtomicBool::new(false),
            bytes_read: AtomicU64::new(bytes_read),
            position: AtomicU64::new(position),
            total_bytes,
            entries,
        }
    }

    /// Hand out the next record with its sequence number.
    ///
    /// Blocks while the run is paused. Returns `EndOfStream` once the source
    /// is exhausted, the limit is reached, the run is stopping, or the source
    /// failed (the failure is reported to the run context first).
    pub fn fetch(&self) -> Fetched {
        if self.ctx.control.wait_for_fetch() == FetchPermit::Stop {
            return Fetched::EndOfStream;
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.exhausted || inner.next_seq >= self.limit {
            self.drained.store(true, Ordering::Release);
            return Fetched::EndOfStream;
        }

        let start = Instant::now();
        let result = inner.source.next_record();
        self.ctx.metrics.add_read_time(start.elapsed());

        let bytes_now = inner.source.bytes_read();
        let bytes_before = self.bytes_read.swap(bytes_now, Ordering::Relaxed);
        self.ctx.metrics.add_bytes_read(bytes_now.saturating_sub(bytes_before));
        self.position.store(inner.source.position(), Ordering::Relaxed);

        match result {
            Ok(Some(record)) => {
                let seq = inner.next_seq;
                inner.next_seq += 1;
                self.fetched.store(inner.next_seq, Ordering::Release);
                self.ctx.metrics.add_record_fetched();
                tracing::trace!("Fetched record {} as seq {}", record.id, seq);
                Fetched::Record { seq, record }
            }
            Ok(None) => {
                inner.exhausted = true;
                self.drained.store(true, Ordering::Release);
                tracing::debug!("Source exhausted after {} records", inner.next_seq);
                Fetched::EndOfStream
            }
            Err(e) => {
                inner.exhausted = true;
                self.drained.store(true, Ordering::Release);
                drop(inner);
                self.ctx.fail(e);
                Fetched::EndOfStream
            }
        }
    }

    /// Number of records handed out so far.
    pub fn fetched(&self) -> u64 {
        self.fetched.load(Ordering::Acquire)
    }

    /// True once the source is exhausted or the limit was reached.
    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> SourceProgress {
        SourceProgress {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            total_bytes: self.total_bytes,
            position: self.position.load(Ordering::Relaxed),
            entries: self.entries,
        }
    }
}
