//! The commit gate: restores fetch order before rows reach the output.
//!
//! In ordered mode a committer waits on the condition variable until the
//! gate's `next_seq` equals its own sequence number. Because sequence numbers
//! are dense, `next_seq` is always the smallest number not yet committed, so
//! exactly one waiter can proceed at a time and nobody polls.

use super::context::RunContext;
use super::shard::ShardManager;
use crate::config::SequenceCheck;
use crate::record::{ObservationSchema, Record};
use crate::PipelineError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

/// Commit behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct CommitOptions {
    /// Wait for fetch order before appending.
    pub ordered: bool,
    pub sequence_check: SequenceCheck,
    /// Check every row against the observation schema.
    pub validate_observations: bool,
}

impl Default for CommitOptions {
    fn default() -> Self {
        Self {
            ordered: true,
            sequence_check: SequenceCheck::Strict,
            validate_observations: false,
        }
    }
}

struct CommitState {
    next_seq: u64,
    shards: ShardManager,
    last: Option<(u64, Record)>,
    /// Set after a write failure; later rows are discarded.
    failed: bool,
}

pub struct CommitGate {
    state: Mutex<CommitState>,
    turn: Condvar,
    ctx: Arc<RunContext>,
    schema: Arc<ObservationSchema>,
    options: CommitOptions,
    committed: AtomicU64,
}

impl CommitGate {
    pub fn new(
        shards: ShardManager,
        schema: Arc<ObservationSchema>,
        options: CommitOptions,
        ctx: Arc<RunContext>,
    ) -> Self {
        Self {
            state: Mutex::new(CommitState {
                next_seq: 0,
                shards,
                last: None,
                failed: false,
            }),
            turn: Condvar::new(),
            ctx,
            schema,
            options,
            committed: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CommitState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Obligation to commit `seq`. Dropping it unused commits a no-op.
    pub fn ticket(&self, seq: u64) -> CommitTicket<'_> {
        CommitTicket {
            gate: self,
            seq,
            done: false,
        }
    }

    /// Commit slots consumed so far, written rows and drops alike.
    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Copy of the most recently written row.
    pub fn last_committed(&self) -> Option<(u64, Record)> {
        self.lock().last.clone()
    }

    /// Commit `seq`; `None` consumes the slot without writing a row.
    fn commit(&self, seq: u64, record: Option<Record>) {
        let wait_start = Instant::now();
        let mut state = self.lock();

        if self.options.ordered {
            // re-checked on every wake-up: another holder of `seq` may have
            // committed it while this one was waiting
            loop {
                if seq < state.next_seq {
                    self.reject_stale(state, seq, record);
                    return;
                }
                if seq == state.next_seq {
                    break;
                }
                state = self
                    .turn
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            self.ctx.metrics.add_commit_wait(wait_start.elapsed());
        }

        self.write(&mut state, seq, record);
        state.next_seq += 1;
        self.committed.fetch_add(1, Ordering::Release);
        drop(state);
        self.turn.notify_all();
    }

    /// Handle a sequence number that was already committed.
    fn reject_stale(&self, mut state: MutexGuard<'_, CommitState>, seq: u64, record: Option<Record>) {
        self.ctx.metrics.add_duplicate_sequence();
        let expected = state.next_seq;
        match self.options.sequence_check {
            SequenceCheck::Strict => {
                drop(state);
                debug_assert!(
                    false,
                    "sequence number {} committed twice (next expected {})",
                    seq, expected
                );
                self.ctx.fail(PipelineError::DuplicateSequence { seq, expected });
            }
            SequenceCheck::Lenient => {
                tracing::warn!(
                    "Sequence number {} was already committed (next expected {}), appending anyway",
                    seq,
                    expected
                );
                self.write(&mut state, seq, record);
            }
        }
    }

    fn write(&self, state: &mut CommitState, seq: u64, record: Option<Record>) {
        let Some(record) = record else {
            self.ctx.metrics.add_record_dropped();
            return;
        };
        if state.failed {
            tracing::trace!("Discarding seq {} after output failure", seq);
            return;
        }

        if self.options.validate_observations {
            let violations = self.schema.check(&record.observations);
            if !violations.is_empty() {
                self.ctx.metrics.add_schema_violations(violations.len() as u64);
                for violation in &violations {
                    tracing::warn!("Record {} (seq {}): {}", record.id, seq, violation);
                }
            }
        }

        match state.shards.append(seq, &record) {
            Ok(()) => state.last = Some((seq, record)),
            Err(e) => {
                state.failed = true;
                self.ctx.fail(e);
            }
        }
    }

    /// Hand the shard manager back once every worker has finished.
    pub fn into_shards(self) -> ShardManager {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .shards
    }
}

/// A fetched sequence number that still has to be committed.
///
/// If the ticket is dropped without [`CommitTicket::commit`], for instance
/// while a worker unwinds, it commits a no-op so later sequence numbers are
/// not blocked forever.
#[must_use = "a ticket must be committed"]
pub struct CommitTicket<'a> {
    gate: &'a CommitGate,
    seq: u64,
    done: bool,
}

impl CommitTicket<'_> {
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Commit the transformed record, or `None` for a dropped record.
    pub fn commit(mut self, record: Option<Record>) {
        self.done = true;
        self.gate.commit(self.seq, record);
    }
}

impl Drop for CommitTicket<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!("Sequence {} abandoned, committing a no-op", self.seq);
            self.gate.commit(self.seq, None);
        }
    }
}
