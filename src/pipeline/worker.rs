//! Worker loop: fetch, transform with a private chain, commit.

use super::commit::CommitGate;
use super::context::RunContext;
use super::fetch::{FetchGate, Fetched};
use crate::stage::StageChain;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

/// What a worker reports when it exits.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub id: usize,
    /// Records this worker fetched and committed.
    pub processed: u64,
    pub dropped: u64,
    pub stage_times: Vec<(String, Duration)>,
    /// Warnings returned by `Stage::finish`, prefixed with the stage name.
    pub warnings: Vec<String>,
}

/// One worker thread's state. Owns its chain; borrows the shared gates.
pub struct Worker<'a> {
    id: usize,
    chain: StageChain,
    fetch: &'a FetchGate,
    commit: &'a CommitGate,
    ctx: &'a RunContext,
    verbosity_epoch: u64,
}

impl<'a> Worker<'a> {
    pub fn new(
        id: usize,
        chain: StageChain,
        fetch: &'a FetchGate,
        commit: &'a CommitGate,
        ctx: &'a RunContext,
    ) -> Self {
        Self {
            id,
            chain,
            fetch,
            commit,
            ctx,
            verbosity_epoch: ctx.verbosity_epoch(),
        }
    }

    /// Apply a verbosity change broadcast since the last record.
    fn sync_verbosity(&mut self) {
        let epoch = self.ctx.verbosity_epoch();
        if epoch != self.verbosity_epoch {
            self.verbosity_epoch = epoch;
            let level = self.ctx.verbosity();
            if level != self.chain.verbosity() {
                tracing::debug!("Worker {} switching stages to {} verbosity", self.id, level);
                self.chain.set_verbosity(level);
            }
        }
    }

    /// Run until the fetch gate reports end of stream.
    pub fn run(mut self) -> WorkerReport {
        let mut report = WorkerReport {
            id: self.id,
            ..Default::default()
        };

        let (fetch, commit, ctx) = (self.fetch, self.commit, self.ctx);

        if let Err(e) = self.chain.begin() {
            ctx.fail(e);
            return report;
        }
        tracing::debug!("Worker {} started", self.id);

        loop {
            let (seq, record) = match fetch.fetch() {
                Fetched::Record { seq, record } => (seq, record),
                Fetched::EndOfStream => break,
            };
            let ticket = commit.ticket(seq);
            self.sync_verbosity();

            let id = record.id;
            let chain = &mut self.chain;
            let outcome = catch_unwind(AssertUnwindSafe(|| chain.run(record)));
            report.processed += 1;

            match outcome {
                Ok(outcome) => {
                    ctx.metrics.add_transform_time(outcome.elapsed);
                    if let Some(stage) = &outcome.dropped_by {
                        tracing::debug!("Record {} (seq {}) dropped by {}", id, seq, stage);
                        report.dropped += 1;
                    }
                    ticket.commit(outcome.record);
                }
                Err(_) => {
                    ctx.metrics.add_stage_panic();
                    tracing::warn!(
                        "A stage panicked on record {} (seq {}), the record is dropped",
                        id,
                        seq
                    );
                    report.dropped += 1;
                    ticket.commit(None);
                }
            }
        }

        report.warnings = self.chain.finish();
        for warning in &report.warnings {
            tracing::warn!("Worker {}: {}", self.id, warning);
        }
        report.stage_times = self.chain.timings();
        tracing::debug!("Worker {} finished after {} records", self.id, report.processed);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;
    use crate::io::{MemoryStore, RunMetadata};
    use crate::pipeline::commit::CommitOptions;
    use crate::pipeline::shard::ShardManager;
    use crate::pipeline::Metrics;
    use crate::record::{ObservationSchema, Record};
    use crate::source::MemorySource;
    use crate::stage::{EveryNthCut, PayloadLength, Stage, StageOutcome};
    use std::sync::Arc;

    #[derive(Clone)]
    struct PanicOn(u64);

    impl Stage for PanicOn {
        fn name(&self) -> &str {
            "panic_on"
        }
        fn kind(&self) -> &'static str {
            "panic_on"
        }
        fn transform(&mut self, record: Record) -> StageOutcome {
            if record.id == self.0 {
                panic!("bad record");
            }
            StageOutcome::Keep(record)
        }
        fn clone_box(&self) -> Box<dyn Stage> {
            Box::new(self.clone())
        }
    }

    fn run_single(chain: StageChain, count: u64) -> (WorkerReport, Vec<u64>, Arc<RunContext>) {
        let ctx = Arc::new(RunContext::new(Metrics::new(), Verbosity::Essential));
        ctx.control.start();
        let store = MemoryStore::new();
        let output = store.output();
        let mut shards =
            ShardManager::new(Box::new(store), u64::MAX, RunMetadata::new("t"), ctx.metrics.clone());
        shards.open(&ObservationSchema::default()).unwrap();

        let fetch = FetchGate::new(Box::new(MemorySource::sequential(count)), u64::MAX, ctx.clone());
        let commit = CommitGate::new(
            shards,
            Arc::new(ObservationSchema::default()),
            CommitOptions::default(),
            ctx.clone(),
        );
        let report = Worker::new(0, chain, &fetch, &commit, &ctx).run();
        let seqs = output.lock().unwrap().sequence_numbers();
        (report, seqs, ctx)
    }

    #[test]
    fn test_worker_processes_everything() {
        let chain = StageChain::new(vec![
            Box::new(PayloadLength::new("len")),
            Box::new(EveryNthCut::new("nth", 2)),
        ]);
        let (report, seqs, _ctx) = run_single(chain, 10);
        assert_eq!(report.processed, 10);
        assert_eq!(report.dropped, 5);
        assert_eq!(seqs, vec![0, 2, 4, 6, 8]);
        assert_eq!(report.stage_times.len(), 2);
    }

    #[test]
    fn test_stage_panic_drops_record() {
        let chain = StageChain::new(vec![Box::new(PanicOn(3))]);
        let (report, seqs, ctx) = run_single(chain, 5);
        assert_eq!(report.processed, 5);
        assert_eq!(seqs, vec![0, 1, 2, 4]);
        assert_eq!(ctx.metrics.snapshot().stage_panics, 1);
        assert!(!ctx.has_failed());
    }
}
