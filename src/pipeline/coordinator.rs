//! Run coordinator: setup, worker threads and supervision.
//!
//! The coordinator is the only thread that drives run-state transitions. It
//! starts the workers as scoped threads, then loops until all of them have
//! exited, polling the control plane and refreshing progress on the way.

use super::commit::{CommitGate, CommitOptions};
use super::context::{RunContext, RunState};
use super::fetch::FetchGate;
use super::metrics::{Metrics, MetricsSnapshot};
use super::shard::ShardManager;
use super::worker::{Worker, WorkerReport};
use crate::config::{Config, Verbosity, DEFAULT_SPLIT_SIZE, UNBOUNDED};
use crate::control::{progress_percent, ControlCommand, ControlPlane};
use crate::io::{OutputStore, RunMetadata, RunStatus, StageInfo};
use crate::record::{ObservationSchema, Record};
use crate::source::RecordSource;
use crate::stage::StageChain;
use crate::{PipelineError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::ScopedJoinHandle;
use std::time::{Duration, Instant};

/// How often the supervisor wakes up between progress refreshes.
const SUPERVISE_TICK: Duration = Duration::from_millis(10);

/// Run parameters, already normalized.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub worker_count: usize,
    /// Source entries to skip before the first fetch.
    pub first_record: u64,
    /// Records to fetch, `UNBOUNDED` for all.
    pub record_limit: u64,
    pub split_size_bytes: u64,
    pub compression_level: i32,
    pub commit: CommitOptions,
    pub progress_interval: Duration,
    pub verbosity: Verbosity,
    /// Push one empty record through a spare chain before the workers start.
    pub test_run: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            worker_count: 1,
            first_record: 0,
            record_limit: UNBOUNDED,
            split_size_bytes: DEFAULT_SPLIT_SIZE,
            compression_level: 0,
            commit: CommitOptions::default(),
            progress_interval: Duration::from_millis(200),
            verbosity: Verbosity::default(),
            test_run: true,
        }
    }
}

impl CoordinatorOptions {
    /// Options from a configuration that went through `Config::normalize`.
    pub fn from_config(config: &Config) -> Self {
        let p = &config.processing;
        Self {
            worker_count: p.worker_count,
            first_record: p.first_record,
            record_limit: config.record_limit(),
            split_size_bytes: config.output.split_size_bytes,
            compression_level: config.output.compression_level,
            commit: CommitOptions {
                ordered: p.sort_output_records,
                sequence_check: p.sequence_check,
                validate_observations: p.validate_observations,
            },
            progress_interval: Duration::from_millis(p.progress_interval_ms),
            verbosity: p.verbosity,
            test_run: p.use_test_run,
        }
    }
}

/// Outcome of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub status: RunStatus,
    pub worker_count: usize,
    pub records_skipped: u64,
    pub records_fetched: u64,
    /// Rows written to the output.
    pub records_written: u64,
    pub records_dropped: u64,
    pub shard_count: usize,
    pub elapsed: Duration,
    pub metadata: RunMetadata,
    pub metrics: MetricsSnapshot,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status: {}, Workers: {}, Fetched: {}, Written: {}, Dropped: {}, Shards: {}, Elapsed: {:.1}s",
            self.status,
            self.worker_count,
            self.records_fetched,
            self.records_written,
            self.records_dropped,
            self.shard_count,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Owns everything one run needs until [`Coordinator::run`] consumes it.
pub struct Coordinator {
    options: CoordinatorOptions,
    chain: StageChain,
    source: Box<dyn RecordSource>,
    store: Box<dyn OutputStore>,
    control: ControlPlane,
    metrics: Arc<Metrics>,
}

/// Supervisor bookkeeping between polls.
#[derive(Debug, Default)]
struct Supervision {
    /// Commit count that completes the pending steps.
    step_target: Option<u64>,
    stopped_by_user: bool,
}

impl Coordinator {
    pub fn new(
        options: CoordinatorOptions,
        chain: StageChain,
        source: Box<dyn RecordSource>,
        store: Box<dyn OutputStore>,
    ) -> Self {
        Self {
            options,
            chain,
            source,
            store,
            control: ControlPlane::quiet(),
            metrics: Metrics::new(),
        }
    }

    pub fn with_control(mut self, control: ControlPlane) -> Self {
        self.control = control;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Run to completion, user stop or fatal error.
    ///
    /// Configuration problems are reported before any worker starts. Errors
    /// raised while running are returned after the in-flight records were
    /// drained and the output was finalized.
    pub fn run(self) -> Result<RunSummary> {
        let Coordinator {
            mut options,
            mut chain,
            mut source,
            store,
            mut control,
            metrics,
        } = self;

        if chain.is_empty() {
            return Err(PipelineError::config("the stage chain is empty"));
        }
        chain.validate()?;
        let schema = Arc::new(chain.schema()?);

        if source.entries() == Some(0)
            || (source.entries().is_none() && source.total_bytes() == Some(0))
        {
            return Err(PipelineError::EmptyInput(source.describe()));
        }

        let skipped = if options.first_record > 0 {
            let skipped = source.skip(options.first_record)?;
            if skipped < options.first_record {
                tracing::warn!(
                    "Input ends after {} entries, before first_record {}",
                    skipped,
                    options.first_record
                );
            } else {
                tracing::info!("Skipped the first {} entries", skipped);
            }
            skipped
        } else {
            0
        };

        if let Some(reason) = single_worker_reason(&chain, options.verbosity) {
            if options.worker_count > 1 {
                tracing::warn!("{}, running with a single worker", reason);
            }
            options.worker_count = 1;
            control.set_pause_enabled(false);
        }
        let worker_count = options.worker_count.max(1);
        // every worker clone starts at the run's verbosity
        chain.set_verbosity(options.verbosity);
        if options.test_run {
            trial_run(&chain, &schema)?;
        }

        let ctx = Arc::new(RunContext::new(Arc::clone(&metrics), options.verbosity));

        let mut metadata = RunMetadata::new(source.describe());
        metadata.stages = chain
            .stages()
            .map(|stage| StageInfo {
                name: stage.name().to_string(),
                kind: stage.kind().to_string(),
                params: stage.describe(),
            })
            .collect();
        metadata.worker_count = worker_count;
        metadata.split_size_bytes = options.split_size_bytes;
        metadata.compression_level = options.compression_level;

        let mut shards = ShardManager::new(
            store,
            options.split_size_bytes,
            metadata,
            Arc::clone(&metrics),
        );
        shards.open(&schema)?;

        let fetch = FetchGate::new(source, options.record_limit, Arc::clone(&ctx));
        let commit = CommitGate::new(shards, Arc::clone(&schema), options.commit, Arc::clone(&ctx));

        tracing::info!(
            "Starting {} worker(s) over {} stage(s): {}",
            worker_count,
            chain.len(),
            chain.names().join(" -> ")
        );
        let started = Instant::now();
        ctx.control.start();

        let mut supervision = Supervision::default();
        let reports = std::thread::scope(|scope| {
            let mut handles: Vec<ScopedJoinHandle<'_, WorkerReport>> = Vec::with_capacity(worker_count);
            for id in 0..worker_count {
                let worker = Worker::new(id, chain.clone(), &fetch, &commit, &ctx);
                let spawned = std::thread::Builder::new()
                    .name(format!("worker-{}", id))
                    .spawn_scoped(scope, move || worker.run());
                match spawned {
                    Ok(handle) => handles.push(handle),
                    Err(e) => {
                        ctx.fail(PipelineError::io(format!("spawn worker {}", id), e));
                        break;
                    }
                }
            }

            let mut last_refresh: Option<Instant> = None;
            while !handles.iter().all(|h| h.is_finished()) {
                for command in control.poll(commit.committed()) {
                    apply_command(command, &mut control, &ctx, &fetch, &commit, &mut supervision);
                }

                if let Some(target) = supervision.step_target {
                    let committed = commit.committed();
                    // a step that ran into the end of the input has nothing to wait for
                    let reached = committed >= target
                        || (fetch.is_drained() && committed >= fetch.fetched());
                    if reached && ctx.control.finish_step() {
                        supervision.step_target = None;
                        tracing::debug!("Step done after {} commits", committed);
                    }
                }

                if last_refresh.map_or(true, |t| t.elapsed() >= options.progress_interval) {
                    refresh_progress(&mut control, &ctx, &fetch, &commit, options.record_limit, skipped);
                    last_refresh = Some(Instant::now());
                }
                std::thread::sleep(SUPERVISE_TICK.min(options.progress_interval));
            }

            let mut reports = Vec::with_capacity(handles.len());
            for (id, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(report) => reports.push(report),
                    Err(_) => ctx.fail(PipelineError::WorkerPanic(id)),
                }
            }
            reports
        });

        refresh_progress(&mut control, &ctx, &fetch, &commit, options.record_limit, skipped);

        let status = if ctx.has_failed() {
            RunStatus::Failed
        } else if supervision.stopped_by_user {
            RunStatus::Stopped
        } else {
            RunStatus::Completed
        };

        let mut stage_times: BTreeMap<String, Duration> = BTreeMap::new();
        let mut warnings = Vec::new();
        for report in reports {
            tracing::debug!(
                "Worker {} processed {} records, dropped {}",
                report.id,
                report.processed,
                report.dropped
            );
            for (name, spent) in report.stage_times {
                *stage_times.entry(name).or_default() += spent;
            }
            warnings.extend(report.warnings);
        }

        let records_fetched = fetch.fetched();
        let finalized = commit.into_shards().finalize(status, &stage_times, warnings);
        ctx.control.finish();
        control.finish();

        let metadata = match (finalized, ctx.take_error()) {
            (Ok(metadata), None) => metadata,
            (Err(e), None) => return Err(e),
            (finalized, Some(err)) => {
                if let Err(e) = finalized {
                    tracing::error!("Output could not be finalized: {}", e);
                }
                return Err(err);
            }
        };

        let summary = RunSummary {
            status,
            worker_count,
            records_skipped: skipped,
            records_fetched,
            records_written: metadata.records_written,
            records_dropped: metadata.records_dropped,
            shard_count: metadata.shard_count,
            elapsed: started.elapsed(),
            metadata,
            metrics: metrics.snapshot(),
        };
        tracing::info!("Run finished: {}", summary);
        Ok(summary)
    }
}

/// Run one empty record through a throwaway clone of the chain.
///
/// A stage that cannot start or panics fails the run before any output is
/// created. Undeclared fields on the result are only logged.
fn trial_run(chain: &StageChain, schema: &ObservationSchema) -> Result<()> {
    let mut trial = chain.clone();
    trial.begin()?;
    let outcome = catch_unwind(AssertUnwindSafe(|| trial.run(Record::new(0, Vec::new()))))
        .map_err(|_| PipelineError::config("test run failed: a stage panicked on an empty record"))?;

    match outcome.record {
        Some(record) => {
            for violation in schema.check(&record.observations) {
                tracing::warn!("Test run: {}", violation);
            }
        }
        None => tracing::debug!(
            "Test run record dropped by {}",
            outcome.dropped_by.as_deref().unwrap_or("a stage")
        ),
    }
    tracing::debug!("Test run passed");
    Ok(())
}

/// Why the run must use exactly one worker, if it must.
fn single_worker_reason(chain: &StageChain, verbosity: Verbosity) -> Option<String> {
    if let Some(stage) = chain.single_worker_stage() {
        return Some(format!("stage \"{}\" needs a single worker", stage));
    }
    if verbosity >= Verbosity::Debug {
        return Some(format!("verbosity {} needs a single worker", verbosity));
    }
    None
}

fn apply_command(
    command: ControlCommand,
    control: &mut ControlPlane,
    ctx: &RunContext,
    fetch: &FetchGate,
    commit: &CommitGate,
    supervision: &mut Supervision,
) {
    tracing::debug!("Control command {:?}", command);
    match command {
        ControlCommand::TogglePause => {
            if !control.pause_enabled() {
                control.show("Pause is disabled for this run");
                return;
            }
            match ctx.control.toggle_pause() {
                RunState::Paused => control.show("Paused, \"p\" resumes, \"n\" steps one record"),
                RunState::Running => {
                    supervision.step_target = None;
                    control.show("Resumed");
                }
                _ => {}
            }
        }
        ControlCommand::Step => {
            if !control.pause_enabled() {
                control.show("Pause is disabled for this run");
                return;
            }
            // read before granting the permit, which a worker may use at once
            let fetched = fetch.fetched();
            if ctx.control.step() {
                // records in flight at the pause are committed first
                let base = supervision.step_target.unwrap_or(fetched);
                supervision.step_target = Some(base + 1);
            } else {
                control.show("Stepping only works while paused");
            }
        }
        ControlCommand::PrintLast => control.show_record(commit.last_committed().as_ref()),
        ControlCommand::Verbosity(level) => {
            ctx.set_verbosity(level);
            control.apply_verbosity(level);
            control.show(&format!("Verbosity set to {}", level));
        }
        ControlCommand::Detach(path) => {
            if matches!(ctx.control.state(), RunState::Paused | RunState::Stepping) {
                ctx.control.toggle_pause();
                supervision.step_target = None;
            }
            if let Err(e) = control.detach(path) {
                tracing::warn!("Detach failed: {}", e);
            }
        }
        ControlCommand::Quit => {
            if !supervision.stopped_by_user {
                tracing::info!("Stop requested, finishing the records in flight");
            }
            supervision.stopped_by_user = true;
            ctx.control.request_stop();
        }
    }
}

fn refresh_progress(
    control: &mut ControlPlane,
    ctx: &RunContext,
    fetch: &FetchGate,
    commit: &CommitGate,
    record_limit: u64,
    skipped: u64,
) {
    let source = fetch.progress();
    let processed = commit.committed();
    let percent = progress_percent(record_limit, processed, skipped, &source);
    let hint = match ctx.control.state() {
        RunState::Paused | RunState::Stepping => "(Paused: \"p\" resume, \"n\" step)",
        RunState::Stopping => "(Stopping)",
        _ => "",
    };
    control.report(source.bytes_read, percent, processed, hint);
}
