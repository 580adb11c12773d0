//! Record Runner
//!
//! Ordered multi-worker record processing: records are read from a source,
//! run through a chain of stages on several worker threads, and written to a
//! sharded JSON-lines output in exactly the order they were read.
//!
//! # Architecture
//!
//! - **Source**: yields records, one fetch at a time, behind the fetch gate
//! - **Stages**: configurable chain, cloned privately into every worker
//! - **Pipeline**: fetch gate, workers, commit gate and shard rotation
//! - **I/O**: JSON-lines output with optional zstd, metadata in the primary file
//! - **Control**: pause, step, verbosity, detach and stop while running
//!
//! # Usage
//!
//! ```no_run
//! use record_runner::{control::ControlPlane, run_pipeline, Config};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file("config.yaml".as_ref())?;
//!     let summary = run_pipeline(config, ControlPlane::quiet())?;
//!     println!("{}", summary);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod io;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod stage;

pub use config::{Config, Verbosity};
pub use error::{PipelineError, Result};
pub use io::{FileStore, OutputReader, OutputStore};
pub use pipeline::{Coordinator, CoordinatorOptions, Metrics, RunSummary};
pub use record::Record;
pub use source::{JsonLinesSource, RecordSource};
pub use stage::{Stage, StageChain, StageRegistry};

use control::ControlPlane;
use pipeline::MetricsReporter;

/// Run the full pipeline with the given configuration.
pub fn run_pipeline(mut config: Config, control: ControlPlane) -> anyhow::Result<RunSummary> {
    config.validate()?;
    config.normalize();

    tracing::info!("Starting record-runner");
    tracing::info!(
        "Input {}, output {}",
        config.input.path.display(),
        config.output.path.display()
    );

    let registry = StageRegistry::with_builtins();
    let chain = StageChain::from_config(&registry, &config.stages)?;

    let source = JsonLinesSource::open(&config.input.path)?;
    let store = FileStore::new(&config.output.path, config.output.compression_level)
        .with_payload(config.output.store_payload);

    let coordinator = Coordinator::new(
        CoordinatorOptions::from_config(&config),
        chain,
        Box::new(source),
        Box::new(store),
    )
    .with_control(control);
    let metrics = coordinator.metrics();

    let result = coordinator.run();

    MetricsReporter::new(metrics.clone()).print_summary();
    if let Some(ref path) = config.processing.metrics_output_path {
        if let Err(e) = metrics.snapshot().save_to_file(path) {
            tracing::warn!("Failed to save metrics to {}: {}", path.display(), e);
        }
    }

    let summary = result?;
    tracing::info!("Pipeline complete: {}", summary);
    Ok(summary)
}
