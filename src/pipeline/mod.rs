//! The ordered multi-worker pipeline.
//!
//! Records flow `FetchGate -> Worker (private StageChain) -> CommitGate ->
//! ShardManager -> OutputStore`. The fetch gate numbers records densely and
//! the commit gate writes them back in that order, whatever the number of
//! workers in between.

mod commit;
mod context;
mod coordinator;
mod fetch;
mod metrics;
mod shard;
mod worker;


pub use commit::{CommitGate, CommitOptions, CommitTicket};
pub use context::{FetchPermit, RunContext, RunControl, RunState};
pub use coordinator::{Coordinator, CoordinatorOptions, RunSummary};
pub use fetch::{FetchGate, Fetched, SourceProgress};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use shard::ShardManager;
pub use worker::{Worker, WorkerReport};
