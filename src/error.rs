//! Error taxonomy for the pipeline core.
//!
//! Three families matter to callers:
//!
//! - **Configuration** errors are detected before any worker starts and abort the run.
//! - **I/O** errors (source, output store) are fatal once the run is live and trigger
//!   an orderly drain so already-committed data stays valid.
//! - **Data anomalies** are never errors; they are logged with `tracing::warn!`.

use std::path::Path;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid run parameters.
    #[error("configuration error: {0}")]
    Config(String),

    /// A stage type string that is not registered.
    #[error("unknown stage type '{0}'")]
    UnknownStage(String),

    /// Adjacent stages disagree on the record shape passed between them.
    #[error("stage '{from}' outputs {output} but stage '{to}' expects {input}")]
    ChainMismatch {
        from: String,
        output: String,
        to: String,
        input: String,
    },

    /// Two stages declared the same observable with different kinds.
    #[error("observable '{field}' declared as {first} and {second}")]
    SchemaConflict {
        field: String,
        first: String,
        second: String,
    },

    /// The input contains no entries at all.
    #[error("input {0} has no entries")]
    EmptyInput(String),

    /// Filesystem failure with the path or operation that caused it.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// The source could not produce its next record.
    #[error("source failure at entry {entry}: {message}")]
    Source { entry: u64, message: String },

    /// A row or metadata record could not be serialized.
    #[error("encoding failure: {0}")]
    Encode(#[from] serde_json::Error),

    /// A sequence number reached the commit gate after it was already committed.
    #[error("sequence number {seq} committed twice (next expected {expected})")]
    DuplicateSequence { seq: u64, expected: u64 },

    /// A worker thread died outside of a stage transform.
    #[error("worker {0} panicked")]
    WorkerPanic(usize),
}

impl PipelineError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn io_path(action: &str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            context: format!("failed to {} {}", action, path.display()),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether this error belongs to the pre-start configuration family.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UnknownStage(_)
                | Self::ChainMismatch { .. }
                | Self::SchemaConflict { .. }
                | Self::EmptyInput(_)
        )
    }
}
