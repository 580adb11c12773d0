//! Per-record transformation stages and the ordered chain each worker owns.
//!
//! A stage exposes its input and output shape, the observables it fills in and
//! a `transform` that either keeps (possibly rewritten) or drops the record.
//! Every worker gets its own clone of the chain, so `transform` takes
//! `&mut self` and stages may keep private per-worker state.

mod builtin;
mod registry;

pub use builtin::{
    EveryNthCut, Inspect, JsonField, Passthrough, PayloadChecksum, PayloadLength, RangeCut, Tag,
};
pub use registry::{StageFactory, StageRegistry};

use crate::config::{StageConfig, Verbosity};
use crate::record::{FieldDef, ObservationSchema, Record};
use crate::{PipelineError, Result};
use std::fmt;
use std::time::{Duration, Instant};

/// Shape of the record a stage accepts or produces.
///
/// `Any` is compatible with everything; named shapes must match exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Any,
    Named(String),
}

impl Shape {
    pub fn named(name: impl Into<String>) -> Self {
        Shape::Named(name.into())
    }

    pub fn accepts(&self, other: &Shape) -> bool {
        match (self, other) {
            (Shape::Any, _) | (_, Shape::Any) => true,
            (Shape::Named(a), Shape::Named(b)) => a == b,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Any => f.write_str("any"),
            Shape::Named(name) => f.write_str(name),
        }
    }
}

/// What a stage did with a record.
#[derive(Debug)]
pub enum StageOutcome {
    Keep(Record),
    Drop,
}

/// One transformation step.
pub trait Stage: Send {
    /// Instance name from configuration.
    fn name(&self) -> &str;

    /// Registry type key.
    fn kind(&self) -> &'static str;

    fn input_shape(&self) -> Shape {
        Shape::Any
    }

    fn output_shape(&self) -> Shape {
        Shape::Any
    }

    /// Observable fields this stage writes onto records.
    fn observables(&self) -> Vec<FieldDef> {
        Vec::new()
    }

    /// Stages that cannot run concurrently with clones of themselves.
    fn single_worker_only(&self) -> bool {
        false
    }

    fn verbosity(&self) -> Verbosity {
        Verbosity::default()
    }

    fn set_verbosity(&mut self, _level: Verbosity) {}

    /// Called once per worker before the first record.
    fn begin(&mut self) -> Result<()> {
        Ok(())
    }

    fn transform(&mut self, record: Record) -> StageOutcome;

    /// Called once per worker after the last record. Returns warnings to report.
    fn finish(&mut self) -> Vec<String> {
        Vec::new()
    }

    /// Stage parameters recorded in the run metadata.
    fn describe(&self) -> serde_json::Value {
        serde_json::Value::Null
    }

    fn clone_box(&self) -> Box<dyn Stage>;
}

impl Clone for Box<dyn Stage> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Result of running the whole chain over one record.
#[derive(Debug)]
pub struct ChainOutcome {
    /// `None` when some stage dropped the record.
    pub record: Option<Record>,
    /// Name of the stage that dropped the record.
    pub dropped_by: Option<String>,
    pub elapsed: Duration,
}

/// Ordered list of stages. Cloned once per worker.
#[derive(Clone, Default)]
pub struct StageChain {
    stages: Vec<Box<dyn Stage>>,
    timings: Vec<Duration>,
    verbosity: Verbosity,
}

impl fmt::Debug for StageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.stages.iter().map(|s| format!("{}:{}", s.kind(), s.name())))
            .finish()
    }
}

impl StageChain {
    pub fn new(stages: Vec<Box<dyn Stage>>) -> Self {
        let timings = vec![Duration::ZERO; stages.len()];
        Self {
            stages,
            timings,
            verbosity: Verbosity::default(),
        }
    }

    /// Resolve stage configurations through the registry.
    ///
    /// Disabled entries and entries without a name are skipped with a warning,
    /// an unknown type is an error.
    pub fn from_config(registry: &StageRegistry, configs: &[StageConfig]) -> Result<Self> {
        let unknown: Vec<&str> = configs
            .iter()
            .filter(|c| c.enabled && !c.name.is_empty() && !registry.contains(&c.kind))
            .map(|c| c.kind.as_str())
            .collect();
        if let Some(first) = unknown.first() {
            tracing::error!(
                "Unknown stage type(s) {}, available: {}",
                unknown.join(", "),
                registry.kinds().collect::<Vec<_>>().join(", ")
            );
            return Err(PipelineError::UnknownStage(first.to_string()));
        }

        let mut stages = Vec::with_capacity(configs.len());
        for config in configs {
            if !config.enabled {
                tracing::debug!("Stage {} \"{}\" is disabled", config.kind, config.name);
                continue;
            }
            if config.name.is_empty() {
                tracing::warn!("Stage of type {} has no name, it will be skipped", config.kind);
                continue;
            }
            let stage = registry.build(config)?;
            tracing::info!("Adding stage {} \"{}\"", config.kind, config.name);
            stages.push(stage);
        }
        Ok(Self::new(stages))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stages(&self) -> impl Iterator<Item = &dyn Stage> {
        self.stages.iter().map(|s| s.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Check that every stage's output shape feeds the next stage's input.
    pub fn validate(&self) -> Result<()> {
        for pair in self.stages.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            if !to.input_shape().accepts(&from.output_shape()) {
                return Err(PipelineError::ChainMismatch {
                    from: from.name().to_string(),
                    output: from.output_shape().to_string(),
                    to: to.name().to_string(),
                    input: to.input_shape().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Build the frozen observation schema from every stage's declarations.
    pub fn schema(&self) -> Result<ObservationSchema> {
        let defs: Vec<FieldDef> = self.stages.iter().flat_map(|s| s.observables()).collect();
        ObservationSchema::from_fields(&defs)
    }

    /// First stage that forces a single worker, if any.
    ///
    /// Stages configured at debug verbosity or above count as well.
    pub fn single_worker_stage(&self) -> Option<&str> {
        self.stages
            .iter()
            .find(|s| s.single_worker_only() || s.verbosity() >= Verbosity::Debug)
            .map(|s| s.name())
    }

    pub fn set_verbosity(&mut self, level: Verbosity) {
        self.verbosity = level;
        for stage in &mut self.stages {
            stage.set_verbosity(level);
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn begin(&mut self) -> Result<()> {
        for stage in &mut self.stages {
            stage.begin()?;
        }
        Ok(())
    }

    /// Run the record through every stage, stopping at the first drop.
    pub fn run(&mut self, record: Record) -> ChainOutcome {
        let start = Instant::now();
        let debug = self.verbosity >= Verbosity::Debug;
        let mut current = record;

        for (stage, spent) in self.stages.iter_mut().zip(self.timings.iter_mut()) {
            let stage_start = Instant::now();
            let outcome = stage.transform(current);
            *spent += stage_start.elapsed();

            match outcome {
                StageOutcome::Keep(next) => {
                    if debug {
                        tracing::debug!("Stage {} kept record {}", stage.name(), next.id);
                    }
                    current = next;
                }
                StageOutcome::Drop => {
                    if debug {
                        tracing::debug!("Stage {} dropped the record", stage.name());
                    }
                    return ChainOutcome {
                        record: None,
                        dropped_by: Some(stage.name().to_string()),
                        elapsed: start.elapsed(),
                    };
                }
            }
        }

        ChainOutcome {
            record: Some(current),
            dropped_by: None,
            elapsed: start.elapsed(),
        }
    }

    /// Finish every stage and collect their warnings, prefixed with the stage name.
    pub fn finish(&mut self) -> Vec<String> {
        self.stages
            .iter_mut()
            .flat_map(|s| {
                let name = s.name().to_string();
                s.finish()
                    .into_iter()
                    .map(move |w| format!("{}: {}", name, w))
            })
            .collect()
    }

    /// Time spent in each stage so far, by stage name.
    pub fn timings(&self) -> Vec<(String, Duration)> {
        self.stages
            .iter()
            .zip(&self.timings)
            .map(|(s, t)| (s.name().to_string(), *t))
            .collect()
    }
}
