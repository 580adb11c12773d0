//! Maps stage type strings from configuration to constructors.

use super::builtin::{
    EveryNthCut, Inspect, JsonField, Passthrough, PayloadChecksum, PayloadLength, RangeCut, Tag,
};
use super::Stage;
use crate::config::StageConfig;
use crate::record::{ObservationValue, ValueKind};
use crate::{PipelineError, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Builds a stage instance from its configuration entry.
pub type StageFactory = fn(&StageConfig) -> Result<Box<dyn Stage>>;

/// Registry of known stage types.
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in stage type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("passthrough", build_passthrough);
        registry.register("payload_length", build_payload_length);
        registry.register("payload_checksum", build_payload_checksum);
        registry.register("tag", build_tag);
        registry.register("range_cut", build_range_cut);
        registry.register("every_nth_cut", build_every_nth_cut);
        registry.register("json_field", build_json_field);
        registry.register("inspect", build_inspect);
        registry
    }

    /// Register a factory; a later registration replaces an earlier one.
    pub fn register(&mut self, kind: impl Into<String>, factory: StageFactory) {
        self.factories.insert(kind.into(), factory);
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate a stage and apply its configured verbosity.
    pub fn build(&self, config: &StageConfig) -> Result<Box<dyn Stage>> {
        let factory = self
            .factories
            .get(&config.kind)
            .ok_or_else(|| PipelineError::UnknownStage(config.kind.clone()))?;
        let mut stage = factory(config)?;
        if let Some(level) = config.verbosity {
            stage.set_verbosity(level);
        }
        Ok(stage)
    }
}

fn params<T: DeserializeOwned>(config: &StageConfig) -> Result<T> {
    let value = serde_json::Value::Object(config.params.clone());
    serde_json::from_value(value).map_err(|e| {
        PipelineError::config(format!(
            "invalid parameters for stage {} \"{}\": {}",
            config.kind, config.name, e
        ))
    })
}

fn build_passthrough(config: &StageConfig) -> Result<Box<dyn Stage>> {
    Ok(Box::new(Passthrough::new(&config.name)))
}

fn build_payload_length(config: &StageConfig) -> Result<Box<dyn Stage>> {
    Ok(Box::new(PayloadLength::new(&config.name)))
}

fn build_payload_checksum(config: &StageConfig) -> Result<Box<dyn Stage>> {
    Ok(Box::new(PayloadChecksum::new(&config.name)))
}

fn build_inspect(config: &StageConfig) -> Result<Box<dyn Stage>> {
    Ok(Box::new(Inspect::new(&config.name)))
}

#[derive(Deserialize)]
struct TagParams {
    field: String,
    value: ObservationValue,
}

fn build_tag(config: &StageConfig) -> Result<Box<dyn Stage>> {
    let p: TagParams = params(config)?;
    Ok(Box::new(Tag::new(&config.name, &p.field, p.value)))
}

#[derive(Deserialize)]
struct RangeCutParams {
    field: String,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
}

fn build_range_cut(config: &StageConfig) -> Result<Box<dyn Stage>> {
    let p: RangeCutParams = params(config)?;
    if let (Some(min), Some(max)) = (p.min, p.max) {
        if min > max {
            return Err(PipelineError::config(format!(
                "stage \"{}\": min {} is greater than max {}",
                config.name, min, max
            )));
        }
    }
    Ok(Box::new(RangeCut::new(&config.name, &p.field, p.min, p.max)))
}

#[derive(Deserialize)]
struct EveryNthParams {
    every: u64,
}

fn build_every_nth_cut(config: &StageConfig) -> Result<Box<dyn Stage>> {
    let p: EveryNthParams = params(config)?;
    if p.every == 0 {
        return Err(PipelineError::config(format!(
            "stage \"{}\": every must be at least 1",
            config.name
        )));
    }
    Ok(Box::new(EveryNthCut::new(&config.name, p.every)))
}

fn default_kind() -> ValueKind { ValueKind::Text }

#[derive(Deserialize)]
struct JsonFieldParams {
    pointer: String,
    #[serde(default = "default_kind")]
    kind: ValueKind,
    #[serde(default)]
    required: bool,
}

fn build_json_field(config: &StageConfig) -> Result<Box<dyn Stage>> {
    let p: JsonFieldParams = params(config)?;
    if !p.pointer.is_empty() && !p.pointer.starts_with('/') {
        return Err(PipelineError::config(format!(
            "stage \"{}\": JSON pointer '{}' must start with '/'",
            config.name, p.pointer
        )));
    }
    Ok(Box::new(JsonField::new(&config.name, &p.pointer, p.kind, p.required)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Verbosity;

    fn stage(kind: &str, name: &str, params: serde_json::Value) -> StageConfig {
        let mut config = StageConfig::new(kind, name);
        if let serde_json::Value::Object(map) = params {
            config.params = map;
        }
        config
    }

    #[test]
    fn test_builtins_registered() {
        let registry = StageRegistry::with_builtins();
        let kinds: Vec<&str> = registry.kinds().collect();
        assert_eq!(kinds.len(), 8);
        assert!(registry.contains("range_cut"));
        assert!(!registry.contains("fft"));
    }

    #[test]
    fn test_unknown_stage() {
        let registry = StageRegistry::with_builtins();
        let result = registry.build(&stage("fft", "f", serde_json::json!({})));
        assert!(matches!(result, Err(PipelineError::UnknownStage(kind)) if kind == "fft"));
    }

    #[test]
    fn test_build_with_params() {
        let registry = StageRegistry::with_builtins();
        let cut = registry
            .build(&stage("range_cut", "cut", serde_json::json!({"field": "len", "max": 10})))
            .unwrap();
        assert_eq!(cut.name(), "cut");
        assert_eq!(cut.kind(), "range_cut");
        assert_eq!(cut.describe()["max"], serde_json::json!(10.0));
    }

    #[test]
    fn test_bad_params_are_config_errors() {
        let registry = StageRegistry::with_builtins();
        let missing = registry.build(&stage("tag", "t", serde_json::json!({"field": "x"})));
        assert!(matches!(missing, Err(e) if e.is_config()));

        let inverted = registry.build(&stage(
            "range_cut",
            "cut",
            serde_json::json!({"field": "len", "min": 5, "max": 1}),
        ));
        assert!(matches!(inverted, Err(e) if e.is_config()));

        let zero = registry.build(&stage("every_nth_cut", "n", serde_json::json!({"every": 0})));
        assert!(matches!(zero, Err(e) if e.is_config()));
    }

    #[test]
    fn test_configured_verbosity_applied() {
        let registry = StageRegistry::with_builtins();
        let mut config = stage("passthrough", "p", serde_json::json!({}));
        config.verbosity = Some(Verbosity::Debug);
        let built = registry.build(&config).unwrap();
        assert_eq!(built.verbosity(), Verbosity::Debug);
    }
}
