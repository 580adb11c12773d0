//! Configuration for a record-runner pipeline run.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Maximum number of worker threads.
pub const MAX_WORKERS: usize = 15;
/// Smallest accepted shard split size (50 MB).
pub const MIN_SPLIT_SIZE: u64 = 50_000_000;
/// Largest accepted shard split size (100 GB).
pub const MAX_SPLIT_SIZE: u64 = 100_000_000_000;
/// Default shard split size (10 GB).
pub const DEFAULT_SPLIT_SIZE: u64 = 10_000_000_000;
/// Record count meaning "no limit".
pub const UNBOUNDED: u64 = u64::MAX;

/// Main configuration for a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Input configuration
    pub input: InputConfig,

    /// Output configuration
    pub output: OutputConfig,

    /// Processing configuration
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Ordered stage chain
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

/// Input configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    /// JSON-lines file with one record per line
    pub path: PathBuf,
}

/// Output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Primary output file. Shards are written next to it as `<path>.<n>`.
    pub path: PathBuf,

    /// Rotate to a new shard once the current one holds this many bytes
    #[serde(default = "default_split_size")]
    pub split_size_bytes: u64,

    /// zstd compression level, 0 disables compression (0-22)
    #[serde(default)]
    pub compression_level: i32,

    /// Write record payloads; `false` keeps only identity and observations
    #[serde(default = "default_true")]
    pub store_payload: bool,
}

/// How the commit gate treats a sequence number it has already committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceCheck {
    /// Treat as an internal error and stop the run.
    #[default]
    Strict,
    /// Log a warning and append the record anyway.
    Lenient,
}

/// Processing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Number of worker threads (1-15)
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Number of leading input entries to skip
    #[serde(default)]
    pub first_record: u64,

    /// Number of records to fetch, 0 means all
    #[serde(default)]
    pub record_count: u64,

    /// Entry index to stop at, 0 means unset
    #[serde(default)]
    pub last_record: u64,

    /// Read single-key commands from stdin while running
    #[serde(default = "default_true")]
    pub use_interactive_control: bool,

    /// Check every committed row against the observation schema
    #[serde(default)]
    pub validate_observations: bool,

    /// Commit rows in fetch order
    #[serde(default = "default_true")]
    pub sort_output_records: bool,

    #[serde(default)]
    pub sequence_check: SequenceCheck,

    /// Push one synthetic record through the chain before starting workers
    #[serde(default = "default_true")]
    pub use_test_run: bool,

    /// Progress refresh interval in milliseconds
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Initial log and stage verbosity
    #[serde(default = "default_verbosity")]
    pub verbosity: Verbosity,

    /// Optional path to save metrics JSON after the run completes
    #[serde(default)]
    pub metrics_output_path: Option<PathBuf>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            first_record: 0,
            record_count: 0,
            last_record: 0,
            use_interactive_control: true,
            validate_observations: false,
            sort_output_records: true,
            sequence_check: SequenceCheck::Strict,
            use_test_run: true,
            progress_interval_ms: 200,
            verbosity: default_verbosity(),
            metrics_output_path: None,
        }
    }
}

/// One entry of the stage chain.
///
/// Keys other than `type`, `name`, `enabled` and `verbosity` are stage
/// parameters and are collected into `params`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Registry key
    #[serde(rename = "type")]
    pub kind: String,

    /// Instance name, also the default observable name
    #[serde(default)]
    pub name: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbosity: Option<Verbosity>,

    #[serde(flatten)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl StageConfig {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            enabled: true,
            verbosity: None,
            params: serde_json::Map::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

/// Output verbosity, ordered from quietest to loudest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Silent,
    Essential,
    #[default]
    Info,
    Debug,
    Extreme,
}

impl Verbosity {
    pub const ALL: [Verbosity; 5] = [
        Verbosity::Silent,
        Verbosity::Essential,
        Verbosity::Info,
        Verbosity::Debug,
        Verbosity::Extreme,
    ];

    /// Parse the single-key form used by the control plane: `0`-`4` or `s,e,i,d,x`.
    pub fn from_key(key: char) -> Option<Self> {
        match key.to_ascii_lowercase() {
            '0' | 's' => Some(Verbosity::Silent),
            '1' | 'e' => Some(Verbosity::Essential),
            '2' | 'i' => Some(Verbosity::Info),
            '3' | 'd' => Some(Verbosity::Debug),
            '4' | 'x' => Some(Verbosity::Extreme),
            _ => None,
        }
    }

    /// Directive for a `tracing_subscriber::EnvFilter`.
    pub fn filter_directive(self) -> &'static str {
        match self {
            Verbosity::Silent => "error",
            Verbosity::Essential => "warn",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Extreme => "trace",
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Self {
        Self::ALL[(value as usize).min(Self::ALL.len() - 1)]
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Verbosity::Silent => "silent",
            Verbosity::Essential => "essential",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
            Verbosity::Extreme => "extreme",
        };
        f.write_str(name)
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if let Some(level) = Verbosity::from_key(c) {
                return Ok(level);
            }
        }
        Verbosity::ALL
            .into_iter()
            .find(|v| v.to_string().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown verbosity '{}'", s))
    }
}

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "json" => serde_json::from_str(&contents)?,
            // YAML is a superset of JSON
            _ => serde_yaml::from_str(&contents)?,
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Reject configurations that cannot run at all.
    ///
    /// Out-of-range values that have a sensible fallback are handled by
    /// [`Config::normalize`] instead.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.path.as_os_str().is_empty() {
            anyhow::bail!("Input path must be set");
        }
        if self.output.path.as_os_str().is_empty() {
            anyhow::bail!("Output path must be set");
        }
        if self.input.path == self.output.path {
            anyhow::bail!("Output path must differ from the input path");
        }
        if self.output.compression_level < 0 || self.output.compression_level > 22 {
            anyhow::bail!("Compression level must be 0-22 for zstd");
        }
        if self.processing.progress_interval_ms == 0 {
            anyhow::bail!("Progress interval must be > 0");
        }
        if !self.stages.iter().any(|s| s.enabled && !s.name.is_empty()) {
            anyhow::bail!("At least one named, enabled stage is required");
        }
        Ok(())
    }

    /// Clamp run parameters into range and reconcile the record window.
    ///
    /// Returns the adjustments made; each one is also logged as a warning.
    pub fn normalize(&mut self) -> Vec<String> {
        let mut notes = Vec::new();
        let p = &mut self.processing;

        if p.worker_count == 0 || p.worker_count > MAX_WORKERS {
            let clamped = p.worker_count.clamp(1, MAX_WORKERS);
            notes.push(format!(
                "worker count {} out of range 1-{}, using {}",
                p.worker_count, MAX_WORKERS, clamped
            ));
            p.worker_count = clamped;
        }

        let split = self.output.split_size_bytes;
        if !(MIN_SPLIT_SIZE..=MAX_SPLIT_SIZE).contains(&split) {
            let clamped = split.clamp(MIN_SPLIT_SIZE, MAX_SPLIT_SIZE);
            notes.push(format!(
                "split size {} out of range {}-{} bytes, using {}",
                split, MIN_SPLIT_SIZE, MAX_SPLIT_SIZE, clamped
            ));
            self.output.split_size_bytes = clamped;
        }

        notes.extend(reconcile_window(
            p.first_record,
            &mut p.record_count,
            &mut p.last_record,
        ));

        for note in &notes {
            tracing::warn!("{}", note);
        }
        notes
    }

    /// Number of records to fetch after `normalize`, `UNBOUNDED` for all.
    pub fn record_limit(&self) -> u64 {
        match self.processing.record_count {
            0 => UNBOUNDED,
            n => n,
        }
    }
}

/// Bring `record_count` and `last_record` into agreement.
///
/// `last_record` wins when it is the only bound given; a count that
/// disagrees with an explicit window is kept and reported.
fn reconcile_window(first: u64, count: &mut u64, last: &mut u64) -> Vec<String> {
    let mut notes = Vec::new();
    let span = last.saturating_sub(first);

    match (*count, *last, span) {
        (0, 0, _) => *count = UNBOUNDED,
        (0, _, span) if span > 0 => *count = span,
        (n, _, span) if n != UNBOUNDED && span > 0 && span != n => {
            notes.push(format!(
                "conflicting record window: last_record {} - first_record {} = {} but record_count is {}, using record_count",
                last, first, span, n
            ));
            *last = first.saturating_add(n);
        }
        (n, 0, _) => *last = first.saturating_add(n),
        (_, _, 0) => {
            notes.push(format!(
                "last_record {} is not after first_record {}, ignoring it",
                last, first
            ));
            if *count == 0 {
                *count = UNBOUNDED;
            }
            *last = first.saturating_add(*count);
        }
        _ => {}
    }
    notes
}

// Default value functions for serde
fn default_split_size() -> u64 { DEFAULT_SPLIT_SIZE }
fn default_worker_count() -> usize { 1 }
fn default_true() -> bool { true }
fn default_progress_interval_ms() -> u64 { 200 }
fn default_verbosity() -> Verbosity { Verbosity::default() }

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        Config {
            input: InputConfig {
                path: PathBuf::from("records.jsonl"),
            },
            output: OutputConfig {
                path: PathBuf::from("out.jsonl"),
                split_size_bytes: DEFAULT_SPLIT_SIZE,
                compression_level: 0,
                store_payload: true,
            },
            processing: ProcessingConfig::default(),
            stages: vec![StageConfig::new("passthrough", "pass")],
        }
    }

    #[test]
    fn test_yaml_defaults_and_stage_params() {
        let config = Config::from_yaml(
            r#"
input: { path: records.jsonl }
output: { path: out.jsonl }
stages:
  - { type: payload_length, name: len }
  - { type: range_cut, name: cut, field: len, min: 1, max: 4096 }
"#,
        )
        .unwrap();

        assert_eq!(config.output.split_size_bytes, DEFAULT_SPLIT_SIZE);
        assert_eq!(config.processing.worker_count, 1);
        assert!(config.processing.sort_output_records);
        assert_eq!(config.processing.sequence_check, SequenceCheck::Strict);
        assert_eq!(config.processing.verbosity, Verbosity::Info);

        let cut = &config.stages[1];
        assert_eq!(cut.kind, "range_cut");
        assert!(cut.enabled);
        assert_eq!(cut.params["field"], serde_json::json!("len"));
        assert_eq!(cut.params["max"], serde_json::json!(4096));
        assert!(!cut.params.contains_key("name"));
    }

    #[test]
    fn test_json_config() {
        let config = Config::from_json(
            r#"{"input": {"path": "in.jsonl"}, "output": {"path": "o.jsonl"},
                "processing": {"worker_count": 4, "sequence_check": "lenient", "verbosity": "debug"},
                "stages": [{"type": "passthrough", "name": "p", "enabled": false}]}"#,
        )
        .unwrap();
        assert_eq!(config.processing.worker_count, 4);
        assert_eq!(config.processing.sequence_check, SequenceCheck::Lenient);
        assert_eq!(config.processing.verbosity, Verbosity::Debug);
        assert!(!config.stages[0].enabled);
    }

    #[test]
    fn test_validation() {
        assert!(minimal().validate().is_ok());

        let mut bad = minimal();
        bad.output.compression_level = 30;
        assert!(bad.validate().is_err());

        let mut no_stages = minimal();
        no_stages.stages[0].enabled = false;
        assert!(no_stages.validate().is_err());

        let mut same = minimal();
        same.output.path = same.input.path.clone();
        assert!(same.validate().is_err());
    }

    #[test]
    fn test_normalize_clamps() {
        let mut config = minimal();
        config.processing.worker_count = 64;
        config.output.split_size_bytes = 10;
        let notes = config.normalize();
        assert_eq!(notes.len(), 2);
        assert_eq!(config.processing.worker_count, MAX_WORKERS);
        assert_eq!(config.output.split_size_bytes, MIN_SPLIT_SIZE);

        let mut zero = minimal();
        zero.processing.worker_count = 0;
        zero.output.split_size_bytes = u64::MAX;
        zero.normalize();
        assert_eq!(zero.processing.worker_count, 1);
        assert_eq!(zero.output.split_size_bytes, MAX_SPLIT_SIZE);
    }

    #[test]
    fn test_record_window() {
        let mut config = minimal();
        assert!(config.normalize().is_empty());
        assert_eq!(config.record_limit(), UNBOUNDED);

        let mut last_only = minimal();
        last_only.processing.first_record = 10;
        last_only.processing.last_record = 25;
        last_only.normalize();
        assert_eq!(last_only.record_limit(), 15);

        let mut count_only = minimal();
        count_only.processing.first_record = 5;
        count_only.processing.record_count = 3;
        assert!(count_only.normalize().is_empty());
        assert_eq!(count_only.processing.last_record, 8);

        let mut conflict = minimal();
        conflict.processing.last_record = 20;
        conflict.processing.record_count = 7;
        assert_eq!(conflict.normalize().len(), 1);
        assert_eq!(conflict.record_limit(), 7);

        let mut inverted = minimal();
        inverted.processing.first_record = 30;
        inverted.processing.last_record = 20;
        assert_eq!(inverted.normalize().len(), 1);
        assert_eq!(inverted.record_limit(), UNBOUNDED);
    }

    #[test]
    fn test_verbosity_parsing() {
        assert_eq!(Verbosity::from_key('3'), Some(Verbosity::Debug));
        assert_eq!(Verbosity::from_key('x'), Some(Verbosity::Extreme));
        assert_eq!(Verbosity::from_key('q'), None);
        assert_eq!("essential".parse::<Verbosity>(), Ok(Verbosity::Essential));
        assert_eq!("i".parse::<Verbosity>(), Ok(Verbosity::Info));
        assert!("loud".parse::<Verbosity>().is_err());
        assert!(Verbosity::Silent < Verbosity::Extreme);
        assert_eq!(Verbosity::from_u8(Verbosity::Debug.as_u8()), Verbosity::Debug);
        assert_eq!(Verbosity::Essential.filter_directive(), "warn");
    }

    #[test]
    fn test_default_verbosity_agrees() {
        assert_eq!(Verbosity::default(), Verbosity::Info);
        assert_eq!(ProcessingConfig::default().verbosity, Verbosity::default());
        let parsed = Config::from_yaml("input: { path: a }\noutput: { path: b }\nstages: []\n").unwrap();
        assert_eq!(parsed.processing.verbosity, ProcessingConfig::default().verbosity);
    }

    #[test]
    fn test_yaml_roundtrip_keeps_stage_params() {
        let mut config = minimal();
        config.stages.push(StageConfig::new("tag", "t").with_param("field", "src").with_param("value", "a"));
        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.stages[1].params["field"], serde_json::json!("src"));
    }
}
