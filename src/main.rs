//! Record Runner CLI
//!
//! Runs a configured stage chain over a JSON-lines input with interactive control.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

use record_runner::control::{ControlPlane, ProgressOutput, StdinCommands};
use record_runner::{run_pipeline, Config, OutputReader, Verbosity};

#[derive(Parser)]
#[command(name = "record-runner")]
#[command(about = "Ordered multi-worker record processing with sharded output", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override worker count
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    /// Override verbosity (silent, essential, info, debug, extreme or 0-4)
    #[arg(short, long, global = true)]
    verbosity: Option<Verbosity>,

    /// Do not read control commands from stdin
    #[arg(long, global = true)]
    no_interactive: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Show the metadata and rows of a finished output
    Inspect {
        /// Primary output file
        path: PathBuf,

        /// Number of rows to print
        #[arg(short, long, default_value_t = 0)]
        rows: usize,
    },

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

type FilterHandle = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

fn main() -> Result<()> {
    // RUST_LOG wins over the configured verbosity
    let from_env = std::env::var_os(EnvFilter::DEFAULT_ENV).is_some();
    let initial = if from_env {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(Verbosity::Info.filter_directive())
    };
    let (filter, handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run) => {
            run_command(&cli, handle, from_env)?;
        }

        Some(Commands::Validate) => {
            validate_command(&cli)?;
        }

        Some(Commands::Inspect { ref path, rows }) => {
            inspect_command(path, rows)?;
        }

        Some(Commands::GenerateConfig { ref output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::from_file(&cli.config)
        .with_context(|| format!("Failed to load configuration {}", cli.config.display()))?;

    // Apply overrides
    if let Some(workers) = cli.workers {
        config.processing.worker_count = workers;
    }
    if let Some(verbosity) = cli.verbosity {
        config.processing.verbosity = verbosity;
    }
    if cli.no_interactive {
        config.processing.use_interactive_control = false;
    }
    Ok(config)
}

fn run_command(cli: &Cli, handle: FilterHandle, from_env: bool) -> Result<()> {
    let config = load_config(cli)?;

    let set_level = move |level: Verbosity| {
        if let Err(e) = handle.reload(EnvFilter::new(level.filter_directive())) {
            tracing::warn!("Failed to change log level: {}", e);
        }
    };
    if !from_env {
        set_level(config.processing.verbosity);
    }

    let interactive = config.processing.use_interactive_control && std::io::stdin().is_terminal();
    let commands = if interactive {
        tracing::info!("Interactive control: p pause, n step, l last record, v<0-4> verbosity, d [file] detach, q quit");
        Some(Box::new(StdinCommands::spawn()?) as Box<dyn record_runner::control::CommandSource>)
    } else {
        None
    };
    let control = ControlPlane::new(commands, ProgressOutput::detect())
        .with_verbosity_hook(Box::new(set_level));

    let summary = run_pipeline(config, control)?;
    println!("{}", summary);
    Ok(())
}

fn validate_command(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli)?;
    config.validate()?;
    for note in config.normalize() {
        println!("Adjusted: {}", note);
    }

    let registry = record_runner::StageRegistry::with_builtins();
    let chain = record_runner::StageChain::from_config(&registry, &config.stages)?;
    chain.validate()?;
    let schema = chain.schema()?;

    println!("Configuration is valid");
    println!("Stages: {}", chain.names().join(" -> "));
    println!("Observables: {}", schema.field_names().collect::<Vec<_>>().join(", "));
    Ok(())
}

fn inspect_command(path: &Path, rows: usize) -> Result<()> {
    let reader = OutputReader::open(path)
        .with_context(|| format!("Failed to read output {}", path.display()))?;

    match reader.metadata() {
        Some(meta) => println!("{}", serde_json::to_string_pretty(meta)?),
        None => println!("No metadata found, the run did not finish"),
    }

    let shards = reader.shard_paths();
    println!("\n=== Files ===");
    for shard in &shards {
        println!("{}", shard.display());
    }

    let all = reader.rows()?;
    println!("\n=== Rows: {} ===", all.len());
    for (seq, record) in all.iter().take(rows) {
        println!("[{}] {}", seq, record);
    }
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    let yaml = r#"# Record Runner Configuration

# === INPUT: JSON-lines file, one record per line ===
# Lines with a numeric "id" are full records ({"id": 3, "payload": "..."}),
# any other JSON line becomes the payload of a record numbered by its line.
input:
  path: "records.jsonl"

# === OUTPUT: primary file plus numbered shards <path>.1, <path>.2, ... ===
output:
  path: "out.jsonl"

  # Rotate to a new shard after this many bytes (50 MB - 100 GB)
  split_size_bytes: 10000000000

  # Zstd compression level (0-22, 0 = plain text)
  compression_level: 0

  # false writes observations only, without the record payload
  store_payload: true

# === PROCESSING ===
processing:
  # Worker threads (1-15)
  worker_count: 4

  # Record window: skip first_record entries, then fetch record_count
  # records (0 = all). last_record is an alternative upper bound.
  first_record: 0
  record_count: 0
  last_record: 0

  # Read p/n/l/v/d/q commands from the terminal while running
  use_interactive_control: true

  # Check every row against the declared observables
  validate_observations: false

  # Write rows in input order (false = completion order)
  sort_output_records: true

  # strict: a repeated sequence number stops the run
  # lenient: log it and write the row anyway
  sequence_check: strict

  # Run one empty record through the chain before starting workers
  use_test_run: true

  # Progress refresh interval
  progress_interval_ms: 200

  # silent, essential, info, debug, extreme
  # debug and above force a single worker
  verbosity: info

  # Optional path to save metrics JSON after the run
  # metrics_output_path: "metrics.json"

# === STAGES: applied in order to every record ===
stages:
  - type: json_field
    name: value
    pointer: /value
    kind: int

  - type: payload_length
    name: length

  - type: range_cut
    name: cut
    field: length
    min: 1
    max: 4096

  # - type: inspect       # logs every record, forces a single worker
  #   name: look
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_default() {
        // No subcommand - should default to Run
        let cli = Cli::try_parse_from(["record-runner"]);
        assert!(cli.is_ok());
        assert!(cli.unwrap().command.is_none());
    }

    #[test]
    fn test_cli_parse_overrides() {
        let cli = Cli::try_parse_from(["record-runner", "-c", "other.yaml", "-w", "8", "-v", "debug"]).unwrap();
        assert_eq!(cli.workers, Some(8));
        assert_eq!(cli.verbosity, Some(Verbosity::Debug));
    }

    #[test]
    fn test_cli_parse_inspect() {
        let cli = Cli::try_parse_from(["record-runner", "inspect", "out.jsonl", "--rows", "5"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Inspect { rows: 5, .. })));
    }

    #[test]
    fn test_generated_config_is_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        generate_config_command(&path).unwrap();

        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.stages.len(), 3);
    }
}
