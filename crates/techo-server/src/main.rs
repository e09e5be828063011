//! Techo command-line tools.
//!
//! ## Usage
//!
//! ```bash
//! # Apply a JSON array of operations and print the resulting state
//! techo-server replay ops.json [--config session.toml] [--output notebook.json]
//!
//! # Print the effective session configuration
//! techo-server config [session.toml]
//! ```
//!
//! Logs go to stderr; `RUST_LOG` overrides the default `info` filter.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use techo_kernel::{JsonExporter, NotebookState, Operation, SessionConfig, write_export};

#[derive(Parser, Debug)]
#[command(name = "techo-server")]
#[command(about = "Tools for the Techo notebook engine")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply an operation log and print the final state as JSON
    Replay {
        /// JSON array of operations
        ops: PathBuf,

        /// Session config (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Also export the resulting notebook here (defaults to the config's `file`)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Exit with failure if any operation is rejected
        #[arg(long)]
        strict: bool,
    },
    /// Print the effective session configuration
    Config {
        /// Session config (TOML); defaults when omitted
        path: Option<PathBuf>,
    },
}

/// Outcome of replaying an operation log.
#[derive(Debug)]
struct Replay {
    state: NotebookState,
    applied: usize,
    rejected: usize,
    actions: usize,
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(SessionConfig::default()),
    }
}

/// Run `ops` through the reducer. Rejected operations are logged and skipped.
fn replay(ops: &[Operation], config: &SessionConfig) -> Replay {
    let mut state = NotebookState::default().with_bin_limit(config.bin_limit);
    let mut applied = 0;
    let mut rejected = 0;
    let mut actions = 0;

    for (index, op) in ops.iter().enumerate() {
        match state.apply(op) {
            Ok(emitted) => {
                applied += 1;
                actions += emitted.len();
                for action in &emitted {
                    tracing::debug!(index, ?action, "action");
                }
            }
            Err(e) => {
                rejected += 1;
                warn!(index, operation = op.name(), error = %e, "operation rejected");
            }
        }
    }

    Replay {
        state,
        applied,
        rejected,
        actions,
    }
}

async fn run_replay(
    ops_path: &Path,
    config_path: Option<&Path>,
    output: Option<PathBuf>,
) -> Result<Replay> {
    let config = load_config(config_path)?;
    let raw = tokio::fs::read(ops_path)
        .await
        .with_context(|| format!("reading {}", ops_path.display()))?;
    let ops: Vec<Operation> = serde_json::from_slice(&raw)
        .with_context(|| format!("parsing operations in {}", ops_path.display()))?;

    let result = replay(&ops, &config);
    info!(
        applied = result.applied,
        rejected = result.rejected,
        actions = result.actions,
        "replay finished"
    );

    if let Some(path) = output.or(config.file) {
        let bytes = write_export(&JsonExporter::pretty(), &result.state.notebook, &path).await?;
        info!(path = %path.display(), bytes, "notebook exported");
    }

    println!("{}", serde_json::to_string_pretty(&result.state)?);
    Ok(result)
}

fn print_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    print!("{}", config.to_toml_string()?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let outcome = match args.command {
        Command::Replay {
            ops,
            config,
            output,
            strict,
        } => run_replay(&ops, config.as_deref(), output)
            .await
            .map(|result| {
                if strict && result.rejected > 0 {
                    ExitCode::FAILURE
                } else {
                    ExitCode::SUCCESS
                }
            }),
        Command::Config { path } => print_config(path.as_deref()).map(|()| ExitCode::SUCCESS),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
