//! Trainer CLI: operator interface for the training control plane.
//!
//! Renders manifests, submits and inspects jobs, and works with run
//! checkpoints in object storage.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use trainer_core::Framework;

/// Trainer: schedule fine-tuning jobs onto Kubeflow
#[derive(Parser, Debug)]
#[command(name = "trainer", version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Print the job spec a backend builds for a training request
    Render {
        /// Backend name (nemo, meta, hf-unsloth)
        #[arg(short, long)]
        backend: String,
        /// Request JSON file, or `-` for stdin
        request: PathBuf,
    },
    /// Print the PyTorchJob manifest for a unified job request
    RenderPytorchjob {
        /// Request JSON file, or `-` for stdin
        request: PathBuf,
    },
    /// Validate and submit a training request to the configured runner
    Submit {
        /// Backend name (nemo, meta, hf-unsloth)
        #[arg(short, long)]
        backend: String,
        /// Request JSON file, or `-` for stdin
        request: PathBuf,
    },
    /// Show the status of a submitted job
    Status {
        job_id: String,
    },
    /// Cancel a job
    Cancel {
        job_id: String,
    },
    /// Manage PyTorchJob workloads
    Pytorchjob {
        #[command(subcommand)]
        action: PyTorchJobAction,
    },
    /// Inspect and restore run checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum PyTorchJobAction {
    /// Create a PyTorchJob from a unified job request
    Submit {
        /// Request JSON file, or `-` for stdin
        request: PathBuf,
    },
    /// Show a PyTorchJob's status
    Status {
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
    },
    /// Delete a PyTorchJob
    Delete {
        name: String,
        #[arg(short, long)]
        namespace: Option<String>,
    },
}

/// Where a run's checkpoints live.
#[derive(clap::Args, Debug)]
struct RunLocation {
    /// Run prefix, e.g. `s3://bucket/ckpt/run-7/framework=nemo`
    #[arg(short, long)]
    uri: String,
    #[arg(short, long, default_value = "hf")]
    framework: Framework,
    /// Scratch directory name under the configured local root
    #[arg(long, default_value = "default")]
    run_id: String,
}

#[derive(clap::Subcommand, Debug)]
enum CheckpointAction {
    /// Print the key of the newest checkpoint
    Latest {
        #[command(flatten)]
        location: RunLocation,
    },
    /// Download a checkpoint and print its local path
    Materialize {
        #[command(flatten)]
        location: RunLocation,
        /// Checkpoint key; the newest one when omitted
        key: Option<String>,
    },
    /// Record a checkpoint for a step
    Save {
        #[command(flatten)]
        location: RunLocation,
        #[arg(short, long)]
        step: u64,
        /// JSON object stored with the record
        #[arg(short, long)]
        metadata: Option<String>,
    },
    /// Create the checkpoints/logs/config layout markers
    Init {
        #[command(flatten)]
        location: RunLocation,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (TRAINER_* settings, AWS credentials)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "deepfinery", "trainer")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "trainer.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let config = trainer_core::load_config(cli.config.as_deref(), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    commands::handle_command(cli.command, &config).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_checkpoint_latest() {
        let cli = Cli::try_parse_from([
            "trainer",
            "-vv",
            "checkpoint",
            "latest",
            "--uri",
            "s3://bucket/ckpt/run-7/framework=nemo",
            "--framework",
            "nemo",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Checkpoint {
                action: CheckpointAction::Latest { location },
            } => {
                assert_eq!(location.framework, Framework::Nemo);
                assert_eq!(location.run_id, "default");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_framework() {
        let result = Cli::try_parse_from([
            "trainer",
            "checkpoint",
            "init",
            "--uri",
            "/tmp/x",
            "--framework",
            "jax",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_render_pytorchjob() {
        let cli = Cli::try_parse_from(["trainer", "render-pytorchjob", "-"]).unwrap();
        assert!(matches!(cli.command, Commands::RenderPytorchjob { .. }));
    }
}
