//! CLI subcommand handlers.

use crate::CheckpointAction;
use crate::Commands;
use crate::PyTorchJobAction;
use crate::RunLocation;
use serde_json::{Map, Value};
use std::io::Read;
use std::path::Path;
use trainer_core::{
    BackendSettings, PyTorchJobBackend, TrainerConfig, TrainerError, TrainingJobRequest,
    TrainingRequest, TrainingResponse, backend_by_name, build_job_runner, build_pytorch_job,
    detect_namespace, schedule_training,
};
use trainer_storage::CheckpointManager;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, config: &TrainerConfig) -> anyhow::Result<()> {
    match command {
        Commands::Render { backend, request } => handle_render(&backend, &request, config),
        Commands::RenderPytorchjob { request } => handle_render_pytorchjob(&request),
        Commands::Submit { backend, request } => handle_submit(&backend, &request, config).await,
        Commands::Status { job_id } => handle_status(&job_id, config).await,
        Commands::Cancel { job_id } => handle_cancel(&job_id, config).await,
        Commands::Pytorchjob { action } => handle_pytorchjob(action, config).await,
        Commands::Checkpoint { action } => handle_checkpoint(action, config).await,
    }
}

fn handle_render(backend: &str, request: &Path, config: &TrainerConfig) -> anyhow::Result<()> {
    let request = TrainingRequest::from_json(read_json(request)?)?;
    let backend = resolve_backend(backend, config)?;
    request.validate()?;
    backend.validate_request(&request)?;
    let spec = backend.build_job_spec(&request)?;

    // Cluster backends print the bare manifest.
    let output = match spec.train_job {
        Some(manifest) => manifest,
        None => serde_json::to_value(&spec)?,
    };
    print_json(&output)
}

fn handle_render_pytorchjob(request: &Path) -> anyhow::Result<()> {
    let request: TrainingJobRequest = serde_json::from_value(read_json(request)?)?;
    let job = build_pytorch_job(&request)?;
    print_json(&job.to_value()?)
}

async fn handle_submit(
    backend: &str,
    request: &Path,
    config: &TrainerConfig,
) -> anyhow::Result<()> {
    let request = TrainingRequest::from_json(read_json(request)?)?;
    let backend = resolve_backend(backend, config)?;
    let runner = build_job_runner(config).await?;

    let response: TrainingResponse = schedule_training(backend.as_ref(), runner.as_ref(), &request)
        .await
        .map_err(|e| match e {
            e if e.is_conflict() => anyhow::anyhow!("Job '{}' already exists: {}", request.job_id, e),
            e => anyhow::anyhow!("Submission failed: {}", e),
        })?;
    print_json(&serde_json::to_value(&response)?)
}

async fn handle_status(job_id: &str, config: &TrainerConfig) -> anyhow::Result<()> {
    let runner = build_job_runner(config).await?;
    let status = runner.get(job_id).await.map_err(TrainerError::from)?;
    print_json(&serde_json::to_value(&status)?)
}

async fn handle_cancel(job_id: &str, config: &TrainerConfig) -> anyhow::Result<()> {
    let runner = build_job_runner(config).await?;
    let status = runner.cancel(job_id).await.map_err(TrainerError::from)?;
    print_json(&serde_json::to_value(&status)?)
}

async fn handle_pytorchjob(action: PyTorchJobAction, config: &TrainerConfig) -> anyhow::Result<()> {
    let backend = PyTorchJobBackend::connect(detect_namespace(&config.runner))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to the cluster: {}", e))?;

    match action {
        PyTorchJobAction::Submit { request } => {
            let request: TrainingJobRequest = serde_json::from_value(read_json(&request)?)?;
            let status = backend.submit(&request).await?;
            print_json(&serde_json::to_value(&status)?)
        }
        PyTorchJobAction::Status { name, namespace } => {
            let status = backend.status(&name, namespace.as_deref()).await?;
            print_json(&serde_json::to_value(&status)?)
        }
        PyTorchJobAction::Delete { name, namespace } => {
            backend.delete(&name, namespace.as_deref()).await?;
            println!(
                "Deleted PyTorchJob {} in {}",
                name,
                namespace.as_deref().unwrap_or(backend.namespace())
            );
            Ok(())
        }
    }
}

async fn handle_checkpoint(action: CheckpointAction, config: &TrainerConfig) -> anyhow::Result<()> {
    match action {
        CheckpointAction::Latest { location } => {
            let manager = open_checkpoints(&location, config)?;
            match manager.latest_checkpoint().await {
                Some(key) => println!("{}", key),
                None => println!("No checkpoints found under {}", location.uri),
            }
            Ok(())
        }
        CheckpointAction::Materialize { location, key } => {
            let manager = open_checkpoints(&location, config)?;
            let key = match key {
                Some(key) => key,
                None => manager
                    .latest_checkpoint()
                    .await
                    .ok_or_else(|| anyhow::anyhow!("No checkpoints found under {}", location.uri))?,
            };
            let path = manager.materialize_checkpoint(&key).await?;
            println!("{}", path.display());
            Ok(())
        }
        CheckpointAction::Save {
            location,
            step,
            metadata,
        } => {
            let manager = open_checkpoints(&location, config)?;
            let metadata = parse_metadata(metadata.as_deref())?;
            let key = manager.save_checkpoint(step, metadata).await?;
            println!("{}", key);
            Ok(())
        }
        CheckpointAction::Init { location } => {
            let manager = open_checkpoints(&location, config)?;
            manager.ensure_layout().await;
            println!("Initialized run layout under {}", location.uri);
            Ok(())
        }
    }
}

fn open_checkpoints(
    location: &RunLocation,
    config: &TrainerConfig,
) -> anyhow::Result<CheckpointManager> {
    CheckpointManager::for_run(
        &location.uri,
        location.framework.as_str(),
        &location.run_id,
        &config.storage.local_root,
    )
    .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", location.uri, e))
}

fn resolve_backend(
    name: &str,
    config: &TrainerConfig,
) -> anyhow::Result<Box<dyn trainer_core::TrainerBackend>> {
    backend_by_name(name, &BackendSettings::from_config(config)).ok_or_else(|| {
        anyhow::anyhow!(
            "Unknown backend '{}'. Expected one of: nemo, meta, hf-unsloth",
            name
        )
    })
}

/// Read a JSON document from `path`, or stdin for `-`.
fn read_json(path: &Path) -> anyhow::Result<Value> {
    let raw = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?
    };
    Ok(serde_json::from_str(&raw)?)
}

fn parse_metadata(raw: Option<&str>) -> anyhow::Result<Map<String, Value>> {
    match raw {
        None => Ok(Map::new()),
        Some(raw) => match serde_json::from_str(raw)? {
            Value::Object(map) => Ok(map),
            other => anyhow::bail!("Checkpoint metadata must be a JSON object, got {}", other),
        },
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
