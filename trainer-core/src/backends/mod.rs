//! Trainer backends.
//!
//! A backend checks that a [`TrainingRequest`] fits its framework and turns it
//! into a [`JobSpec`] for a [`JobRunner`]. [`schedule_training`] runs the
//! whole validate -> build -> submit pipeline.

pub mod hf_unsloth;
pub mod meta;
pub mod nemo;
pub mod pytorch;

pub use hf_unsloth::HfUnslothBackend;
pub use meta::MetaBackend;
pub use nemo::NemoBackend;
pub use pytorch::{PyTorchJobBackend, TrainingJobStatus, status_from_pytorch_job};

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::TrainerConfig;
use crate::error::{ManifestError, TrainerError};
use crate::manifest::train_job::{DEFAULT_TRAIN_JOB_API_VERSION, TrainJob};
use crate::manifest::{CommandLine, EnvOverrides, NumProcPerNode, RuntimeRef, TrainJobParams};
use crate::runner::{JobRunner, JobSpec};
use crate::schemas::{TrainingRequest, TrainingResponse};

/// Validates requests for one framework and builds runner job specs.
pub trait TrainerBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Reject requests this backend cannot run.
    fn validate_request(&self, request: &TrainingRequest) -> Result<(), ManifestError>;

    fn build_job_spec(&self, request: &TrainingRequest) -> Result<JobSpec, ManifestError>;
}

/// Validate, build and submit `request`.
pub async fn schedule_training(
    backend: &dyn TrainerBackend,
    runner: &dyn JobRunner,
    request: &TrainingRequest,
) -> Result<TrainingResponse, TrainerError> {
    request.validate()?;
    backend.validate_request(request)?;
    let spec = backend.build_job_spec(request)?;
    let status = runner.submit(spec).await?;
    tracing::info!(
        job_id = %request.job_id,
        backend = %backend.name(),
        runner = %runner.name(),
        backend_job_id = %status.backend_job_id,
        "Training scheduled"
    );
    Ok(TrainingResponse {
        job_id: request.job_id.clone(),
        backend_job_id: status.backend_job_id,
        status: status.state,
        detail: status.detail,
        dashboard_url: None,
        metadata: status.metadata,
    })
}

/// Look up a backend by its name (`nemo`, `meta`, `hf-unsloth`).
pub fn backend_by_name(name: &str, settings: &BackendSettings) -> Option<Box<dyn TrainerBackend>> {
    match name {
        "nemo" => Some(Box::new(NemoBackend::new(settings.clone()))),
        "meta" => Some(Box::new(MetaBackend::new(settings.clone()))),
        "hf-unsloth" | "hf" => Some(Box::new(HfUnslothBackend::new())),
        _ => None,
    }
}

/// Process-wide inputs for `TrainJob` backends.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSettings {
    /// Overrides each backend's default runtime name.
    pub runtime_name: Option<String>,
    pub runtime_kind: String,
    pub runtime_api_group: String,
    pub train_job_api_version: String,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self::from_config(&TrainerConfig::default())
    }
}

impl BackendSettings {
    pub fn from_config(config: &TrainerConfig) -> Self {
        Self {
            runtime_name: config.runtime.name.clone(),
            runtime_kind: config.runtime.kind.clone(),
            runtime_api_group: config.runtime.api_group.clone(),
            train_job_api_version: config.runner.train_job_api_version.clone(),
        }
    }

    /// Runtime reference: per-request override, then settings, then the
    /// backend's own default name.
    pub fn runtime_ref(&self, default_name: &str, request: Option<&RuntimeRefOverride>) -> RuntimeRef {
        let pick = |value: Option<&String>| value.filter(|v| !v.is_empty()).cloned();
        RuntimeRef {
            name: pick(request.and_then(|r| r.name.as_ref()))
                .or_else(|| self.runtime_name.clone())
                .unwrap_or_else(|| default_name.to_string()),
            kind: pick(request.and_then(|r| r.kind.as_ref()))
                .unwrap_or_else(|| self.runtime_kind.clone()),
            api_group: pick(request.and_then(|r| r.api_group.as_ref()))
                .unwrap_or_else(|| self.runtime_api_group.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeRefOverride {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default, rename = "apiGroup", alias = "api_group")]
    pub api_group: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnslothOptions {
    #[serde(default = "default_true")]
    pub optimize_long_context: bool,
    #[serde(default = "default_quantization")]
    pub quantization: String,
    #[serde(default = "default_gradient_accumulation")]
    pub gradient_accumulation: u32,
}

impl Default for UnslothOptions {
    fn default() -> Self {
        Self {
            optimize_long_context: true,
            quantization: default_quantization(),
            gradient_accumulation: default_gradient_accumulation(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_quantization() -> String {
    "bnb-nf4".to_string()
}

fn default_gradient_accumulation() -> u32 {
    4
}

/// Typed view of `TrainingRequest::extra_parameters`. Unrecognized keys stay
/// in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct BackendOptions {
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub num_nodes: Option<u32>,
    #[serde(default)]
    pub num_proc_per_node: Option<NumProcPerNode>,
    #[serde(default)]
    pub resources_per_node: Option<ResourceRequirements>,
    #[serde(default)]
    pub model_uri: Option<String>,
    #[serde(default)]
    pub trainer_command: Option<CommandLine>,
    #[serde(default)]
    pub command: Option<CommandLine>,
    #[serde(default)]
    pub trainer_args: Option<CommandLine>,
    #[serde(default)]
    pub trainer_env: Option<EnvOverrides>,
    #[serde(default)]
    pub job_labels: BTreeMap<String, String>,
    #[serde(default)]
    pub job_annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub runtime_ref: Option<RuntimeRefOverride>,
    #[serde(default)]
    pub executor: Option<String>,
    #[serde(default)]
    pub unsloth: Option<UnslothOptions>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BackendOptions {
    pub fn from_request(request: &TrainingRequest) -> Result<Self, ManifestError> {
        serde_json::from_value(Value::Object(request.extra_parameters.clone()))
            .map_err(|e| ManifestError::invalid("extra_parameters", e.to_string()))
    }

    /// `trainer_command`, falling back to `command`.
    pub fn trainer_command(&self) -> Option<CommandLine> {
        self.trainer_command.clone().or_else(|| self.command.clone())
    }

    /// Shared `TrainJob` parameters for a backend.
    pub(crate) fn train_job_params(
        &self,
        backend: &str,
        runtime_ref: RuntimeRef,
        default_image: &str,
        api_version: &str,
        request: &TrainingRequest,
    ) -> TrainJobParams {
        let mut params = TrainJobParams::new(
            backend,
            runtime_ref,
            self.container_image
                .clone()
                .unwrap_or_else(|| default_image.to_string()),
        );
        params.command = self.trainer_command();
        params.args = self.trainer_args.clone();
        params.env = self.trainer_env.clone();
        params.num_nodes = self.num_nodes.unwrap_or(1).max(1);
        params.num_proc_per_node = self.num_proc_per_node.clone();
        params.resources_per_node = self.resources_per_node.clone();
        params.dataset_uri = request.datasets.first().map(|d| d.source.clone());
        params.labels = self.job_labels.clone();
        params.annotations = self.job_annotations.clone();
        params.api_version = if api_version.is_empty() {
            DEFAULT_TRAIN_JOB_API_VERSION.to_string()
        } else {
            api_version.to_string()
        };
        params
    }
}

/// Wrap a rendered `TrainJob` into a runner job spec.
pub(crate) fn train_job_spec(
    backend: &str,
    request: &TrainingRequest,
    manifest: &TrainJob,
) -> Result<JobSpec, ManifestError> {
    let mut spec = JobSpec::new(&request.job_id, backend);
    spec.backend_job_id = Some(manifest.name().to_string());
    spec.train_job = Some(manifest.to_value()?);
    spec.callbacks = request.callbacks.clone();
    Ok(spec)
}
