//! Meta (Llama) backend.

use super::{BackendOptions, BackendSettings, TrainerBackend, train_job_spec};
use crate::error::ManifestError;
use crate::manifest::{CommandLine, build_train_job};
use crate::runner::JobSpec;
use crate::schemas::{CustomizationMethod, ModelProvider, TrainingRequest};

pub const META_IMAGE: &str = "ghcr.io/meta-llm/meta-trainer:latest";
pub const META_RUNTIME: &str = "meta-runtime";
pub const DEFAULT_EXECUTOR: &str = "torchrun";

pub struct MetaBackend {
    settings: BackendSettings,
}

impl MetaBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl TrainerBackend for MetaBackend {
    fn name(&self) -> &str {
        "meta"
    }

    fn validate_request(&self, request: &TrainingRequest) -> Result<(), ManifestError> {
        if !matches!(
            request.base_model.provider,
            ModelProvider::Meta | ModelProvider::Huggingface
        ) {
            return Err(ManifestError::unsupported(
                self.name(),
                "expects Meta released models or Hugging Face mirrors",
            ));
        }
        if request.resources.gpus < 2 {
            return Err(ManifestError::unsupported(
                self.name(),
                "adapters need at least 2 GPUs",
            ));
        }
        if request.customization.method == CustomizationMethod::Full
            && request.resources.memory_gb < 128
        {
            return Err(ManifestError::unsupported(
                self.name(),
                "full fine-tuning needs at least 128GB of host memory",
            ));
        }
        Ok(())
    }

    fn build_job_spec(&self, request: &TrainingRequest) -> Result<JobSpec, ManifestError> {
        let options = BackendOptions::from_request(request)?;
        let runtime_ref = self
            .settings
            .runtime_ref(META_RUNTIME, options.runtime_ref.as_ref());
        let mut params = options.train_job_params(
            self.name(),
            runtime_ref,
            META_IMAGE,
            &self.settings.train_job_api_version,
            request,
        );
        let executor = options.executor.as_deref().unwrap_or(DEFAULT_EXECUTOR);
        params.command = options
            .trainer_command()
            .or_else(|| Some(CommandLine::from(executor)));
        params.model_uri = request.base_model.weights_url.clone();

        let manifest = build_train_job(request, params)?;
        train_job_spec(self.name(), request, &manifest)
    }
}
