//! NeMo / Nemotron backend.

use super::{BackendOptions, BackendSettings, TrainerBackend, train_job_spec};
use crate::error::ManifestError;
use crate::manifest::build_train_job;
use crate::runner::JobSpec;
use crate::schemas::{CustomizationMethod, ModelProvider, TrainingRequest};

pub const NEMO_IMAGE: &str = "nvcr.io/nvidia/nemo:24.03";
pub const NEMO_RUNTIME: &str = "nemo-runtime";

const SUPPORTED_PROVIDERS: &[ModelProvider] = &[
    ModelProvider::Nemo,
    ModelProvider::Nemotron,
    ModelProvider::Bim,
];

pub struct NemoBackend {
    settings: BackendSettings,
}

impl NemoBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

impl TrainerBackend for NemoBackend {
    fn name(&self) -> &str {
        "nemo"
    }

    fn validate_request(&self, request: &TrainingRequest) -> Result<(), ManifestError> {
        let provider = request.base_model.provider;
        if !SUPPORTED_PROVIDERS.contains(&provider) {
            return Err(ManifestError::unsupported(
                self.name(),
                format!("only nemo, nemotron and bim providers are supported, got {provider}"),
            ));
        }
        if request.resources.gpus < 1 {
            return Err(ManifestError::unsupported(
                self.name(),
                "fine-tuning requires at least one GPU",
            ));
        }
        if request.customization.method == CustomizationMethod::Full && request.resources.gpus < 4 {
            return Err(ManifestError::unsupported(
                self.name(),
                "full fine-tuning needs at least 4 GPUs",
            ));
        }
        Ok(())
    }

    fn build_job_spec(&self, request: &TrainingRequest) -> Result<JobSpec, ManifestError> {
        let options = BackendOptions::from_request(request)?;
        let runtime_ref = self
            .settings
            .runtime_ref(NEMO_RUNTIME, options.runtime_ref.as_ref());
        let mut params = options.train_job_params(
            self.name(),
            runtime_ref,
            NEMO_IMAGE,
            &self.settings.train_job_api_version,
            request,
        );
        params.model_uri = options
            .model_uri
            .clone()
            .or_else(|| request.base_model.weights_url.clone());

        let manifest = build_train_job(request, params)?;
        train_job_spec(self.name(), request, &manifest)
    }
}
