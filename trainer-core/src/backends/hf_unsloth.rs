//! Hugging Face + Unsloth backend.
//!
//! Produces a plain job spec for a launcher outside the cluster; no
//! `TrainJob` manifest is rendered.

use serde_json::{Value, json};

use super::{BackendOptions, TrainerBackend};
use crate::error::ManifestError;
use crate::runner::JobSpec;
use crate::schemas::{CustomizationMethod, ModelProvider, TrainingRequest};

pub const UNSLOTH_IMAGE: &str = "ghcr.io/unslothai/unsloth-trainer:latest";

#[derive(Debug, Default)]
pub struct HfUnslothBackend;

impl HfUnslothBackend {
    pub fn new() -> Self {
        Self
    }
}

impl TrainerBackend for HfUnslothBackend {
    fn name(&self) -> &str {
        "hf-unsloth"
    }

    fn validate_request(&self, request: &TrainingRequest) -> Result<(), ManifestError> {
        if !matches!(
            request.base_model.provider,
            ModelProvider::Huggingface
                | ModelProvider::Meta
                | ModelProvider::Mistral
                | ModelProvider::Tii
                | ModelProvider::Custom
        ) {
            return Err(ManifestError::unsupported(
                self.name(),
                "limited to Hugging Face hosted models",
            ));
        }
        if !matches!(
            request.customization.method,
            CustomizationMethod::Lora | CustomizationMethod::Qlora | CustomizationMethod::Peft
        ) {
            return Err(ManifestError::unsupported(
                self.name(),
                "only parameter-efficient methods (lora, qlora, peft) are supported",
            ));
        }
        if request.resources.gpus < 1 {
            return Err(ManifestError::unsupported(
                self.name(),
                "at least one GPU is required",
            ));
        }
        Ok(())
    }

    fn build_job_spec(&self, request: &TrainingRequest) -> Result<JobSpec, ManifestError> {
        let options = BackendOptions::from_request(request)?;
        let unsloth = options.unsloth.clone().unwrap_or_default();

        let mut spec = JobSpec::new(&request.job_id, self.name());
        spec.backend_job_id = Some(format!("hf-unsloth-{}", request.job_id));
        spec.callbacks = request.callbacks.clone();

        let payload: [(&str, Value); 9] = [
            (
                "container_image",
                json!(options.container_image.as_deref().unwrap_or(UNSLOTH_IMAGE)),
            ),
            ("launcher", json!("accelerate")),
            ("model", serde_json::to_value(&request.base_model)?),
            ("datasets", serde_json::to_value(&request.datasets)?),
            ("resources", serde_json::to_value(&request.resources)?),
            ("customization", serde_json::to_value(&request.customization)?),
            (
                "tuning_parameters",
                serde_json::to_value(&request.tuning_parameters)?,
            ),
            ("unsloth", serde_json::to_value(&unsloth)?),
            ("artifacts", serde_json::to_value(&request.artifacts)?),
        ];
        spec.payload = payload
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect();
        Ok(spec)
    }
}
