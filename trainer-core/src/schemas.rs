//! Request schemas shared by every trainer backend.
//!
//! A [`TrainingRequest`] is an immutable description of a fine-tuning job.
//! It is deserialized from the JSON payload handed over by the API layer and
//! then only read by the manifest builders.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ManifestError;

/// Model provider of the base model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelProvider {
    Nemo,
    Nemotron,
    Meta,
    Huggingface,
    Bim,
    Mistral,
    Tii,
    Custom,
}

impl std::fmt::Display for ModelProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelProvider::Nemo => "nemo",
            ModelProvider::Nemotron => "nemotron",
            ModelProvider::Meta => "meta",
            ModelProvider::Huggingface => "huggingface",
            ModelProvider::Bim => "bim",
            ModelProvider::Mistral => "mistral",
            ModelProvider::Tii => "tii",
            ModelProvider::Custom => "custom",
        };
        write!(f, "{name}")
    }
}

/// Credentials attached to a dataset source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
}

/// Base model to fine-tune.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseModelSpec {
    pub provider: ModelProvider,
    /// Model identifier, e.g. `meta-llama/Llama-2-7b`.
    pub model_name: String,
    #[serde(default = "default_revision", skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// Direct download URL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weights_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub huggingface_token: Option<String>,
}

fn default_revision() -> Option<String> {
    Some("main".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetFormat {
    Jsonl,
    Parquet,
    Csv,
    Hf,
    Nemo,
}

/// A single dataset source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// URI or path to the dataset.
    pub source: String,
    pub format: DatasetFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub split: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    #[serde(default = "default_lora_rank")]
    pub rank: u32,
    #[serde(default)]
    pub target_modules: Vec<String>,
    #[serde(default = "default_lora_alpha")]
    pub alpha: u32,
    #[serde(default = "default_lora_dropout")]
    pub dropout: f64,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: default_lora_rank(),
            target_modules: Vec::new(),
            alpha: default_lora_alpha(),
            dropout: default_lora_dropout(),
        }
    }
}

fn default_lora_rank() -> u32 {
    16
}

fn default_lora_alpha() -> u32 {
    32
}

fn default_lora_dropout() -> f64 {
    0.05
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputeDtype {
    Float16,
    Bfloat16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantType {
    Nf4,
    Fp4,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QloraConfig {
    #[serde(default = "default_true")]
    pub use_double_quant: bool,
    #[serde(default = "default_compute_dtype")]
    pub bnb_4bit_compute_dtype: ComputeDtype,
    #[serde(default = "default_quant_type")]
    pub bnb_4bit_quant_type: QuantType,
}

impl Default for QloraConfig {
    fn default() -> Self {
        Self {
            use_double_quant: true,
            bnb_4bit_compute_dtype: default_compute_dtype(),
            bnb_4bit_quant_type: default_quant_type(),
        }
    }
}

fn default_compute_dtype() -> ComputeDtype {
    ComputeDtype::Bfloat16
}

fn default_quant_type() -> QuantType {
    QuantType::Nf4
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeftConfig {
    #[serde(default, rename = "use")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// Fine-tuning method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomizationMethod {
    Full,
    #[default]
    Lora,
    Qlora,
    Peft,
    Adapter,
}

impl std::fmt::Display for CustomizationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CustomizationMethod::Full => write!(f, "full"),
            CustomizationMethod::Lora => write!(f, "lora"),
            CustomizationMethod::Qlora => write!(f, "qlora"),
            CustomizationMethod::Peft => write!(f, "peft"),
            CustomizationMethod::Adapter => write!(f, "adapter"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Fp32,
    Fp16,
    #[default]
    Bf16,
    Int8,
}

/// How the base model is customized.
///
/// Deserialization goes through [`CustomizationOptionsInput`] so that a
/// `lora`/`qlora` method always carries its sub-config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "CustomizationOptionsInput")]
pub struct CustomizationOptions {
    pub method: CustomizationMethod,
    pub trainable_layers: Vec<String>,
    pub precision: Precision,
    pub gradient_checkpointing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoraConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qlora: Option<QloraConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peft: Option<PeftConfig>,
}

impl CustomizationOptions {
    /// Options for `method` with every default filled in.
    pub fn new(method: CustomizationMethod) -> Self {
        CustomizationOptionsInput {
            method,
            ..Default::default()
        }
        .into()
    }
}

impl Default for CustomizationOptions {
    fn default() -> Self {
        Self::new(CustomizationMethod::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CustomizationOptionsInput {
    #[serde(default)]
    method: CustomizationMethod,
    #[serde(default)]
    trainable_layers: Vec<String>,
    #[serde(default)]
    precision: Precision,
    #[serde(default = "default_true")]
    gradient_checkpointing: bool,
    #[serde(default)]
    lora: Option<LoraConfig>,
    #[serde(default)]
    qlora: Option<QloraConfig>,
    #[serde(default)]
    peft: Option<PeftConfig>,
}

impl Default for CustomizationOptionsInput {
    fn default() -> Self {
        Self {
            method: CustomizationMethod::default(),
            trainable_layers: Vec::new(),
            precision: Precision::default(),
            gradient_checkpointing: true,
            lora: None,
            qlora: None,
            peft: None,
        }
    }
}

impl From<CustomizationOptionsInput> for CustomizationOptions {
    fn from(input: CustomizationOptionsInput) -> Self {
        let lora = match (input.method, input.lora) {
            (CustomizationMethod::Lora, None) => Some(LoraConfig::default()),
            (_, lora) => lora,
        };
        let qlora = match (input.method, input.qlora) {
            (CustomizationMethod::Qlora, None) => Some(QloraConfig::default()),
            (_, qlora) => qlora,
        };
        Self {
            method: input.method,
            trainable_layers: input.trainable_layers,
            precision: input.precision,
            gradient_checkpointing: input.gradient_checkpointing,
            lora,
            qlora,
            peft: input.peft,
        }
    }
}

/// Compute quota for the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    #[serde(default = "default_gpus")]
    pub gpus: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_type: Option<String>,
    #[serde(default = "default_cpus")]
    pub cpus: u32,
    #[serde(default = "default_memory_gb")]
    pub memory_gb: u32,
    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: u32,
}

impl Default for ResourceSpec {
    fn default() -> Self {
        Self {
            gpus: default_gpus(),
            gpu_type: None,
            cpus: default_cpus(),
            memory_gb: default_memory_gb(),
            max_duration_minutes: default_max_duration_minutes(),
        }
    }
}

fn default_gpus() -> u32 {
    1
}

fn default_cpus() -> u32 {
    8
}

fn default_memory_gb() -> u32 {
    64
}

fn default_max_duration_minutes() -> u32 {
    480
}

/// Where logs and outputs are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    pub log_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_stream_url: Option<String>,
    pub output_uri: String,
}

/// Caller-supplied webhook configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    /// Carried through to the job spec; the dispatcher relays every tick.
    #[serde(default = "default_event_filter")]
    pub event_filter: Vec<String>,
}

impl Default for CallbackSpec {
    fn default() -> Self {
        Self {
            webhook_url: None,
            auth_header: None,
            event_filter: default_event_filter(),
        }
    }
}

impl CallbackSpec {
    pub fn webhook(url: impl Into<String>) -> Self {
        Self {
            webhook_url: Some(url.into()),
            ..Default::default()
        }
    }
}

fn default_event_filter() -> Vec<String> {
    vec![
        "submitted".to_string(),
        "failed".to_string(),
        "succeeded".to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperParameterSpec {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub micro_batch_size: Option<u32>,
    #[serde(default = "default_num_epochs")]
    pub num_epochs: u32,
    #[serde(default = "default_warmup_ratio")]
    pub warmup_ratio: f64,
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: u32,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

impl Default for HyperParameterSpec {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            batch_size: default_batch_size(),
            micro_batch_size: None,
            num_epochs: default_num_epochs(),
            warmup_ratio: default_warmup_ratio(),
            max_sequence_length: default_max_sequence_length(),
            weight_decay: default_weight_decay(),
        }
    }
}

fn default_learning_rate() -> f64 {
    5e-5
}

fn default_batch_size() -> u32 {
    32
}

fn default_num_epochs() -> u32 {
    3
}

fn default_warmup_ratio() -> f64 {
    0.1
}

fn default_max_sequence_length() -> u32 {
    2048
}

fn default_weight_decay() -> f64 {
    0.01
}

fn default_true() -> bool {
    true
}

/// A fine-tuning job as submitted by the API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub job_id: String,
    pub base_model: BaseModelSpec,
    pub datasets: Vec<DatasetSpec>,
    pub customization: CustomizationOptions,
    pub resources: ResourceSpec,
    pub artifacts: ArtifactSpec,
    pub tuning_parameters: HyperParameterSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callbacks: Option<CallbackSpec>,
    /// Backend-specific knobs, interpreted by each backend's typed options.
    #[serde(default)]
    pub extra_parameters: Map<String, Value>,
}

impl TrainingRequest {
    /// Parse a request from its JSON form and check its invariants.
    pub fn from_json(value: Value) -> Result<Self, ManifestError> {
        let request: Self = serde_json::from_value(value)?;
        request.validate()?;
        Ok(request)
    }

    /// Check the invariants the manifest builders rely on.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.job_id.trim().is_empty() {
            return Err(ManifestError::MissingField {
                field: "job_id".into(),
            });
        }
        if self.datasets.is_empty() {
            return Err(ManifestError::invalid(
                "datasets",
                "at least one dataset is required",
            ));
        }
        if self.resources.cpus == 0 {
            return Err(ManifestError::invalid("resources.cpus", "must be >= 1"));
        }
        if self.resources.memory_gb == 0 {
            return Err(ManifestError::invalid("resources.memory_gb", "must be >= 1"));
        }
        if self.tuning_parameters.learning_rate <= 0.0 {
            return Err(ManifestError::invalid(
                "tuning_parameters.learning_rate",
                "must be > 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.tuning_parameters.warmup_ratio) {
            return Err(ManifestError::invalid(
                "tuning_parameters.warmup_ratio",
                "must be within [0, 1]",
            ));
        }
        if let Some(lora) = &self.customization.lora {
            if !(0.0..=1.0).contains(&lora.dropout) {
                return Err(ManifestError::invalid(
                    "customization.lora.dropout",
                    "must be within [0, 1]",
                ));
            }
        }
        if let Some(url) = self
            .callbacks
            .as_ref()
            .and_then(|c| c.webhook_url.as_deref())
        {
            url::Url::parse(url)
                .map_err(|e| ManifestError::invalid("callbacks.webhook_url", e.to_string()))?;
        }
        Ok(())
    }

    /// The request as JSON with unset optional fields omitted.
    pub fn to_json(&self) -> Result<Value, ManifestError> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Response returned to the API layer after scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingResponse {
    pub job_id: String,
    pub backend_job_id: String,
    pub status: crate::runner::JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}
