//! Framework-agnostic launch request rendered as a `PyTorchJob`.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ManifestError;

/// Training framework dispatched inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Nemo,
    #[serde(alias = "huggingface")]
    Hf,
    Meta,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Nemo => "nemo",
            Framework::Hf => "hf",
            Framework::Meta => "meta",
        }
    }
}

impl std::fmt::Display for Framework {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Framework {
    type Err = ManifestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "nemo" => Ok(Framework::Nemo),
            "hf" | "huggingface" => Ok(Framework::Hf),
            "meta" => Ok(Framework::Meta),
            other => Err(ManifestError::invalid(
                "framework",
                format!("unsupported framework '{other}'"),
            )),
        }
    }
}

/// What to launch, and where its checkpoints, logs and config live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJobRequest {
    pub framework: Framework,
    pub model_id: String,
    pub run_id: String,
    /// Base URI for checkpoints, logs and configs. Trailing slashes are stripped.
    #[serde(deserialize_with = "deserialize_uri")]
    pub checkpoint_base_uri: String,
    #[serde(deserialize_with = "deserialize_uri")]
    pub dataset_uri: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_one")]
    pub num_nodes: u32,
    #[serde(default = "default_one")]
    pub gpus_per_node: u32,
    #[serde(default = "default_cpus_per_node")]
    pub cpus_per_node: u32,
    #[serde(default = "default_memory_per_node_gb")]
    pub memory_per_node_gb: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<String>,
    #[serde(default)]
    pub resume_from_checkpoint: bool,
    /// Framework overrides forwarded to the container as CLI flags.
    #[serde(default)]
    pub extra_args: Map<String, Value>,
    /// Merged over the derived env in the order given.
    #[serde(default)]
    pub env: Map<String, Value>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
}

fn deserialize_uri<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let uri = String::deserialize(deserializer)?;
    Ok(normalize_uri(&uri))
}

pub(crate) fn normalize_uri(uri: &str) -> String {
    uri.trim_end_matches('/').to_string()
}

fn default_image() -> String {
    "ghcr.io/deepfinery/trainer:latest".to_string()
}

fn default_one() -> u32 {
    1
}

fn default_cpus_per_node() -> u32 {
    32
}

fn default_memory_per_node_gb() -> u32 {
    256
}

impl TrainingJobRequest {
    pub fn new(
        framework: Framework,
        model_id: impl Into<String>,
        run_id: impl Into<String>,
        checkpoint_base_uri: &str,
        dataset_uri: &str,
    ) -> Self {
        Self {
            framework,
            model_id: model_id.into(),
            run_id: run_id.into(),
            checkpoint_base_uri: normalize_uri(checkpoint_base_uri),
            dataset_uri: normalize_uri(dataset_uri),
            image: default_image(),
            num_nodes: 1,
            gpus_per_node: 1,
            cpus_per_node: default_cpus_per_node(),
            memory_per_node_gb: default_memory_per_node_gb(),
            config_path: None,
            resume_from_checkpoint: false,
            extra_args: Map::new(),
            env: Map::new(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            namespace: None,
            job_name: None,
        }
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        for (field, value) in [
            ("num_nodes", self.num_nodes),
            ("gpus_per_node", self.gpus_per_node),
            ("cpus_per_node", self.cpus_per_node),
            ("memory_per_node_gb", self.memory_per_node_gb),
        ] {
            if value < 1 {
                return Err(ManifestError::invalid(field, "must be >= 1"));
            }
        }
        if self.run_id.trim().is_empty() {
            return Err(ManifestError::MissingField {
                field: "run_id".into(),
            });
        }
        if self.model_id.trim().is_empty() {
            return Err(ManifestError::MissingField {
                field: "model_id".into(),
            });
        }
        Ok(())
    }

    /// `<base>/<run_id>/framework=<framework>`
    pub fn checkpoint_prefix(&self) -> String {
        format!(
            "{}/{}/framework={}",
            self.checkpoint_base_uri, self.run_id, self.framework
        )
    }

    pub fn checkpoints_uri(&self) -> String {
        format!("{}/checkpoints", self.checkpoint_prefix())
    }

    pub fn logs_uri(&self) -> String {
        format!("{}/logs", self.checkpoint_prefix())
    }

    pub fn config_uri(&self) -> String {
        format!("{}/config", self.checkpoint_prefix())
    }
}

/// Parse trailing `--flag value` pairs handed to the training entrypoint.
///
/// Dashes in flag names become underscores; a flag followed by another flag
/// (or nothing) is `true`. Tokens that are not flags are skipped.
pub fn parse_framework_cli<I, S>(args: I) -> Map<String, Value>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
    let mut overrides = Map::new();
    let mut i = 0;
    while i < args.len() {
        let token = &args[i];
        if !token.starts_with("--") {
            i += 1;
            continue;
        }
        let key = token.trim_start_matches('-').replace('-', "_");
        match args.get(i + 1) {
            Some(next) if !next.starts_with("--") => {
                overrides.insert(key, Value::String(next.clone()));
                i += 2;
            }
            _ => {
                overrides.insert(key, Value::Bool(true));
                i += 1;
            }
        }
    }
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trailing_slashes_stripped() {
        let request: TrainingJobRequest = serde_json::from_value(json!({
            "framework": "hf",
            "model_id": "meta-llama/Llama-2-7b",
            "run_id": "run-1",
            "checkpoint_base_uri": "s3://bucket/ckpt//",
            "dataset_uri": "s3://bucket/data/"
        }))
        .unwrap();
        assert_eq!(request.checkpoint_base_uri, "s3://bucket/ckpt");
        assert_eq!(request.dataset_uri, "s3://bucket/data");
        assert_eq!(request.gpus_per_node, 1);
        assert_eq!(request.image, "ghcr.io/deepfinery/trainer:latest");
    }

    #[test]
    fn test_derived_uris() {
        let request =
            TrainingJobRequest::new(Framework::Nemo, "m", "run-9", "s3://b/base/", "s3://b/d");
        assert_eq!(request.checkpoint_prefix(), "s3://b/base/run-9/framework=nemo");
        assert_eq!(
            request.checkpoints_uri(),
            "s3://b/base/run-9/framework=nemo/checkpoints"
        );
        assert_eq!(request.logs_uri(), "s3://b/base/run-9/framework=nemo/logs");
        assert_eq!(request.config_uri(), "s3://b/base/run-9/framework=nemo/config");
    }

    #[test]
    fn test_validate_rejects_zero_nodes() {
        let mut request = TrainingJobRequest::new(Framework::Meta, "m", "r", "/tmp/c", "/tmp/d");
        assert!(request.validate().is_ok());
        request.num_nodes = 0;
        assert!(request.validate().is_err());
    }

    #[test]
    fn test_framework_parse() {
        assert_eq!("huggingface".parse::<Framework>().unwrap(), Framework::Hf);
        assert!("jax".parse::<Framework>().is_err());
    }

    #[test]
    fn test_parse_framework_cli() {
        let overrides = parse_framework_cli([
            "--learning-rate",
            "0.1",
            "--bf16",
            "--max-steps",
            "10",
            "stray",
            "--flash-attn",
        ]);
        assert_eq!(
            Value::Object(overrides),
            json!({
                "learning_rate": "0.1",
                "bf16": true,
                "max_steps": "10",
                "flash_attn": true
            })
        );
    }
}
