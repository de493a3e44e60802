//! Container environment and command-line synthesis.

use k8s_openapi::api::core::v1::EnvVar;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ManifestError;
use crate::schemas::TrainingRequest;

/// Build a plain `name=value` environment variable.
pub fn env_var(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.into(),
        value: Some(value.into()),
        ..Default::default()
    }
}

/// Merge `overrides` onto `base` keyed by name.
///
/// Ordering follows first appearance; a later entry with the same name
/// replaces the earlier value in place.
pub fn merge_env(base: Vec<EnvVar>, overrides: Vec<EnvVar>) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = Vec::with_capacity(base.len() + overrides.len());
    for var in base.into_iter().chain(overrides) {
        match merged.iter_mut().find(|existing| existing.name == var.name) {
            Some(existing) => *existing = var,
            None => merged.push(var),
        }
    }
    merged
}

/// Environment that lets the container rebuild the request without a side
/// channel: the full request and its sections as JSON plus scalar shortcuts.
pub fn request_env(request: &TrainingRequest, backend: &str) -> Result<Vec<EnvVar>, ManifestError> {
    let mut env = vec![
        env_var("TRAINING_JOB_ID", &request.job_id),
        env_var("TRAINING_BACKEND", backend),
        env_var("TRAINING_REQUEST_JSON", serde_json::to_string(request)?),
        env_var(
            "TRAINING_RESOURCES_JSON",
            serde_json::to_string(&request.resources)?,
        ),
        env_var(
            "TRAINING_CUSTOMIZATION_JSON",
            serde_json::to_string(&request.customization)?,
        ),
        env_var(
            "TRAINING_TUNING_PARAMETERS_JSON",
            serde_json::to_string(&request.tuning_parameters)?,
        ),
    ];
    if !request.datasets.is_empty() {
        env.push(env_var(
            "TRAINING_DATASETS_JSON",
            serde_json::to_string(&request.datasets)?,
        ));
    }
    env.push(env_var("TRAINING_LOG_URI", &request.artifacts.log_uri));
    env.push(env_var("TRAINING_OUTPUT_URI", &request.artifacts.output_uri));
    if let Some(url) = &request.artifacts.status_stream_url {
        env.push(env_var("TRAINING_STATUS_STREAM_URL", url));
    }
    env.push(env_var(
        "TRAINING_BASE_MODEL_JSON",
        serde_json::to_string(&request.base_model)?,
    ));
    Ok(env)
}

/// Caller environment overrides, either `{"NAME": value}` or
/// `[{"name": "NAME", "value": value}]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvOverrides {
    Map(Map<String, Value>),
    List(Vec<EnvOverride>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvOverride {
    pub name: String,
    #[serde(default)]
    pub value: Value,
}

impl EnvOverrides {
    pub fn into_env(self) -> Vec<EnvVar> {
        match self {
            EnvOverrides::Map(map) => map
                .into_iter()
                .map(|(name, value)| env_var(name, scalar_string(&value)))
                .collect(),
            EnvOverrides::List(items) => items
                .into_iter()
                .map(|item| env_var(item.name, scalar_string(&item.value)))
                .collect(),
        }
    }
}

/// A container command or argument list, given either as a shell string or
/// as a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Text(String),
    List(Vec<Value>),
}

impl CommandLine {
    /// Split into argv. Nulls in list form are dropped; an empty result is `None`.
    pub fn to_argv(&self) -> Result<Option<Vec<String>>, ManifestError> {
        let argv = match self {
            CommandLine::Text(text) => shlex::split(text).ok_or_else(|| {
                ManifestError::invalid("command", format!("unbalanced quoting in '{text}'"))
            })?,
            CommandLine::List(items) => items
                .iter()
                .filter(|item| !item.is_null())
                .map(scalar_string)
                .collect(),
        };
        Ok(if argv.is_empty() { None } else { Some(argv) })
    }
}

impl From<&str> for CommandLine {
    fn from(text: &str) -> Self {
        CommandLine::Text(text.to_string())
    }
}

/// Render a JSON scalar the way it would appear on a command line.
pub(crate) fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::fixtures::sample_request;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn names(env: &[EnvVar]) -> Vec<&str> {
        env.iter().map(|v| v.name.as_str()).collect()
    }

    #[test]
    fn test_merge_env_order_and_override() {
        let base = vec![env_var("A", "1"), env_var("B", "2")];
        let overrides = vec![env_var("B", "9"), env_var("C", "3")];
        let merged = merge_env(base, overrides);
        assert_eq!(
            merged,
            vec![env_var("A", "1"), env_var("B", "9"), env_var("C", "3")]
        );
    }

    #[test]
    fn test_request_env_layout() {
        let request = sample_request("job-42");
        let env = request_env(&request, "nemo").unwrap();
        assert_eq!(
            names(&env),
            vec![
                "TRAINING_JOB_ID",
                "TRAINING_BACKEND",
                "TRAINING_REQUEST_JSON",
                "TRAINING_RESOURCES_JSON",
                "TRAINING_CUSTOMIZATION_JSON",
                "TRAINING_TUNING_PARAMETERS_JSON",
                "TRAINING_DATASETS_JSON",
                "TRAINING_LOG_URI",
                "TRAINING_OUTPUT_URI",
                "TRAINING_BASE_MODEL_JSON",
            ]
        );
        let request_json = env[2].value.as_deref().unwrap();
        let parsed: Value = serde_json::from_str(request_json).unwrap();
        assert_eq!(parsed["job_id"], "job-42");
    }

    #[test]
    fn test_status_stream_url_included_when_set() {
        let mut request = sample_request("job-42");
        request.artifacts.status_stream_url = Some("https://status.example/stream".into());
        let env = request_env(&request, "meta").unwrap();
        assert!(names(&env).contains(&"TRAINING_STATUS_STREAM_URL"));
    }

    #[test]
    fn test_env_overrides_both_forms() {
        let map: EnvOverrides = serde_json::from_value(json!({"A": "x", "N": 3})).unwrap();
        assert_eq!(map.into_env(), vec![env_var("A", "x"), env_var("N", "3")]);

        let list: EnvOverrides =
            serde_json::from_value(json!([{"name": "A", "value": "x"}, {"name": "B"}])).unwrap();
        assert_eq!(list.into_env(), vec![env_var("A", "x"), env_var("B", "")]);
    }

    #[test]
    fn test_map_overrides_keep_caller_order() {
        let overrides: EnvOverrides =
            serde_json::from_str(r#"{"ZETA": "z", "ALPHA": "a", "A": "replaced"}"#).unwrap();
        let merged = merge_env(vec![env_var("A", "base")], overrides.into_env());
        let names: Vec<&str> = merged.iter().map(|var| var.name.as_str()).collect();
        assert_eq!(names, vec!["A", "ZETA", "ALPHA"]);
        assert_eq!(merged[0], env_var("A", "replaced"));
    }

    #[test]
    fn test_command_line_split() {
        let cmd = CommandLine::from("python -m train --name 'my run'");
        assert_eq!(
            cmd.to_argv().unwrap().unwrap(),
            vec!["python", "-m", "train", "--name", "my run"]
        );

        let list: CommandLine = serde_json::from_value(json!(["torchrun", null, 8])).unwrap();
        assert_eq!(list.to_argv().unwrap().unwrap(), vec!["torchrun", "8"]);

        assert_eq!(CommandLine::List(vec![]).to_argv().unwrap(), None);
        assert!(CommandLine::from("echo 'oops").to_argv().is_err());
    }
}
