//! Configuration system for the trainer control plane.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> env vars.

use crate::error::ConfigError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when no namespace is configured.
pub const NAMESPACE_ENV_VAR: &str = "TRAINER_JOBS_NAMESPACE";

/// Namespace file mounted into every pod with a service account.
pub const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub runner: RunnerConfig,
    pub callbacks: CallbackSettings,
    pub runtime: RuntimeConfig,
    pub storage: StorageSettings,
}

/// Which job runner implementation is used for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerBackend {
    /// In-process job table. Jobs never complete on their own.
    #[default]
    #[serde(alias = "mock")]
    Memory,
    /// Kubeflow `TrainJob` custom resources.
    #[serde(alias = "k8s")]
    Kubernetes,
}

impl std::fmt::Display for RunnerBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerBackend::Memory => write!(f, "memory"),
            RunnerBackend::Kubernetes => write!(f, "kubernetes"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub backend: RunnerBackend,
    /// Explicit namespace; see [`detect_namespace`] for the fallback chain.
    pub namespace: Option<String>,
    /// `<group>/<version>` of the TrainJob custom resource.
    pub train_job_api_version: String,
    pub train_job_plural: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            backend: RunnerBackend::Memory,
            namespace: None,
            train_job_api_version: "trainer.kubeflow.org/v1alpha1".to_string(),
            train_job_plural: "trainjobs".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Split `train_job_api_version` into its group and version.
    pub fn group_version(&self) -> Result<(&str, &str), ConfigError> {
        match self.train_job_api_version.split_once('/') {
            Some((group, version)) if !group.is_empty() && !version.is_empty() => {
                Ok((group, version))
            }
            _ => Err(ConfigError::Invalid {
                message: format!(
                    "train_job_api_version must be in the form <group>/<version>, got '{}'",
                    self.train_job_api_version
                ),
            }),
        }
    }
}

/// Webhook dispatcher timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackSettings {
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for CallbackSettings {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            timeout_secs: 5,
        }
    }
}

impl CallbackSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Runtime reference defaults applied to every TrainJob manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Overrides each backend's own runtime name when set.
    pub name: Option<String>,
    pub kind: String,
    pub api_group: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: None,
            kind: "ClusterTrainingRuntime".to_string(),
            api_group: "trainer.kubeflow.org".to_string(),
        }
    }
}

/// Local scratch space used by checkpoint materialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub local_root: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("/tmp/trainer"),
        }
    }
}

/// Path of the user-level config file, if a home directory can be resolved.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "deepfinery", "trainer")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from all layers.
///
/// Order: defaults, then the user-level `config.toml`, then `config_path`
/// (which must exist when given), then `TRAINER_*` environment variables
/// (`TRAINER_RUNNER__BACKEND=kubernetes`), then explicit overrides.
pub fn load_config(
    config_path: Option<&Path>,
    overrides: Option<&TrainerConfig>,
) -> Result<TrainerConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(TrainerConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    figment = figment.merge(Env::prefixed("TRAINER_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: TrainerConfig = figment.extract().map_err(Box::new)?;
    config.runner.group_version()?;
    Ok(config)
}

/// Resolve the namespace jobs are created in.
///
/// Order: the configured namespace, `TRAINER_JOBS_NAMESPACE`, the pod's
/// service-account namespace file, then `default`.
pub fn detect_namespace(config: &RunnerConfig) -> String {
    resolve_namespace(
        config.namespace.as_deref(),
        std::env::var(NAMESPACE_ENV_VAR).ok().as_deref(),
        Path::new(SERVICE_ACCOUNT_NAMESPACE_FILE),
    )
}

pub(crate) fn resolve_namespace(
    configured: Option<&str>,
    env_value: Option<&str>,
    namespace_file: &Path,
) -> String {
    if let Some(ns) = configured.filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }
    if let Some(ns) = env_value.filter(|ns| !ns.is_empty()) {
        return ns.to_string();
    }
    match std::fs::read_to_string(namespace_file) {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        Ok(_) => "default".to_string(),
        Err(e) => {
            tracing::debug!(path = %namespace_file.display(), error = %e, "No service account namespace");
            "default".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_default_config() {
        let config = TrainerConfig::default();
        assert_eq!(config.runner.backend, RunnerBackend::Memory);
        assert_eq!(config.runner.train_job_plural, "trainjobs");
        assert_eq!(config.callbacks.interval(), Duration::from_secs(60));
        assert_eq!(config.callbacks.timeout(), Duration::from_secs(5));
        assert_eq!(config.runtime.kind, "ClusterTrainingRuntime");
        assert_eq!(config.storage.local_root, PathBuf::from("/tmp/trainer"));
    }

    #[test]
    fn test_group_version_split() {
        let config = RunnerConfig::default();
        assert_eq!(
            config.group_version().unwrap(),
            ("trainer.kubeflow.org", "v1alpha1")
        );

        let bad = RunnerConfig {
            train_job_api_version: "v1".into(),
            ..Default::default()
        };
        assert!(bad.group_version().is_err());
    }

    #[test]
    fn test_backend_aliases() {
        let backend: RunnerBackend = serde_json::from_str("\"k8s\"").unwrap();
        assert_eq!(backend, RunnerBackend::Kubernetes);
        let backend: RunnerBackend = serde_json::from_str("\"mock\"").unwrap();
        assert_eq!(backend, RunnerBackend::Memory);
    }

    #[test]
    fn test_load_config_layers_file_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "trainer.toml",
                r#"
                [runner]
                backend = "kubernetes"
                namespace = "ml"

                [callbacks]
                interval_secs = 30
                "#,
            )?;
            jail.set_env("TRAINER_CALLBACKS__TIMEOUT_SECS", "2");

            let config = load_config(Some(Path::new("trainer.toml")), None).unwrap();
            assert_eq!(config.runner.backend, RunnerBackend::Kubernetes);
            assert_eq!(config.runner.namespace.as_deref(), Some("ml"));
            assert_eq!(config.callbacks.interval_secs, 30);
            assert_eq!(config.callbacks.timeout_secs, 2);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_overrides_win() {
        Jail::expect_with(|jail| {
            jail.set_env("TRAINER_RUNNER__BACKEND", "kubernetes");
            let overrides = TrainerConfig::default();
            let config = load_config(None, Some(&overrides)).unwrap();
            assert_eq!(config.runner.backend, RunnerBackend::Memory);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config(Some(Path::new("/nonexistent/trainer.toml")), None).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_namespace_resolution_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("namespace");
        std::fs::write(&file, "from-file\n").unwrap();

        assert_eq!(resolve_namespace(Some("cfg"), Some("env"), &file), "cfg");
        assert_eq!(resolve_namespace(None, Some("env"), &file), "env");
        assert_eq!(resolve_namespace(Some(""), None, &file), "from-file");
        assert_eq!(
            resolve_namespace(None, None, &dir.path().join("missing")),
            "default"
        );
    }
}
