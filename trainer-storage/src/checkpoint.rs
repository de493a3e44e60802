//! Checkpoint discovery, save and resume materialization for one run.
//!
//! Two physical layouts are recognized under `checkpoints/`:
//! single files whose key contains `step-<n>` or `step=<n>`, and Hugging
//! Face style `checkpoint-<n>/` directories. Directory candidates are
//! reported with a trailing `/` so callers can tell the layouts apart.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StorageError};
use crate::storage::StorageDriver;

pub const CHECKPOINTS_DIR: &str = "checkpoints";
pub const LOGS_DIR: &str = "logs";
pub const CONFIG_DIR: &str = "config";
pub const RUN_CONFIG_KEY: &str = "config/run.json";

/// Metadata key pointing a checkpoint record at a remote directory.
pub const HF_CHECKPOINT_DIR_KEY: &str = "hf_checkpoint_dir";

static STEP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"step[-=](\d+)").expect("step pattern is valid"));
static HF_CHECKPOINT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"checkpoint-(\d+)").expect("checkpoint pattern is valid"));

/// JSON record written by [`CheckpointManager::save_checkpoint`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub framework: String,
    pub step: u64,
    /// Seconds since the Unix epoch.
    pub saved_at: f64,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A checkpoint found in a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointCandidate {
    /// A single object, e.g. `checkpoints/step-000010.json`.
    File { key: String, step: u64 },
    /// A directory prefix ending in `/`, e.g. `checkpoints/checkpoint-12/`.
    Directory { prefix: String, step: u64 },
}

impl CheckpointCandidate {
    /// Match one listed key. The `step` pattern wins over the directory one.
    pub fn from_key(key: &str) -> Option<Self> {
        if let Some(step) = STEP_PATTERN
            .captures(key)
            .and_then(|c| c[1].parse::<u64>().ok())
        {
            return Some(Self::File {
                key: key.to_string(),
                step,
            });
        }
        let captures = HF_CHECKPOINT_PATTERN.captures(key)?;
        let step = captures[1].parse::<u64>().ok()?;
        let marker = &captures[0];
        let end = key.rfind(marker)? + marker.len();
        Some(Self::Directory {
            prefix: format!("{}/", &key[..end]),
            step,
        })
    }

    pub fn step(&self) -> u64 {
        match self {
            Self::File { step, .. } | Self::Directory { step, .. } => *step,
        }
    }

    /// The key to hand to [`CheckpointManager::materialize_checkpoint`].
    pub fn key(&self) -> &str {
        match self {
            Self::File { key, .. } => key,
            Self::Directory { prefix, .. } => prefix,
        }
    }

    pub fn into_key(self) -> String {
        match self {
            Self::File { key, .. } => key,
            Self::Directory { prefix, .. } => prefix,
        }
    }
}

/// Highest-step candidate among `keys`. On equal steps the first one seen
/// is kept.
pub fn latest_candidate<'a>(keys: impl IntoIterator<Item = &'a str>) -> Option<CheckpointCandidate> {
    keys.into_iter()
        .filter_map(CheckpointCandidate::from_key)
        .fold(None, |best: Option<CheckpointCandidate>, candidate| match best {
            Some(current) if current.step() >= candidate.step() => Some(current),
            _ => Some(candidate),
        })
}

/// Checkpoint, log and config handling for one run's storage prefix.
pub struct CheckpointManager {
    driver: StorageDriver,
    framework: String,
    local_root: PathBuf,
}

impl CheckpointManager {
    /// `local_root` holds scratch files for this run and is created if
    /// missing.
    pub fn new(
        driver: StorageDriver,
        framework: impl Into<String>,
        local_root: impl Into<PathBuf>,
    ) -> Result<Self> {
        let local_root = local_root.into();
        std::fs::create_dir_all(&local_root)?;
        Ok(Self {
            driver,
            framework: framework.into(),
            local_root,
        })
    }

    /// Manager for `prefix_uri` with scratch space at `<scratch_root>/<run_id>`.
    pub fn for_run(
        prefix_uri: &str,
        framework: impl Into<String>,
        run_id: &str,
        scratch_root: &Path,
    ) -> Result<Self> {
        let driver = StorageDriver::from_uri(prefix_uri)?;
        Self::new(driver, framework, scratch_root.join(run_id))
    }

    pub fn driver(&self) -> &StorageDriver {
        &self.driver
    }

    pub fn framework(&self) -> &str {
        &self.framework
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Write `.keep` markers under `checkpoints/`, `logs/` and `config/`.
    /// Failures are logged and ignored.
    pub async fn ensure_layout(&self) {
        for folder in [CHECKPOINTS_DIR, LOGS_DIR, CONFIG_DIR] {
            let marker = format!("{folder}/.keep");
            if let Err(e) = self.driver.upload_bytes(&marker, Vec::new()).await {
                tracing::debug!(
                    root = %self.driver.root(),
                    folder = %folder,
                    error = %e,
                    "Skipping layout marker"
                );
            }
        }
    }

    /// Key of the highest-step checkpoint, if any. Directory checkpoints end
    /// in `/`. A failed listing counts as "no checkpoint".
    pub async fn latest_checkpoint(&self) -> Option<String> {
        let keys = match self.driver.list_objects(CHECKPOINTS_DIR).await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(root = %self.driver.root(), error = %e, "Checkpoint listing failed");
                return None;
            }
        };
        let latest = latest_candidate(keys.iter().map(String::as_str))?;
        tracing::debug!(step = latest.step(), key = %latest.key(), "Latest checkpoint found");
        Some(latest.into_key())
    }

    /// Write a [`CheckpointRecord`] to `checkpoints/step-<step:06>.json` and
    /// return its key.
    pub async fn save_checkpoint(&self, step: u64, metadata: Map<String, Value>) -> Result<String> {
        let key = format!("{CHECKPOINTS_DIR}/step-{step:06}.json");
        let record = CheckpointRecord {
            framework: self.framework.clone(),
            step,
            saved_at: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
            metadata,
        };
        self.driver.upload_json(&key, &record).await?;
        tracing::info!(step, key = %key, "Checkpoint saved");
        Ok(key)
    }

    /// Record the effective run configuration at `config/run.json`.
    pub async fn persist_config(&self, payload: &Value) -> Result<()> {
        self.driver.upload_json(RUN_CONFIG_KEY, payload).await
    }

    /// Bring a checkpoint to local disk and return its path.
    ///
    /// A key ending in `/` is downloaded as a directory under
    /// `<local_root>/resume/`. Any other key is downloaded to a scratch
    /// file; if that file is a JSON record whose metadata carries
    /// `hf_checkpoint_dir`, the referenced directory is downloaded instead.
    pub async fn materialize_checkpoint(&self, key: &str) -> Result<PathBuf> {
        if key.ends_with('/') {
            return self.materialize_directory(key).await;
        }

        let extension = Path::new(key)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("ckpt");
        let local = self.scratch_file("resume-", extension);
        self.driver.download_file(key, &local).await?;

        if extension == "json" {
            let payload: Value = serde_json::from_slice(&tokio::fs::read(&local).await?)?;
            if let Some(dir) = payload["metadata"][HF_CHECKPOINT_DIR_KEY]
                .as_str()
                .filter(|d| !d.trim_matches('/').is_empty())
            {
                tracing::debug!(key = %key, directory = %dir, "Following checkpoint directory reference");
                return self.materialize_directory(dir).await;
            }
        }
        Ok(local)
    }

    pub async fn sync_directory(&self, directory: &Path, remote_prefix: &str) -> Result<usize> {
        self.driver.sync_directory(directory, remote_prefix).await
    }

    pub async fn upload_file(&self, source: &Path, remote_key: &str) -> Result<()> {
        self.driver.upload_file(remote_key, source).await
    }

    /// A fresh path under the run's scratch root. Nothing is created.
    pub fn scratch_file(&self, prefix: &str, extension: &str) -> PathBuf {
        self.local_root
            .join(format!("{prefix}{}.{extension}", uuid::Uuid::new_v4().simple()))
    }

    async fn materialize_directory(&self, remote: &str) -> Result<PathBuf> {
        let trimmed = remote.trim_matches('/');
        let name = trimmed.rsplit('/').next().unwrap_or(trimmed);
        let target = self.local_root.join("resume").join(name);
        let count = self.driver.download_prefix(trimmed, &target).await?;
        if count == 0 {
            return Err(StorageError::not_found(remote));
        }
        tracing::info!(key = %remote, files = count, path = %target.display(), "Checkpoint directory materialized");
        Ok(target)
    }
}
