//! Job lifecycle tracking.
//!
//! A [`JobRunner`] owns the status of every job it accepted. Two
//! implementations exist: [`InMemoryJobRunner`] for development and tests,
//! and [`KubeflowTrainJobRunner`] backed by `TrainJob` custom resources. The
//! variant is picked once at start-up by [`build_job_runner`].

pub mod custom_objects;
pub mod memory;
pub mod train_job;

pub use custom_objects::{CustomObjectApi, KubeCustomObjects};
pub use memory::InMemoryJobRunner;
pub use train_job::{KubeflowTrainJobRunner, status_from_train_job};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::callbacks::{CallbackDispatcher, HttpWebhookSender};
use crate::config::{RunnerBackend, TrainerConfig, detect_namespace};
use crate::error::{RunnerError, TrainerError};
use crate::schemas::CallbackSpec;

/// Lifecycle state of a training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Submitted,
    Running,
    Failed,
    Succeeded,
    Cancelled,
}

impl JobState {
    /// Terminal states are never left.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Failed | JobState::Succeeded | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Failed => "failed",
            JobState::Succeeded => "succeeded",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed status of a job. Only the owning runner mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub job_id: String,
    /// Resource name in the execution backend.
    pub backend_job_id: String,
    pub state: JobState,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl JobStatus {
    pub fn new(
        job_id: impl Into<String>,
        backend_job_id: impl Into<String>,
        state: JobState,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            backend_job_id: backend_job_id.into(),
            state,
            submitted_at: Utc::now(),
            detail: Some(detail.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// What a backend hands to a runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub backend: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_job_id: Option<String>,
    /// Rendered `TrainJob`, required by the cluster-backed runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub train_job: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callbacks: Option<CallbackSpec>,
    /// Backend-specific fields carried as-is.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl JobSpec {
    pub fn new(job_id: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            backend: backend.into(),
            backend_job_id: None,
            train_job: None,
            callbacks: None,
            payload: Map::new(),
        }
    }

    /// Webhook registration for this job, if a non-empty URL was supplied.
    pub fn callback_config(&self) -> Option<CallbackConfig> {
        let callbacks = self.callbacks.as_ref()?;
        let url = callbacks
            .webhook_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())?;
        Some(CallbackConfig {
            webhook_url: url.to_string(),
            auth_header: callbacks.auth_header.clone(),
            job_id: self.job_id.clone(),
        })
    }
}

/// Where status updates for one job are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    pub webhook_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_header: Option<String>,
    pub job_id: String,
}

/// Submit, inspect and cancel training jobs.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runner name for logs.
    fn name(&self) -> &str;

    async fn submit(&self, spec: JobSpec) -> Result<JobStatus, RunnerError>;

    /// Current status; `NotFound` for unknown jobs.
    async fn get(&self, job_id: &str) -> Result<JobStatus, RunnerError>;

    /// Idempotent. A terminal job keeps its state and gets an
    /// "already <state>" detail. Any callback loop is stopped either way.
    async fn cancel(&self, job_id: &str) -> Result<JobStatus, RunnerError>;
}

/// Refreshes a job's status on behalf of the callback dispatcher.
#[async_trait]
pub trait StatusPoller: Send + Sync {
    async fn poll(&self, job_id: &str) -> Result<JobStatus, RunnerError>;
}

/// Build the runner selected by `config.runner.backend`.
pub async fn build_job_runner(config: &TrainerConfig) -> Result<Arc<dyn JobRunner>, TrainerError> {
    let sender = HttpWebhookSender::new(config.callbacks.timeout())?;
    let dispatcher = CallbackDispatcher::new(Arc::new(sender), config.callbacks.interval());

    match config.runner.backend {
        RunnerBackend::Memory => {
            tracing::info!("Using in-memory job runner");
            Ok(Arc::new(InMemoryJobRunner::new(dispatcher)))
        }
        RunnerBackend::Kubernetes => {
            let namespace = detect_namespace(&config.runner);
            let client = kube::Client::try_default().await.map_err(RunnerError::from)?;
            let (group, version) = config.runner.group_version()?;
            let api = KubeCustomObjects::for_kind(
                client,
                group,
                version,
                crate::manifest::train_job::TRAIN_JOB_KIND,
                &config.runner.train_job_plural,
            );
            tracing::info!(
                namespace = %namespace,
                api_version = %config.runner.train_job_api_version,
                "Using Kubeflow TrainJob runner"
            );
            Ok(Arc::new(KubeflowTrainJobRunner::new(
                Arc::new(api),
                namespace,
                dispatcher,
            )))
        }
    }
}
