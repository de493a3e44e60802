//! # Trainer Core
//!
//! Control plane for fine-tuning jobs on Kubernetes.
//! Validates training requests, renders Kubeflow `TrainJob` and `PyTorchJob`
//! manifests, submits them through a [`JobRunner`], and posts lifecycle
//! webhooks while a job is in flight.

pub mod backends;
pub mod callbacks;
pub mod config;
pub mod error;
pub mod manifest;
pub mod naming;
pub mod runner;
pub mod schemas;
pub mod unified;

// Re-export commonly used types at the crate root.
pub use backends::{
    BackendOptions, BackendSettings, HfUnslothBackend, MetaBackend, NemoBackend,
    PyTorchJobBackend, TrainerBackend, TrainingJobStatus, backend_by_name, schedule_training,
};
pub use callbacks::{CallbackDispatcher, HttpWebhookSender, WebhookPayload, WebhookSender};
pub use config::{TrainerConfig, detect_namespace, load_config};
pub use error::{CallbackError, ConfigError, ManifestError, Result, RunnerError, TrainerError};
pub use manifest::{PyTorchJob, TrainJob, build_pytorch_job, build_train_job};
pub use naming::{sanitize_job_name, sanitize_k8s_name};
pub use runner::{
    CallbackConfig, InMemoryJobRunner, JobRunner, JobSpec, JobState, JobStatus,
    KubeflowTrainJobRunner, StatusPoller, build_job_runner,
};
pub use schemas::{CallbackSpec, TrainingRequest, TrainingResponse};
pub use unified::{Framework, TrainingJobRequest, parse_framework_cli};
