//! Manifest synthesis.
//!
//! Pure translation from a request into one of two workload dialects:
//! - [`train_job`]: Kubeflow `TrainJob`, a single flexible trainer block.
//! - [`pytorch_job`]: Kubeflow `PyTorchJob`, explicit Master/Worker replicas.
//!
//! Every manifest carries the backend (or framework) label and the
//! originating job id so provenance survives name truncation.

pub mod env;
pub mod pytorch_job;
pub mod resources;
pub mod train_job;

pub use env::{CommandLine, EnvOverrides, merge_env, request_env};
pub use pytorch_job::{PyTorchJob, build_pytorch_job};
pub use resources::{GPU_RESOURCE_KEY, build_resource_requirements};
pub use train_job::{
    NumProcPerNode, RuntimeRef, TrainJob, TrainJobParams, build_train_job, default_num_proc_per_node,
};

pub const BACKEND_LABEL: &str = "trainer.deepfinery/backend";
pub const JOB_ID_LABEL: &str = "trainer.deepfinery/job-id";
pub const REQUEST_ANNOTATION: &str = "trainer.deepfinery/request-json";
pub const FRAMEWORK_LABEL: &str = "trainer.deepfinery/framework";
pub const RUN_ID_LABEL: &str = "trainer.deepfinery/run-id";
