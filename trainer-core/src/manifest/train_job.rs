//! Kubeflow `TrainJob` manifests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::env::{CommandLine, EnvOverrides, merge_env, request_env};
use super::resources::build_resource_requirements;
use super::{BACKEND_LABEL, JOB_ID_LABEL, REQUEST_ANNOTATION};
use crate::error::ManifestError;
use crate::naming::sanitize_k8s_name;
use crate::schemas::TrainingRequest;

pub const TRAIN_JOB_KIND: &str = "TrainJob";
pub const DEFAULT_TRAIN_JOB_API_VERSION: &str = "trainer.kubeflow.org/v1alpha1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: TrainJobSpec,
}

impl TrainJob {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn to_value(&self) -> Result<Value, ManifestError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainJobSpec {
    pub runtime_ref: RuntimeRef,
    pub trainer: TrainerSpec,
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<Initializer>,
}

/// Which predefined execution template interprets the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeRef {
    pub name: String,
    pub kind: String,
    pub api_group: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainerSpec {
    pub image: String,
    pub resources_per_node: ResourceRequirements,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_proc_per_node: Option<NumProcPerNode>,
}

/// Processes per node: a count, or a runtime keyword such as `auto`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumProcPerNode {
    Count(u32),
    Named(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<StorageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<StorageRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRef {
    pub storage_uri: String,
}

/// Backend-specific inputs to [`build_train_job`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrainJobParams {
    pub backend: String,
    pub runtime_ref: RuntimeRef,
    pub image: String,
    pub command: Option<CommandLine>,
    pub args: Option<CommandLine>,
    pub env: Option<EnvOverrides>,
    pub num_nodes: u32,
    pub num_proc_per_node: Option<NumProcPerNode>,
    /// Replaces the quota computed from the request when set.
    pub resources_per_node: Option<ResourceRequirements>,
    pub dataset_uri: Option<String>,
    pub model_uri: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub api_version: String,
}

impl TrainJobParams {
    pub fn new(backend: impl Into<String>, runtime_ref: RuntimeRef, image: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            runtime_ref,
            image: image.into(),
            command: None,
            args: None,
            env: None,
            num_nodes: 1,
            num_proc_per_node: None,
            resources_per_node: None,
            dataset_uri: None,
            model_uri: None,
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            api_version: DEFAULT_TRAIN_JOB_API_VERSION.to_string(),
        }
    }
}

/// `ceil(gpus / nodes)`, or `None` without GPUs.
pub fn default_num_proc_per_node(gpus: u32, num_nodes: u32) -> Option<u32> {
    if gpus == 0 {
        return None;
    }
    Some(gpus.div_ceil(num_nodes.max(1)).max(1))
}

/// Render a `TrainJob` for `request`.
pub fn build_train_job(
    request: &TrainingRequest,
    params: TrainJobParams,
) -> Result<TrainJob, ManifestError> {
    let name = sanitize_k8s_name(&request.job_id, &format!("{}-job", params.backend));

    let mut labels = BTreeMap::from([
        (BACKEND_LABEL.to_string(), params.backend.clone()),
        (JOB_ID_LABEL.to_string(), request.job_id.clone()),
    ]);
    labels.extend(params.labels);

    let mut annotations = BTreeMap::from([
        (
            REQUEST_ANNOTATION.to_string(),
            serde_json::to_string(request)?,
        ),
        (JOB_ID_LABEL.to_string(), request.job_id.clone()),
    ]);
    annotations.extend(params.annotations);

    let num_nodes = params.num_nodes.max(1);
    let num_proc_per_node = params.num_proc_per_node.or_else(|| {
        default_num_proc_per_node(request.resources.gpus, num_nodes).map(NumProcPerNode::Count)
    });
    let resources_per_node = params.resources_per_node.unwrap_or_else(|| {
        build_resource_requirements(
            request.resources.cpus,
            request.resources.memory_gb,
            request.resources.gpus,
        )
    });

    let overrides = params.env.map(EnvOverrides::into_env).unwrap_or_default();
    let trainer = TrainerSpec {
        image: params.image,
        resources_per_node,
        command: params.command.as_ref().map(CommandLine::to_argv).transpose()?.flatten(),
        args: params.args.as_ref().map(CommandLine::to_argv).transpose()?.flatten(),
        env: merge_env(request_env(request, &params.backend)?, overrides),
        num_nodes: Some(num_nodes),
        num_proc_per_node,
    };

    let initializer = Initializer {
        dataset: params.dataset_uri.map(|storage_uri| StorageRef { storage_uri }),
        model: params.model_uri.map(|storage_uri| StorageRef { storage_uri }),
    };
    let initializer = (initializer != Initializer::default()).then_some(initializer);

    Ok(TrainJob {
        api_version: params.api_version,
        kind: TRAIN_JOB_KIND.to_string(),
        metadata: ObjectMeta {
            name: Some(name),
            labels: Some(labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: TrainJobSpec {
            runtime_ref: params.runtime_ref,
            trainer,
            labels,
            initializer,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::GPU_RESOURCE_KEY;
    use crate::manifest::env::env_var;
    use crate::schemas::fixtures::sample_request;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn runtime() -> RuntimeRef {
        RuntimeRef {
            name: "nemo-runtime".into(),
            kind: "ClusterTrainingRuntime".into(),
            api_group: "trainer.kubeflow.org".into(),
        }
    }

    fn params() -> TrainJobParams {
        TrainJobParams::new("nemo", runtime(), "nvcr.io/nvidia/nemo:24.03")
    }

    #[test]
    fn test_identity_labels_and_annotations() {
        let job = build_train_job(&sample_request("Job_7"), params()).unwrap();
        assert_eq!(job.name(), "job-7");
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[BACKEND_LABEL], "nemo");
        assert_eq!(labels[JOB_ID_LABEL], "Job_7");
        assert_eq!(&job.spec.labels, labels);

        let annotations = job.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations[JOB_ID_LABEL], "Job_7");
        let embedded: Value = serde_json::from_str(&annotations[REQUEST_ANNOTATION]).unwrap();
        assert_eq!(embedded["job_id"], "Job_7");
    }

    #[test]
    fn test_name_uses_backend_prefix() {
        let job = build_train_job(&sample_request("42"), params()).unwrap();
        assert_eq!(job.name(), "nemo-job-42");
    }

    #[test]
    fn test_caller_labels_merged_on_top() {
        let mut p = params();
        p.labels.insert("team".into(), "research".into());
        p.labels.insert(BACKEND_LABEL.into(), "custom".into());
        let job = build_train_job(&sample_request("job-1"), p).unwrap();
        let labels = job.metadata.labels.unwrap();
        assert_eq!(labels["team"], "research");
        assert_eq!(labels[BACKEND_LABEL], "custom");
    }

    #[test]
    fn test_num_proc_defaults_to_ceil() {
        assert_eq!(default_num_proc_per_node(5, 2), Some(3));
        assert_eq!(default_num_proc_per_node(4, 1), Some(4));
        assert_eq!(default_num_proc_per_node(0, 2), None);

        let mut p = params();
        p.num_nodes = 3;
        let job = build_train_job(&sample_request("job-1"), p).unwrap();
        assert_eq!(job.spec.trainer.num_nodes, Some(3));
        assert_eq!(
            job.spec.trainer.num_proc_per_node,
            Some(NumProcPerNode::Count(2))
        );
    }

    #[test]
    fn test_explicit_num_proc_kept() {
        let mut p = params();
        p.num_proc_per_node = Some(NumProcPerNode::Named("auto".into()));
        let job = build_train_job(&sample_request("job-1"), p).unwrap();
        let value = job.to_value().unwrap();
        assert_eq!(value["spec"]["trainer"]["numProcPerNode"], "auto");
    }

    #[test]
    fn test_computed_resources_and_override() {
        let job = build_train_job(&sample_request("job-1"), params()).unwrap();
        let limits = job.spec.trainer.resources_per_node.limits.unwrap();
        assert_eq!(limits[GPU_RESOURCE_KEY], Quantity("4".into()));

        let mut p = params();
        p.resources_per_node = Some(build_resource_requirements(2, 4, 0));
        let job = build_train_job(&sample_request("job-1"), p).unwrap();
        let limits = job.spec.trainer.resources_per_node.limits.unwrap();
        assert!(!limits.contains_key(GPU_RESOURCE_KEY));
    }

    #[test]
    fn test_env_overrides_replace_in_place() {
        let mut p = params();
        p.env = Some(serde_json::from_value(json!({"TRAINING_BACKEND": "x", "EXTRA": "1"})).unwrap());
        let job = build_train_job(&sample_request("job-1"), p).unwrap();
        let env = &job.spec.trainer.env;
        assert_eq!(env[1], env_var("TRAINING_BACKEND", "x"));
        assert_eq!(env.last().unwrap(), &env_var("EXTRA", "1"));
    }

    #[test]
    fn test_command_and_initializer() {
        let mut p = params();
        p.command = Some(CommandLine::from("python -m nemo.train"));
        p.dataset_uri = Some("s3://bucket/data.jsonl".into());
        p.model_uri = Some("s3://bucket/model".into());
        let value = build_train_job(&sample_request("job-1"), p)
            .unwrap()
            .to_value()
            .unwrap();
        assert_eq!(
            value["spec"]["trainer"]["command"],
            json!(["python", "-m", "nemo.train"])
        );
        assert!(value["spec"]["trainer"].get("args").is_none());
        assert_eq!(
            value["spec"]["initializer"]["dataset"]["storageUri"],
            "s3://bucket/data.jsonl"
        );
        assert_eq!(
            value["spec"]["initializer"]["model"]["storageUri"],
            "s3://bucket/model"
        );
        assert_eq!(value["spec"]["runtimeRef"]["apiGroup"], "trainer.kubeflow.org");
        assert_eq!(value["kind"], "TrainJob");
    }

    #[test]
    fn test_no_initializer_without_uris() {
        let job = build_train_job(&sample_request("job-1"), params()).unwrap();
        assert!(job.spec.initializer.is_none());
    }
}
