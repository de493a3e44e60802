//! Kubeflow `PyTorchJob` manifests with Master/Worker replicas.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::env::{env_var, merge_env, scalar_string};
use super::resources::build_resource_requirements;
use super::{FRAMEWORK_LABEL, RUN_ID_LABEL};
use crate::error::ManifestError;
use crate::naming::sanitize_job_name;
use crate::unified::TrainingJobRequest;

pub const PYTORCH_JOB_API_VERSION: &str = "kubeflow.org/v1";
pub const PYTORCH_JOB_KIND: &str = "PyTorchJob";
pub const RESTART_POLICY: &str = "OnFailure";
pub const CONTAINER_NAME: &str = "trainer";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PyTorchJobSpec,
}

impl PyTorchJob {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn to_value(&self) -> Result<Value, ManifestError> {
        Ok(serde_json::to_value(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PyTorchJobSpec {
    /// `Master`, plus `Worker` for multi-node jobs.
    pub pytorch_replica_specs: BTreeMap<String, ReplicaSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    pub replicas: u32,
    pub restart_policy: String,
    pub template: PodTemplateSpec,
}

fn baseline_env(request: &TrainingJobRequest) -> Result<Vec<EnvVar>, ManifestError> {
    let mut env = vec![
        env_var("FRAMEWORK", request.framework.as_str()),
        env_var("MODEL_ID", &request.model_id),
        env_var("RUN_ID", &request.run_id),
        env_var("NUM_NODES", request.num_nodes.to_string()),
        env_var("GPUS_PER_NODE", request.gpus_per_node.to_string()),
        env_var("CHECKPOINT_BASE_URI", &request.checkpoint_base_uri),
        env_var("CHECKPOINT_PREFIX", request.checkpoint_prefix()),
        env_var("CHECKPOINTS_URI", request.checkpoints_uri()),
        env_var("LOGS_URI", request.logs_uri()),
        env_var("CONFIG_URI", request.config_uri()),
        env_var("DATASET_URI", &request.dataset_uri),
        env_var(
            "TRAINING_EXTRA_ARGS_JSON",
            serde_json::to_string(&request.extra_args)?,
        ),
    ];
    if let Some(path) = &request.config_path {
        env.push(env_var("CONFIG_PATH", path));
    }
    if request.resume_from_checkpoint {
        env.push(env_var("RESUME_FROM_CHECKPOINT", "1"));
    }
    let overrides = request
        .env
        .iter()
        .map(|(name, value)| env_var(name, scalar_string(value)))
        .collect();
    Ok(merge_env(env, overrides))
}

fn quote(value: &str) -> Result<String, ManifestError> {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .map_err(|e| ManifestError::invalid("extra_args", e.to_string()))
}

/// Render extra args as CLI flags: `true` is a bare flag, `false` is dropped,
/// lists repeat the flag, everything else is shell-quoted.
pub fn cli_from_extra_args(extra_args: &Map<String, Value>) -> Result<Vec<String>, ManifestError> {
    let mut cli = Vec::new();
    for (key, value) in extra_args {
        let flag = format!("--{}", key.replace('_', "-"));
        match value {
            Value::Bool(true) => cli.push(flag),
            Value::Bool(false) => {}
            Value::Array(items) => {
                for item in items {
                    cli.push(flag.clone());
                    cli.push(quote(&scalar_string(item))?);
                }
            }
            other => {
                cli.push(flag);
                cli.push(quote(&scalar_string(other))?);
            }
        }
    }
    Ok(cli)
}

/// The shell line executed by the container. Placeholders expand from the
/// baseline env and the variables the PyTorchJob operator injects.
pub fn torchrun_launch(request: &TrainingJobRequest) -> Result<String, ManifestError> {
    let mut cli: Vec<String> = [
        "torchrun",
        "--nproc_per_node=$GPUS_PER_NODE",
        "--nnodes=$NUM_NODES",
        "--node_rank=$RANK",
        "--master_addr=$MASTER_ADDR",
        "--master_port=$MASTER_PORT",
        "train.py",
        "--framework ${FRAMEWORK}",
        "--run-id ${RUN_ID}",
        "--checkpoint-base-uri ${CHECKPOINT_BASE_URI}",
        "--checkpoint-prefix ${CHECKPOINT_PREFIX}",
        "--dataset-uri ${DATASET_URI}",
        "--logs-uri ${LOGS_URI}",
        "--config-uri ${CONFIG_URI}",
        "--model-id ${MODEL_ID}",
    ]
    .into_iter()
    .map(String::from)
    .collect();
    if request.config_path.is_some() {
        cli.push("--config".into());
        cli.push("${CONFIG_PATH}".into());
    }
    if request.resume_from_checkpoint {
        cli.push("--resume".into());
    }
    cli.extend(cli_from_extra_args(&request.extra_args)?);
    Ok(cli.join(" "))
}

fn replica_spec(request: &TrainingJobRequest, replicas: u32) -> Result<ReplicaSpec, ManifestError> {
    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(request.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/bash".to_string(), "-lc".to_string()]),
        args: Some(vec![torchrun_launch(request)?]),
        env: Some(baseline_env(request)?),
        resources: Some(build_resource_requirements(
            request.cpus_per_node,
            request.memory_per_node_gb,
            request.gpus_per_node,
        )),
        ..Default::default()
    };
    Ok(ReplicaSpec {
        replicas,
        restart_policy: RESTART_POLICY.to_string(),
        template: PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                restart_policy: Some(RESTART_POLICY.to_string()),
                containers: vec![container],
                ..Default::default()
            }),
        },
    })
}

/// Render a `PyTorchJob` for `request`.
pub fn build_pytorch_job(request: &TrainingJobRequest) -> Result<PyTorchJob, ManifestError> {
    request.validate()?;

    let name = request
        .job_name
        .clone()
        .unwrap_or_else(|| sanitize_job_name(&format!("{}-{}", request.framework, request.run_id)));

    let mut labels = request.labels.clone();
    labels
        .entry(FRAMEWORK_LABEL.to_string())
        .or_insert_with(|| request.framework.to_string());
    labels
        .entry(RUN_ID_LABEL.to_string())
        .or_insert_with(|| request.run_id.clone());

    let mut replicas = BTreeMap::from([("Master".to_string(), replica_spec(request, 1)?)]);
    if request.num_nodes > 1 {
        replicas.insert(
            "Worker".to_string(),
            replica_spec(request, request.num_nodes - 1)?,
        );
    }

    Ok(PyTorchJob {
        api_version: PYTORCH_JOB_API_VERSION.to_string(),
        kind: PYTORCH_JOB_KIND.to_string(),
        metadata: ObjectMeta {
            name: Some(name),
            namespace: request.namespace.clone(),
            labels: Some(labels),
            annotations: (!request.annotations.is_empty()).then(|| request.annotations.clone()),
            ..Default::default()
        },
        spec: PyTorchJobSpec {
            pytorch_replica_specs: replicas,
        },
    })
}
