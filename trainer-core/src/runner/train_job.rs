//! Job runner backed by Kubeflow `TrainJob` custom resources.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use super::{CustomObjectApi, JobRunner, JobSpec, JobState, JobStatus, StatusPoller};
use crate::callbacks::CallbackDispatcher;
use crate::error::RunnerError;
use crate::naming::sanitize_job_name;

struct TrainJobs {
    api: Arc<dyn CustomObjectApi>,
    namespace: String,
    /// job id -> resource name for jobs submitted by this process.
    names: RwLock<HashMap<String, String>>,
}

impl TrainJobs {
    async fn resource_name(&self, job_id: &str) -> String {
        match self.names.read().await.get(job_id) {
            Some(name) => name.clone(),
            None => sanitize_job_name(job_id),
        }
    }

    async fn fetch(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        let name = self.resource_name(job_id).await;
        let object = self
            .api
            .get(&self.namespace, &name)
            .await
            .map_err(|e| not_found_as_job(e, job_id))?;
        Ok(status_from_train_job(&object, job_id))
    }
}

#[async_trait]
impl StatusPoller for TrainJobs {
    async fn poll(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        self.fetch(job_id).await
    }
}

fn not_found_as_job(err: RunnerError, job_id: &str) -> RunnerError {
    match err {
        RunnerError::NotFound { .. } => RunnerError::not_found(job_id),
        other => other,
    }
}

pub struct KubeflowTrainJobRunner {
    jobs: Arc<TrainJobs>,
    dispatcher: CallbackDispatcher,
}

impl KubeflowTrainJobRunner {
    pub fn new(
        api: Arc<dyn CustomObjectApi>,
        namespace: impl Into<String>,
        dispatcher: CallbackDispatcher,
    ) -> Self {
        Self {
            jobs: Arc::new(TrainJobs {
                api,
                namespace: namespace.into(),
                names: RwLock::new(HashMap::new()),
            }),
            dispatcher,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.jobs.namespace
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }
}

#[async_trait]
impl JobRunner for KubeflowTrainJobRunner {
    fn name(&self) -> &str {
        "kubeflow-trainjob"
    }

    async fn submit(&self, spec: JobSpec) -> Result<JobStatus, RunnerError> {
        let mut manifest = spec
            .train_job
            .clone()
            .filter(|m| m.is_object())
            .ok_or_else(|| RunnerError::validation("Kubeflow runner requires a train_job manifest"))?;

        let name = match manifest["metadata"]["name"].as_str() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let name = sanitize_job_name(&spec.job_id);
                manifest["metadata"]["name"] = json!(name);
                name
            }
        };

        self.jobs.api.create(&self.jobs.namespace, &manifest).await?;
        self.jobs
            .names
            .write()
            .await
            .insert(spec.job_id.clone(), name.clone());
        tracing::info!(
            job_id = %spec.job_id,
            name = %name,
            namespace = %self.jobs.namespace,
            "TrainJob created"
        );

        let status = JobStatus::new(&spec.job_id, name, JobState::Submitted, "TrainJob created")
            .with_metadata("train_job", manifest);
        if let Some(config) = spec.callback_config() {
            self.dispatcher.register(config, self.jobs.clone()).await;
            self.dispatcher.notify(&status).await;
        }
        Ok(status)
    }

    async fn get(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        self.jobs.fetch(job_id).await
    }

    async fn cancel(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        let current = self.jobs.fetch(job_id).await?;
        if current.state.is_terminal() {
            let status = JobStatus {
                detail: Some(format!("Job already {}", current.state)),
                ..current
            };
            self.dispatcher.finish(&status).await;
            self.dispatcher.stop(job_id).await;
            return Ok(status);
        }

        let name = current.backend_job_id.clone();
        self.jobs
            .api
            .delete(&self.jobs.namespace, &name)
            .await
            .map_err(|e| not_found_as_job(e, job_id))?;
        self.jobs.names.write().await.remove(job_id);
        tracing::info!(job_id = %job_id, name = %name, "TrainJob deletion requested");

        let status = JobStatus::new(
            job_id,
            name,
            JobState::Cancelled,
            "TrainJob deletion requested",
        );
        self.dispatcher.finish(&status).await;
        self.dispatcher.stop(job_id).await;
        Ok(status)
    }
}

pub(crate) fn true_condition<'a>(conditions: &'a [Value], kind: &str) -> Option<&'a Value> {
    conditions
        .iter()
        .find(|c| c["type"].as_str() == Some(kind) && c["status"].as_str() == Some("True"))
}

pub(crate) fn condition_message(condition: &Value, fallback: &str) -> String {
    condition["message"]
        .as_str()
        .filter(|m| !m.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Derive a [`JobStatus`] from a `TrainJob` object.
///
/// Priority: deletion timestamp, `Failed`, `Complete`/`Succeeded`,
/// `Suspended`, any active child job, else submitted.
pub fn status_from_train_job(object: &Value, job_id: &str) -> JobStatus {
    let metadata = &object["metadata"];
    let backend_job_id = metadata["name"]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| sanitize_job_name(job_id));
    let conditions = object["status"]["conditions"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let (state, detail) = if metadata["deletionTimestamp"].is_string() {
        (JobState::Cancelled, "TrainJob is terminating".to_string())
    } else if let Some(c) = true_condition(conditions, "Failed") {
        (JobState::Failed, condition_message(c, "TrainJob failed"))
    } else if let Some(c) = true_condition(conditions, "Complete")
        .or_else(|| true_condition(conditions, "Succeeded"))
    {
        (JobState::Succeeded, condition_message(c, "TrainJob completed"))
    } else if let Some(c) = true_condition(conditions, "Suspended") {
        (JobState::Cancelled, condition_message(c, "TrainJob is suspended"))
    } else if object["status"]["jobsStatus"]
        .as_array()
        .is_some_and(|jobs| jobs.iter().any(|j| j["active"].as_i64().unwrap_or(0) > 0))
    {
        (JobState::Running, "TrainJob is running".to_string())
    } else {
        (JobState::Submitted, "TrainJob submitted".to_string())
    };

    let submitted_at = metadata["creationTimestamp"]
        .as_str()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    JobStatus {
        job_id: job_id.to_string(),
        backend_job_id,
        state,
        submitted_at,
        detail: Some(detail),
        metadata: serde_json::Map::from_iter([("train_job".to_string(), object.clone())]),
    }
}
