//! Submission and status of replicated `PyTorchJob` workloads.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RunnerError, TrainerError};
use crate::manifest::pytorch_job::PYTORCH_JOB_KIND;
use crate::manifest::{FRAMEWORK_LABEL, RUN_ID_LABEL, build_pytorch_job};
use crate::runner::train_job::{condition_message, true_condition};
use crate::runner::{CustomObjectApi, JobState, KubeCustomObjects};
use crate::unified::{Framework, TrainingJobRequest};

pub const PYTORCH_JOB_GROUP: &str = "kubeflow.org";
pub const PYTORCH_JOB_VERSION: &str = "v1";
pub const PYTORCH_JOB_PLURAL: &str = "pytorchjobs";

/// Status of a `PyTorchJob`, keyed by workload name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingJobStatus {
    pub name: String,
    pub status: JobState,
    pub detail: Option<String>,
    pub framework: Framework,
    pub run_id: String,
}

/// Submits [`TrainingJobRequest`]s as `PyTorchJob`s.
pub struct PyTorchJobBackend {
    api: Arc<dyn CustomObjectApi>,
    namespace: String,
}

impl PyTorchJobBackend {
    pub fn new(api: Arc<dyn CustomObjectApi>, namespace: impl Into<String>) -> Self {
        Self {
            api,
            namespace: namespace.into(),
        }
    }

    pub fn from_client(client: kube::Client, namespace: impl Into<String>) -> Self {
        let api = KubeCustomObjects::for_kind(
            client,
            PYTORCH_JOB_GROUP,
            PYTORCH_JOB_VERSION,
            PYTORCH_JOB_KIND,
            PYTORCH_JOB_PLURAL,
        );
        Self::new(Arc::new(api), namespace)
    }

    /// Connect with the ambient kubeconfig or in-cluster credentials.
    pub async fn connect(namespace: impl Into<String>) -> Result<Self, TrainerError> {
        let client = kube::Client::try_default().await.map_err(RunnerError::from)?;
        Ok(Self::from_client(client, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Render and create the workload. The request's namespace wins over
    /// the backend's.
    pub async fn submit(&self, request: &TrainingJobRequest) -> Result<TrainingJobStatus, TrainerError> {
        let job = build_pytorch_job(request)?;
        let namespace = request.namespace.as_deref().unwrap_or(&self.namespace);
        let name = job.name().to_string();

        self.api.create(namespace, &job.to_value()?).await?;
        tracing::info!(
            name = %name,
            namespace = %namespace,
            framework = %request.framework,
            run_id = %request.run_id,
            "PyTorchJob created"
        );

        Ok(TrainingJobStatus {
            name,
            status: JobState::Submitted,
            detail: Some("PyTorchJob created".to_string()),
            framework: request.framework,
            run_id: request.run_id.clone(),
        })
    }

    pub async fn status(&self, name: &str, namespace: Option<&str>) -> Result<TrainingJobStatus, RunnerError> {
        let object = self
            .api
            .get(namespace.unwrap_or(&self.namespace), name)
            .await?;
        Ok(status_from_pytorch_job(&object))
    }

    pub async fn delete(&self, name: &str, namespace: Option<&str>) -> Result<(), RunnerError> {
        let namespace = namespace.unwrap_or(&self.namespace);
        self.api.delete(namespace, name).await?;
        tracing::info!(name = %name, namespace = %namespace, "PyTorchJob deletion requested");
        Ok(())
    }
}

/// Derive status from a `PyTorchJob` object.
///
/// Priority: `Failed`, `Succeeded`, `Running`, `Created`, active replicas,
/// else submitted.
pub fn status_from_pytorch_job(object: &Value) -> TrainingJobStatus {
    let metadata = &object["metadata"];
    let name = metadata["name"].as_str().unwrap_or_default().to_string();
    let labels = &metadata["labels"];
    let run_id = labels[RUN_ID_LABEL]
        .as_str()
        .map(String::from)
        .unwrap_or_else(|| name.clone());
    let framework = labels[FRAMEWORK_LABEL]
        .as_str()
        .and_then(|f| f.parse().ok())
        .unwrap_or(Framework::Hf);

    let status = &object["status"];
    let conditions = status["conditions"]
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let (state, detail) = if let Some(c) = true_condition(conditions, "Failed") {
        (JobState::Failed, condition_message(c, "PyTorchJob failed"))
    } else if let Some(c) = true_condition(conditions, "Succeeded") {
        (JobState::Succeeded, condition_message(c, "PyTorchJob completed"))
    } else if let Some(c) = true_condition(conditions, "Running") {
        (JobState::Running, condition_message(c, "PyTorchJob running"))
    } else if let Some(c) = true_condition(conditions, "Created") {
        (JobState::Submitted, condition_message(c, "PyTorchJob created"))
    } else if status["active"].as_i64().unwrap_or(0) > 0 {
        (JobState::Running, "PyTorchJob pods active".to_string())
    } else {
        (JobState::Submitted, "PyTorchJob submitted".to_string())
    };

    TrainingJobStatus {
        name,
        status: state,
        detail: Some(detail),
        framework,
        run_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::custom_objects::testing::FakeCustomObjects;
    use serde_json::json;

    fn request() -> TrainingJobRequest {
        TrainingJobRequest::new(
            Framework::Nemo,
            "nvidia/nemotron-4-15b",
            "run-7",
            "s3://bucket/ckpt",
            "s3://bucket/data.jsonl",
        )
    }

    fn backend() -> (Arc<FakeCustomObjects>, PyTorchJobBackend) {
        let fake = Arc::new(FakeCustomObjects::new(PYTORCH_JOB_KIND));
        let backend = PyTorchJobBackend::new(fake.clone(), "ml");
        (fake, backend)
    }

    #[tokio::test]
    async fn test_submit_creates_in_backend_namespace() {
        let (fake, backend) = backend();
        let status = backend.submit(&request()).await.unwrap();
        assert_eq!(status.name, "nemo-run-7");
        assert_eq!(status.status, JobState::Submitted);
        assert_eq!(status.detail.as_deref(), Some("PyTorchJob created"));
        assert!(
            fake.objects
                .lock()
                .unwrap()
                .contains_key(&("ml".to_string(), "nemo-run-7".to_string()))
        );
    }

    #[tokio::test]
    async fn test_request_namespace_wins() {
        let (fake, backend) = backend();
        let mut req = request();
        req.namespace = Some("team-a".into());
        backend.submit(&req).await.unwrap();
        assert!(
            fake.objects
                .lock()
                .unwrap()
                .contains_key(&("team-a".to_string(), "nemo-run-7".to_string()))
        );
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts() {
        let (_fake, backend) = backend();
        backend.submit(&request()).await.unwrap();
        let err = backend.submit(&request()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(err.to_string().contains("PyTorchJob nemo-run-7 already exists"));
    }

    #[tokio::test]
    async fn test_status_reads_back_labels() {
        let (fake, backend) = backend();
        backend.submit(&request()).await.unwrap();
        fake.set_status(
            "ml",
            "nemo-run-7",
            json!({"conditions": [{"type": "Running", "status": "True"}]}),
        );
        let status = backend.status("nemo-run-7", None).await.unwrap();
        assert_eq!(status.status, JobState::Running);
        assert_eq!(status.framework, Framework::Nemo);
        assert_eq!(status.run_id, "run-7");
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let (_fake, backend) = backend();
        let err = backend.delete("ghost", None).await.unwrap_err();
        assert!(matches!(err, RunnerError::NotFound { .. }));
    }

    #[test]
    fn test_resource_matches_manifest_api_version() {
        use crate::manifest::pytorch_job::PYTORCH_JOB_API_VERSION;
        use crate::runner::custom_objects::api_resource;
        let resource = api_resource(
            PYTORCH_JOB_GROUP,
            PYTORCH_JOB_VERSION,
            PYTORCH_JOB_KIND,
            PYTORCH_JOB_PLURAL,
        );
        assert_eq!(resource.api_version, PYTORCH_JOB_API_VERSION);
    }

    #[test]
    fn test_status_priority() {
        let object = json!({
            "metadata": {"name": "x"},
            "status": {"conditions": [
                {"type": "Running", "status": "True"},
                {"type": "Failed", "status": "True", "message": "OOM"}
            ]}
        });
        let status = status_from_pytorch_job(&object);
        assert_eq!(status.status, JobState::Failed);
        assert_eq!(status.detail.as_deref(), Some("OOM"));
        assert_eq!(status.run_id, "x");
        assert_eq!(status.framework, Framework::Hf);

        let succeeded = json!({
            "metadata": {"name": "x"},
            "status": {"conditions": [
                {"type": "Running", "status": "False"},
                {"type": "Succeeded", "status": "True"}
            ]}
        });
        let status = status_from_pytorch_job(&succeeded);
        assert_eq!(status.status, JobState::Succeeded);
        assert_eq!(status.detail.as_deref(), Some("PyTorchJob completed"));
    }

    #[test]
    fn test_status_from_active_count() {
        let active = json!({"metadata": {"name": "x"}, "status": {"active": 2}});
        assert_eq!(status_from_pytorch_job(&active).status, JobState::Running);

        let bare = json!({"metadata": {"name": "x"}});
        let status = status_from_pytorch_job(&bare);
        assert_eq!(status.status, JobState::Submitted);
        assert_eq!(status.detail.as_deref(), Some("PyTorchJob submitted"));
    }
}
