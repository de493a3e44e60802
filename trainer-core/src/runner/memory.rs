//! In-process job runner.
//!
//! Jobs live in a lock-guarded table. The first callback tick moves a job from
//! `submitted` to `running`; after that it only leaves `running` through
//! [`JobRunner::cancel`] or [`InMemoryJobRunner::record_outcome`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{JobRunner, JobSpec, JobState, JobStatus, StatusPoller};
use crate::callbacks::CallbackDispatcher;
use crate::error::RunnerError;

#[derive(Default)]
struct JobTable {
    jobs: RwLock<HashMap<String, JobStatus>>,
}

#[async_trait]
impl StatusPoller for JobTable {
    async fn poll(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        let mut jobs = self.jobs.write().await;
        let status = jobs
            .get_mut(job_id)
            .ok_or_else(|| RunnerError::not_found(job_id))?;
        if status.state == JobState::Submitted {
            status.state = JobState::Running;
            status.detail = Some("Job is running".to_string());
            tracing::debug!(job_id = %job_id, "Job advanced to running");
        }
        Ok(status.clone())
    }
}

pub struct InMemoryJobRunner {
    table: Arc<JobTable>,
    dispatcher: CallbackDispatcher,
}

impl InMemoryJobRunner {
    pub fn new(dispatcher: CallbackDispatcher) -> Self {
        Self {
            table: Arc::new(JobTable::default()),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> &CallbackDispatcher {
        &self.dispatcher
    }

    /// Record a result reported from outside the runner, e.g. by the training
    /// process itself. Terminal jobs are left untouched.
    pub async fn record_outcome(
        &self,
        job_id: &str,
        state: JobState,
        detail: impl Into<String>,
    ) -> Result<JobStatus, RunnerError> {
        let status = {
            let mut jobs = self.table.jobs.write().await;
            let status = jobs
                .get_mut(job_id)
                .ok_or_else(|| RunnerError::not_found(job_id))?;
            if status.state.is_terminal() {
                return Err(RunnerError::validation(format!(
                    "Job {job_id} is already {}",
                    status.state
                )));
            }
            status.state = state;
            status.detail = Some(detail.into());
            status.clone()
        };
        if state.is_terminal() {
            self.dispatcher.finish(&status).await;
        } else {
            self.dispatcher.notify(&status).await;
        }
        Ok(status)
    }
}

#[async_trait]
impl JobRunner for InMemoryJobRunner {
    fn name(&self) -> &str {
        "memory"
    }

    async fn submit(&self, spec: JobSpec) -> Result<JobStatus, RunnerError> {
        if spec.job_id.trim().is_empty() {
            return Err(RunnerError::validation("job_id must not be empty"));
        }
        let backend_job_id = spec
            .backend_job_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let callback = spec.callback_config();
        let status = JobStatus::new(
            &spec.job_id,
            backend_job_id,
            JobState::Submitted,
            "Job accepted for processing",
        )
        .with_metadata("job_spec", serde_json::to_value(&spec)?);

        {
            let mut jobs = self.table.jobs.write().await;
            if jobs.contains_key(&spec.job_id) {
                return Err(RunnerError::Conflict {
                    kind: "Job".into(),
                    name: spec.job_id.clone(),
                });
            }
            jobs.insert(spec.job_id.clone(), status.clone());
        }
        tracing::info!(job_id = %status.job_id, backend = %spec.backend, "Job submitted");

        if let Some(config) = callback {
            self.dispatcher.register(config, self.table.clone()).await;
        }
        Ok(status)
    }

    async fn get(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        self.table
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| RunnerError::not_found(job_id))
    }

    async fn cancel(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
        let status = {
            let mut jobs = self.table.jobs.write().await;
            let status = jobs
                .get_mut(job_id)
                .ok_or_else(|| RunnerError::not_found(job_id))?;
            if status.state.is_terminal() {
                status.detail = Some(format!("Job already {}", status.state));
            } else {
                status.state = JobState::Cancelled;
                status.detail = Some("Job cancellation requested".to_string());
            }
            status.clone()
        };
        tracing::info!(job_id = %job_id, state = %status.state, "Job cancel handled");
        self.dispatcher.finish(&status).await;
        self.dispatcher.stop(job_id).await;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::testing::RecordingSender;
    use crate::schemas::CallbackSpec;
    use std::time::Duration;

    fn runner(interval: Duration) -> (InMemoryJobRunner, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), interval);
        (InMemoryJobRunner::new(dispatcher), sender)
    }

    #[tokio::test]
    async fn test_submit_and_get() {
        let (runner, _) = runner(Duration::from_secs(60));
        let mut spec = JobSpec::new("job-1", "nemo");
        spec.backend_job_id = Some("nemo-job-1".into());
        let status = runner.submit(spec).await.unwrap();
        assert_eq!(status.state, JobState::Submitted);
        assert_eq!(status.backend_job_id, "nemo-job-1");
        assert_eq!(status.detail.as_deref(), Some("Job accepted for processing"));
        assert_eq!(status.metadata["job_spec"]["backend"], "nemo");

        let fetched = runner.get("job-1").await.unwrap();
        assert_eq!(fetched, status);
    }

    #[tokio::test]
    async fn test_backend_job_id_generated() {
        let (runner, _) = runner(Duration::from_secs(60));
        let status = runner.submit(JobSpec::new("job-1", "meta")).await.unwrap();
        assert!(uuid::Uuid::parse_str(&status.backend_job_id).is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_submit_conflicts() {
        let (runner, _) = runner(Duration::from_secs(60));
        runner.submit(JobSpec::new("job-1", "nemo")).await.unwrap();
        let err = runner.submit(JobSpec::new("job-1", "nemo")).await.unwrap_err();
        assert!(matches!(err, RunnerError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_unknown_job_not_found() {
        let (runner, _) = runner(Duration::from_secs(60));
        assert!(matches!(
            runner.get("nope").await.unwrap_err(),
            RunnerError::NotFound { .. }
        ));
        assert!(matches!(
            runner.cancel("nope").await.unwrap_err(),
            RunnerError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn test_without_webhook_job_stays_submitted() {
        let (runner, sender) = runner(Duration::from_millis(5));
        runner.submit(JobSpec::new("job-1", "nemo")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runner.get("job-1").await.unwrap().state, JobState::Submitted);
        assert!(sender.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_first_tick_advances_to_running() {
        let (runner, sender) = runner(Duration::from_secs(60));
        let mut spec = JobSpec::new("job-1", "nemo");
        spec.callbacks = Some(CallbackSpec::webhook("https://hooks.example/cb"));
        runner.submit(spec).await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let status = runner.get("job-1").await.unwrap();
        assert_eq!(status.state, JobState::Running);
        assert_eq!(status.detail.as_deref(), Some("Job is running"));
        assert_eq!(sender.payloads()[0].status, JobState::Running);
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_keeps_state() {
        let (runner, _) = runner(Duration::from_secs(60));
        runner.submit(JobSpec::new("job-1", "nemo")).await.unwrap();
        runner
            .record_outcome("job-1", JobState::Succeeded, "done")
            .await
            .unwrap();

        let status = runner.cancel("job-1").await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.detail.as_deref(), Some("Job already succeeded"));

        let again = runner.cancel("job-1").await.unwrap();
        assert_eq!(again.state, JobState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let (runner, _) = runner(Duration::from_secs(60));
        runner.submit(JobSpec::new("job-1", "nemo")).await.unwrap();
        let first = runner.cancel("job-1").await.unwrap();
        assert_eq!(first.state, JobState::Cancelled);
        assert_eq!(first.detail.as_deref(), Some("Job cancellation requested"));

        let second = runner.cancel("job-1").await.unwrap();
        assert_eq!(second.state, JobState::Cancelled);
        assert_eq!(second.detail.as_deref(), Some("Job already cancelled"));
    }

    #[tokio::test]
    async fn test_record_outcome_refuses_terminal_jobs() {
        let (runner, _) = runner(Duration::from_secs(60));
        runner.submit(JobSpec::new("job-1", "nemo")).await.unwrap();
        runner.cancel("job-1").await.unwrap();
        let err = runner
            .record_outcome("job-1", JobState::Running, "restarted")
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Validation { .. }));
        assert_eq!(runner.get("job-1").await.unwrap().state, JobState::Cancelled);
    }
}
