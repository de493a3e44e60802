//! Status webhook delivery.
//!
//! The [`CallbackDispatcher`] runs one background loop per job with a
//! webhook. Each tick polls the job through its runner, POSTs the status and
//! sleeps. The loop ends on a terminal state, a vanished job, or [`stop`].
//! Delivery failures are logged and retried on the next tick only.
//!
//! [`stop`]: CallbackDispatcher::stop

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{CallbackError, RunnerError};
use crate::runner::{CallbackConfig, JobState, JobStatus, StatusPoller};

/// JSON body POSTed to the webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub job_id: String,
    pub backend_job_id: String,
    pub status: JobState,
    pub detail: String,
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
}

impl WebhookPayload {
    pub fn from_status(status: &JobStatus) -> Self {
        Self {
            job_id: status.job_id.clone(),
            backend_job_id: status.backend_job_id.clone(),
            status: status.state,
            detail: status
                .detail
                .clone()
                .unwrap_or_else(|| format!("Job {}", status.state)),
            timestamp: Utc::now().timestamp_micros() as f64 / 1_000_000.0,
        }
    }
}

/// Outbound webhook transport.
#[async_trait]
pub trait WebhookSender: Send + Sync {
    async fn send(
        &self,
        config: &CallbackConfig,
        payload: &WebhookPayload,
    ) -> Result<(), CallbackError>;
}

/// [`WebhookSender`] over `reqwest` with a per-request timeout.
pub struct HttpWebhookSender {
    client: reqwest::Client,
}

impl HttpWebhookSender {
    pub fn new(timeout: Duration) -> Result<Self, CallbackError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookSender for HttpWebhookSender {
    async fn send(
        &self,
        config: &CallbackConfig,
        payload: &WebhookPayload,
    ) -> Result<(), CallbackError> {
        let mut request = self.client.post(&config.webhook_url).json(payload);
        if let Some(auth) = &config.auth_header {
            request = request.header(reqwest::header::AUTHORIZATION, auth);
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(CallbackError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }
}

struct Registration {
    id: u64,
    config: CallbackConfig,
    token: CancellationToken,
    /// Held across "still registered?" and the POST so nothing is delivered
    /// once a final status went out.
    gate: Arc<Mutex<()>>,
}

struct DispatcherInner {
    sender: Arc<dyn WebhookSender>,
    interval: Duration,
    registrations: Mutex<HashMap<String, Registration>>,
    next_id: AtomicU64,
}

impl DispatcherInner {
    async fn deliver(&self, config: &CallbackConfig, status: &JobStatus) {
        let payload = WebhookPayload::from_status(status);
        match self.sender.send(config, &payload).await {
            Ok(()) => {
                tracing::debug!(job_id = %status.job_id, status = %status.state, "Callback delivered");
            }
            Err(e) => {
                tracing::warn!(job_id = %status.job_id, error = %e, "Callback dispatch failed");
            }
        }
    }

    async fn remove_if_current(&self, job_id: &str, id: u64) {
        let mut registrations = self.registrations.lock().await;
        if registrations.get(job_id).is_some_and(|r| r.id == id) {
            registrations.remove(job_id);
        }
    }
}

/// Per-job polling loops keyed by job id.
#[derive(Clone)]
pub struct CallbackDispatcher {
    inner: Arc<DispatcherInner>,
}

impl CallbackDispatcher {
    pub fn new(sender: Arc<dyn WebhookSender>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                sender,
                interval,
                registrations: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn interval(&self) -> Duration {
        self.inner.interval
    }

    /// Start the loop for `config.job_id`, replacing any existing one.
    pub async fn register(&self, config: CallbackConfig, poller: Arc<dyn StatusPoller>) {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let job_id = config.job_id.clone();

        {
            let mut registrations = self.inner.registrations.lock().await;
            if let Some(previous) = registrations.insert(
                job_id.clone(),
                Registration {
                    id,
                    config: config.clone(),
                    token: token.clone(),
                    gate: gate.clone(),
                },
            ) {
                previous.token.cancel();
            }
        }

        tracing::debug!(job_id = %job_id, "Callback loop registered");
        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_loop(inner.clone(), config, poller, token, gate).await;
            inner.remove_if_current(&job_id, id).await;
            tracing::debug!(job_id = %job_id, "Callback loop finished");
        });
    }

    /// Send `status` now if the job has a live registration.
    pub async fn notify(&self, status: &JobStatus) {
        let Some((config, token, gate)) = self.snapshot(&status.job_id).await else {
            return;
        };
        let _guard = gate.lock().await;
        if !token.is_cancelled() {
            self.inner.deliver(&config, status).await;
        }
    }

    /// Send a final `status` and stop the loop. Nothing else is delivered for
    /// the job afterwards.
    pub async fn finish(&self, status: &JobStatus) {
        let Some((config, token, gate)) = self.snapshot(&status.job_id).await else {
            return;
        };
        {
            let _guard = gate.lock().await;
            token.cancel();
            self.inner.deliver(&config, status).await;
        }
        self.stop(&status.job_id).await;
    }

    /// Stop the loop for `job_id` and clear its registration.
    pub async fn stop(&self, job_id: &str) {
        let removed = self.inner.registrations.lock().await.remove(job_id);
        if let Some(registration) = removed {
            registration.token.cancel();
            tracing::debug!(job_id = %job_id, "Callback loop stopped");
        }
    }

    pub async fn is_registered(&self, job_id: &str) -> bool {
        self.inner.registrations.lock().await.contains_key(job_id)
    }

    /// Stop every loop.
    pub async fn shutdown(&self) {
        let drained: Vec<Registration> = self
            .inner
            .registrations
            .lock()
            .await
            .drain()
            .map(|(_, r)| r)
            .collect();
        for registration in drained {
            registration.token.cancel();
        }
    }

    async fn snapshot(
        &self,
        job_id: &str,
    ) -> Option<(CallbackConfig, CancellationToken, Arc<Mutex<()>>)> {
        let registrations = self.inner.registrations.lock().await;
        registrations
            .get(job_id)
            .map(|r| (r.config.clone(), r.token.clone(), r.gate.clone()))
    }
}

async fn run_loop(
    inner: Arc<DispatcherInner>,
    config: CallbackConfig,
    poller: Arc<dyn StatusPoller>,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
) {
    let job_id = config.job_id.as_str();
    while !token.is_cancelled() {
        match poller.poll(job_id).await {
            Ok(status) => {
                {
                    let _guard = gate.lock().await;
                    if token.is_cancelled() {
                        break;
                    }
                    inner.deliver(&config, &status).await;
                }
                if status.state.is_terminal() {
                    break;
                }
            }
            Err(RunnerError::NotFound { .. }) => {
                tracing::debug!(job_id = %job_id, "Job disappeared, ending callback loop");
                break;
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Status poll failed");
            }
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(inner.interval) => {}
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingSender;
    use super::*;
    use std::collections::VecDeque;

    /// Returns queued results, then repeats the last status.
    struct ScriptedPoller {
        script: std::sync::Mutex<VecDeque<Result<JobStatus, RunnerError>>>,
        last: std::sync::Mutex<Option<JobStatus>>,
    }

    impl ScriptedPoller {
        fn new(script: Vec<Result<JobStatus, RunnerError>>) -> Arc<Self> {
            Arc::new(Self {
                script: std::sync::Mutex::new(script.into()),
                last: std::sync::Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl StatusPoller for ScriptedPoller {
        async fn poll(&self, job_id: &str) -> Result<JobStatus, RunnerError> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(status)) => {
                    *self.last.lock().unwrap() = Some(status.clone());
                    Ok(status)
                }
                Some(Err(e)) => Err(e),
                None => self
                    .last
                    .lock()
                    .unwrap()
                    .clone()
                    .ok_or_else(|| RunnerError::not_found(job_id)),
            }
        }
    }

    struct FailingSender;

    #[async_trait]
    impl WebhookSender for FailingSender {
        async fn send(
            &self,
            _config: &CallbackConfig,
            _payload: &WebhookPayload,
        ) -> Result<(), CallbackError> {
            Err(CallbackError::Status { status: 503 })
        }
    }

    fn config(job_id: &str) -> CallbackConfig {
        CallbackConfig {
            webhook_url: "https://hooks.example/cb".into(),
            auth_header: None,
            job_id: job_id.into(),
        }
    }

    fn status(state: JobState) -> JobStatus {
        JobStatus::new("job-1", "backend-1", state, format!("Job is {state}"))
    }

    async fn wait_until_unregistered(dispatcher: &CallbackDispatcher, job_id: &str) {
        for _ in 0..200 {
            if !dispatcher.is_registered(job_id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("callback loop for {job_id} never finished");
    }

    #[test]
    fn test_payload_default_detail() {
        let mut s = status(JobState::Running);
        s.detail = None;
        let payload = WebhookPayload::from_status(&s);
        assert_eq!(payload.detail, "Job running");
        assert!(payload.timestamp > 1_600_000_000.0);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["status"], "running");
    }

    #[tokio::test]
    async fn test_loop_stops_on_terminal_state() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), Duration::from_millis(5));
        let poller = ScriptedPoller::new(vec![
            Ok(status(JobState::Running)),
            Ok(status(JobState::Succeeded)),
        ]);

        dispatcher.register(config("job-1"), poller).await;
        wait_until_unregistered(&dispatcher, "job-1").await;

        let states: Vec<JobState> = sender.payloads().iter().map(|p| p.status).collect();
        assert_eq!(states, vec![JobState::Running, JobState::Succeeded]);
    }

    #[tokio::test]
    async fn test_loop_ends_when_job_disappears() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), Duration::from_millis(5));
        let poller = ScriptedPoller::new(vec![Err(RunnerError::not_found("job-1"))]);

        dispatcher.register(config("job-1"), poller).await;
        wait_until_unregistered(&dispatcher, "job-1").await;
        assert!(sender.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_poll_errors_do_not_stop_loop() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), Duration::from_millis(5));
        let poller = ScriptedPoller::new(vec![
            Err(RunnerError::backend("apiserver unavailable")),
            Ok(status(JobState::Failed)),
        ]);

        dispatcher.register(config("job-1"), poller).await;
        wait_until_unregistered(&dispatcher, "job-1").await;
        assert_eq!(sender.payloads().len(), 1);
        assert_eq!(sender.payloads()[0].status, JobState::Failed);
    }

    #[tokio::test]
    async fn test_delivery_failures_keep_loop_alive() {
        let dispatcher = CallbackDispatcher::new(Arc::new(FailingSender), Duration::from_millis(5));
        let poller = ScriptedPoller::new(vec![Ok(status(JobState::Running))]);

        dispatcher.register(config("job-1"), poller).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(dispatcher.is_registered("job-1").await);

        dispatcher.stop("job-1").await;
        assert!(!dispatcher.is_registered("job-1").await);
    }

    #[tokio::test]
    async fn test_finish_sends_final_status_and_silences_loop() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), Duration::from_millis(5));
        let poller = ScriptedPoller::new(vec![Ok(status(JobState::Running))]);

        dispatcher.register(config("job-1"), poller).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        dispatcher.finish(&status(JobState::Cancelled)).await;
        let delivered = sender.payloads().len();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let payloads = sender.payloads();
        assert_eq!(payloads.len(), delivered);
        assert_eq!(payloads.last().unwrap().status, JobState::Cancelled);
        assert!(!dispatcher.is_registered("job-1").await);
    }

    #[tokio::test]
    async fn test_register_replaces_existing_loop() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), Duration::from_secs(3600));
        let first = ScriptedPoller::new(vec![Ok(status(JobState::Running))]);
        let second = ScriptedPoller::new(vec![Ok(status(JobState::Running))]);

        dispatcher.register(config("job-1"), first).await;
        dispatcher.register(config("job-1"), second).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(dispatcher.is_registered("job-1").await);

        dispatcher.shutdown().await;
        assert!(!dispatcher.is_registered("job-1").await);
    }

    #[tokio::test]
    async fn test_notify_without_registration_is_noop() {
        let sender = Arc::new(RecordingSender::default());
        let dispatcher = CallbackDispatcher::new(sender.clone(), Duration::from_millis(5));
        dispatcher.notify(&status(JobState::Submitted)).await;
        assert!(sender.payloads().is_empty());
    }
}
