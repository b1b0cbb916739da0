//! Best-effort job outcome webhooks
//!
//! Delivery runs on its own task after the job has been settled and
//! acknowledged. A single attempt is made; failures are logged and counted,
//! nothing else.

use crate::{telemetry, CaptureError, Job, JobId, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub job_id: JobId,
    pub status: JobStatus,
    pub url: String,
    pub result_url: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookPayload {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
            url: job.url.clone(),
            result_url: job.result_url.clone(),
            error_message: job.error_message.clone(),
            processing_time_ms: job.processing_time_ms,
            completed_at: job.completed_at,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, endpoint: &str, payload: &WebhookPayload) -> Result<(), CaptureError>;
}

/// POSTs the payload as JSON, bounded by a per-request timeout.
pub struct WebhookNotifier {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, CaptureError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("capture-scheduler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CaptureError::Configuration(format!("webhook client: {e}")))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, endpoint: &str, payload: &WebhookPayload) -> Result<(), CaptureError> {
        let response = self
            .client
            .post(endpoint)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CaptureError::Notification(format!("timed out after {:?}", self.timeout))
                } else {
                    CaptureError::Notification(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(CaptureError::Notification(format!(
                "endpoint answered {status}"
            )));
        }
        Ok(())
    }
}

/// Fires terminal job outcomes at the job's webhook, if it has one.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }

    /// Spawns the delivery and returns its task, or `None` when the job has
    /// no webhook.
    pub fn notify(&self, job: &Job) -> Option<JoinHandle<()>> {
        let endpoint = job.webhook_url.clone()?;
        let payload = WebhookPayload::from_job(job);
        let notifier = self.notifier.clone();

        Some(tokio::spawn(async move {
            match notifier.deliver(&endpoint, &payload).await {
                Ok(()) => {
                    telemetry::record_webhook(true);
                    debug!("Delivered {} webhook for job {}", payload.status, payload.job_id);
                }
                Err(e) => {
                    telemetry::record_webhook(false);
                    warn!(
                        "Webhook for job {} to {} failed: {}",
                        payload.job_id, endpoint, e
                    );
                }
            }
        }))
    }
}
