//! Capture jobs, their lifecycle and the store that holds them between attempts.

use crate::{CaptureError, ReservationId, Viewport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(JobId)
            .map_err(|e| CaptureError::Validation(format!("invalid job id {s}: {e}")))
    }
}

/// Job lifecycle.
///
/// `Queued` is initial, `Completed` and `Failed` are terminal. The only
/// backwards edge is `Processing -> Queued`, taken when an attempt is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, next),
            (Queued, Processing)
                // lease expired and the message was picked up again
                | (Processing, Processing)
                | (Processing, Queued)
                | (Processing, Completed)
                | (Processing, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact formats a capture can produce
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
    Pdf,
}

impl OutputFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Webp => "image/webp",
            OutputFormat::Pdf => "application/pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Webp => "webp",
            OutputFormat::Pdf => "pdf",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub format: OutputFormat,
    /// Overrides the configured viewport
    pub viewport: Option<Viewport>,
    pub full_page: bool,
    /// Extra settle time after load, in milliseconds
    pub wait_ms: Option<u64>,
    /// Capture only the first element matching this CSS selector
    pub selector: Option<String>,
}

impl RenderOptions {
    pub fn wait(&self) -> Option<Duration> {
        self.wait_ms.map(Duration::from_millis)
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureRequest {
    pub user_id: UserId,
    pub url: String,
    #[serde(default)]
    pub options: RenderOptions,
    #[serde(default)]
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: UserId,
    pub url: String,
    pub options: RenderOptions,
    pub status: JobStatus,
    pub attempts: u32,
    /// Fixed when the job is created
    pub cost: i64,
    /// Credit hold of the attempt currently in flight, if any
    pub reservation: Option<ReservationId>,
    pub result_url: Option<String>,
    pub error_reason: Option<String>,
    pub error_message: Option<String>,
    pub processing_time_ms: Option<u64>,
    pub webhook_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: CaptureRequest, cost: i64) -> Self {
        Self {
            id: JobId::new(),
            user_id: request.user_id,
            url: request.url,
            options: request.options,
            status: JobStatus::Queued,
            attempts: 0,
            cost,
            reservation: None,
            result_url: None,
            error_reason: None,
            error_message: None,
            processing_time_ms: None,
            webhook_url: request.webhook_url,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), CaptureError> {
        if !self.status.can_transition_to(next) {
            return Err(CaptureError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_processing(&mut self) -> Result<(), CaptureError> {
        self.transition(JobStatus::Processing)?;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Counts a render attempt. Called once a browser handle has been lent.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    pub fn mark_queued(&mut self) -> Result<(), CaptureError> {
        self.transition(JobStatus::Queued)
    }

    pub fn mark_completed(
        &mut self,
        result_url: String,
        processing_time: Duration,
    ) -> Result<(), CaptureError> {
        self.transition(JobStatus::Completed)?;
        self.result_url = Some(result_url);
        self.processing_time_ms = Some(processing_time.as_millis() as u64);
        self.error_reason = None;
        self.error_message = None;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self, error: &CaptureError) -> Result<(), CaptureError> {
        self.transition(JobStatus::Failed)?;
        self.error_reason = Some(error.reason().to_string());
        self.error_message = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            status: self.status,
            attempts: self.attempts,
            result_url: self.result_url.clone(),
            error_reason: self.error_reason.clone(),
            error_message: self.error_message.clone(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// What a status query returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub status: JobStatus,
    pub attempts: u32,
    pub result_url: Option<String>,
    pub error_reason: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable home of job records between attempts.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: Job) -> Result<(), CaptureError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, CaptureError>;

    async fn save(&self, job: &Job) -> Result<(), CaptureError>;

    /// Removes a job that never made it onto the queue.
    async fn remove(&self, id: JobId) -> Result<(), CaptureError>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<(), CaptureError> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, CaptureError> {
        Ok(self.jobs.get(&id).map(|job| job.clone()))
    }

    async fn save(&self, job: &Job) -> Result<(), CaptureError> {
        match self.jobs.get_mut(&job.id) {
            Some(mut existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(CaptureError::JobNotFound(job.id.to_string())),
        }
    }

    async fn remove(&self, id: JobId) -> Result<(), CaptureError> {
        self.jobs.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CaptureRequest {
        CaptureRequest {
            user_id: "alice".to_string(),
            url: "https://example.com".to_string(),
            options: RenderOptions::default(),
            webhook_url: None,
        }
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = Job::new(request(), 2);
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.cost, 2);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut job = Job::new(request(), 1);
        job.mark_processing().unwrap();
        job.mark_completed("https://cdn/x.png".to_string(), Duration::from_millis(40))
            .unwrap();

        assert!(job.status.is_terminal());
        assert!(job.mark_queued().is_err());
        assert!(job.mark_processing().is_err());
        assert!(job
            .mark_failed(&CaptureError::Timeout(Duration::from_secs(1)))
            .is_err());
        assert_eq!(job.processing_time_ms, Some(40));
    }

    #[test]
    fn test_queued_cannot_skip_processing() {
        let mut job = Job::new(request(), 1);
        assert!(matches!(
            job.mark_completed("x".to_string(), Duration::ZERO),
            Err(CaptureError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_retry_edge_and_attempts() {
        let mut job = Job::new(request(), 1);
        job.mark_processing().unwrap();
        assert_eq!(job.begin_attempt(), 1);
        job.mark_queued().unwrap();
        job.mark_processing().unwrap();
        assert_eq!(job.begin_attempt(), 2);

        job.mark_failed(&CaptureError::PermanentRenderFailure("blocked".to_string()))
            .unwrap();
        assert_eq!(job.error_reason.as_deref(), Some("permanent_render_failure"));
        assert_eq!(job.view().attempts, 2);
    }

    #[test]
    fn test_capture_request_parses_with_defaults() {
        let request: CaptureRequest =
            serde_json::from_str(r#"{"user_id": "bob", "url": "https://example.com"}"#).unwrap();
        assert_eq!(request.options.format, OutputFormat::Png);
        assert!(request.webhook_url.is_none());

        let request: CaptureRequest = serde_json::from_str(
            r#"{"user_id": "bob", "url": "https://example.com", "options": {"format": "pdf", "wait_ms": 250}}"#,
        )
        .unwrap();
        assert_eq!(request.options.format, OutputFormat::Pdf);
        assert_eq!(request.options.wait(), Some(Duration::from_millis(250)));
    }

    #[tokio::test]
    async fn test_store_save_requires_insert() {
        let store = InMemoryJobStore::new();
        let job = Job::new(request(), 1);

        assert!(store.save(&job).await.is_err());
        store.insert(job.clone()).await.unwrap();

        let mut loaded = store.get(job.id).await.unwrap().unwrap();
        loaded.mark_processing().unwrap();
        store.save(&loaded).await.unwrap();

        assert_eq!(
            store.get(job.id).await.unwrap().unwrap().status,
            JobStatus::Processing
        );
    }
}
