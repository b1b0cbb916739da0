use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CaptureError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Insufficient credits for user {user_id}: required {required}, available {available}")]
    InsufficientCredits {
        user_id: String,
        required: i64,
        available: i64,
    },

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("No browser handle became available within {0:?}")]
    ResourceExhausted(Duration),

    #[error("Browser instance unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("Browser launch failed: {0}")]
    BrowserLaunchFailed(String),

    #[error("Render timed out after {0:?}")]
    Timeout(Duration),

    #[error("Navigation failed: {0}")]
    NavigationFailure(String),

    #[error("Render failed permanently: {0}")]
    PermanentRenderFailure(String),

    #[error("Gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("Notification failed: {0}")]
    Notification(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Lease on message {0} is no longer held")]
    LeaseLost(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Not authorized to access job {0}")]
    JobNotAuthorized(String),

    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CaptureError {
    /// Whether a render attempt that failed with this error may be tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CaptureError::Timeout(_)
                | CaptureError::NavigationFailure(_)
                | CaptureError::Storage(_)
                | CaptureError::BrowserUnavailable(_)
        )
    }

    /// Stable code recorded on failed jobs and used as a metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            CaptureError::Validation(_) => "validation_error",
            CaptureError::InsufficientCredits { .. } => "insufficient_credits",
            CaptureError::RateLimited { .. } => "rate_limited",
            CaptureError::ResourceExhausted(_) => "resource_exhausted",
            CaptureError::BrowserUnavailable(_) => "browser_unavailable",
            CaptureError::BrowserLaunchFailed(_) => "browser_launch_failed",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::NavigationFailure(_) => "navigation_failure",
            CaptureError::PermanentRenderFailure(_) => "permanent_render_failure",
            CaptureError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            CaptureError::Notification(_) => "notification_error",
            CaptureError::Storage(_) => "storage_error",
            CaptureError::LeaseLost(_) => "lease_lost",
            CaptureError::JobNotFound(_) => "job_not_found",
            CaptureError::JobNotAuthorized(_) => "job_not_authorized",
            CaptureError::InvalidTransition { .. } => "invalid_transition",
            CaptureError::Configuration(_) => "configuration_error",
            CaptureError::Io(_) => "io_error",
            CaptureError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(err: serde_json::Error) -> Self {
        CaptureError::Serialization(err.to_string())
    }
}
