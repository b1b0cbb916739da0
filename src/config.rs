//! Configuration management with serde serialization/deserialization
//!
//! This module provides the configuration surface for the capture scheduler:
//! queue backend selection, worker and browser pool sizing, per-attempt
//! timeouts, the retry schedule and Chrome launch settings.

use crate::CaptureError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the capture scheduler
///
/// # Examples
///
/// ```rust
/// use capture_scheduler::Config;
///
/// let config = Config {
///     worker_pool_size: 4,
///     browser_pool_size: 2,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Which queue implementation backs the scheduler (default: in-memory)
    pub queue_backend: QueueBackend,

    /// Number of parallel worker loops (default: number of CPUs)
    pub worker_pool_size: usize,

    /// Number of Chrome browser instances kept in the pool (default: 4)
    ///
    /// Fixed for the lifetime of the process. Workers beyond this count wait
    /// in `acquire` for a handle to free up.
    pub browser_pool_size: usize,

    /// Upper bound on a single render attempt (default: 30 seconds)
    pub render_timeout: Duration,

    /// How long a worker waits for a browser handle (default: 10 seconds)
    pub acquire_timeout: Duration,

    /// Render attempts allowed per job before it is dead-lettered (default: 3)
    pub max_attempts: u32,

    /// Exponential backoff schedule for requeues
    pub retry: RetryConfig,

    /// Lease duration on a dequeued message (default: 120 seconds)
    ///
    /// Must exceed the longest expected attempt (acquire timeout, then render
    /// and upload each bounded by the render timeout), otherwise a slow
    /// attempt's message becomes visible to another worker while still in
    /// flight.
    pub visibility_timeout: Duration,

    /// How long an idle worker blocks on an empty queue before polling again
    pub poll_interval: Duration,

    /// Upper bound on a single webhook delivery (default: 10 seconds)
    pub webhook_timeout: Duration,

    /// Idle browser instances older than this are recycled (default: 5 minutes)
    pub browser_idle_timeout: Duration,

    /// Interval between idle-recycling sweeps of the browser pool
    pub reaper_interval: Duration,

    /// Time in-flight jobs get to finish on shutdown before being cancelled
    pub shutdown_grace_period: Duration,

    /// Credits charged per capture (default: 1)
    pub default_cost: i64,

    /// Submissions accepted per user per minute; 0 disables the limit
    pub rate_limit_per_minute: usize,

    /// Root directory for stored artifacts
    pub storage_dir: PathBuf,

    /// Public URL prefix for stored artifacts; `file://` URLs when unset
    pub public_base_url: Option<String>,

    /// Default browser viewport
    pub viewport: Viewport,

    /// Path to Chrome/Chromium executable (default: auto-detect)
    pub chrome_path: Option<String>,

    /// Custom User-Agent string for page loads
    pub user_agent: Option<String>,

    /// Memory limit per Chrome instance in bytes (default: 1GB)
    pub memory_limit: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_backend: QueueBackend::Memory,
            worker_pool_size: num_cpus::get(),
            browser_pool_size: 4,
            render_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(10),
            max_attempts: 3,
            retry: RetryConfig::default(),
            visibility_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            webhook_timeout: Duration::from_secs(10),
            browser_idle_timeout: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
            shutdown_grace_period: Duration::from_secs(30),
            default_cost: 1,
            rate_limit_per_minute: 60,
            storage_dir: PathBuf::from("captures"),
            public_base_url: None,
            viewport: Viewport::default(),
            chrome_path: None,
            user_agent: None,
            memory_limit: Some(1024 * 1024 * 1024), // 1GB
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if self.worker_pool_size == 0 {
            return Err(invalid("Worker pool size must be greater than 0"));
        }

        if self.browser_pool_size == 0 {
            return Err(invalid("Browser pool size must be greater than 0"));
        }

        let intervals = [
            ("Render timeout", self.render_timeout),
            ("Acquire timeout", self.acquire_timeout),
            ("Poll interval", self.poll_interval),
            ("Webhook timeout", self.webhook_timeout),
            ("Browser idle timeout", self.browser_idle_timeout),
            ("Reaper interval", self.reaper_interval),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| value.is_zero()) {
            return Err(CaptureError::Configuration(format!(
                "{name} must be greater than 0"
            )));
        }

        if self.max_attempts == 0 {
            return Err(invalid("Max attempts must be greater than 0"));
        }

        if self.default_cost < 0 {
            return Err(invalid("Default cost must not be negative"));
        }

        if self.viewport.width == 0 || self.viewport.height == 0 {
            return Err(invalid("Viewport dimensions must be greater than 0"));
        }

        if self.retry.multiplier < 1.0 {
            return Err(invalid("Retry multiplier must be at least 1.0"));
        }

        let attempt_budget = self.acquire_timeout + self.render_timeout * 2;
        if self.visibility_timeout <= attempt_budget {
            return Err(CaptureError::Configuration(format!(
                "Visibility timeout {:?} must exceed acquire + render + upload budget {:?}",
                self.visibility_timeout, attempt_budget
            )));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> CaptureError {
    CaptureError::Configuration(message.to_string())
}

/// Queue implementation, chosen once at startup
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueBackend {
    /// Process-local queue; contents are lost on restart
    #[default]
    Memory,
    /// In-memory queue mirrored to a JSON snapshot file
    Journal { path: PathBuf },
}

/// Browser viewport configuration for captures
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Viewport {
    /// Viewport width in pixels (default: 1920)
    pub width: u32,

    /// Viewport height in pixels (default: 1080)
    pub height: u32,

    /// Device pixel ratio for high-DPI displays (default: 1.0)
    pub device_scale_factor: f64,

    /// Whether to emulate a mobile device (default: false)
    pub mobile: bool,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            device_scale_factor: 1.0,
            mobile: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff before the next try, after `attempt` tries have been made (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        let delay = Duration::from_millis(delay.min(u64::MAX as f64) as u64);

        if delay > self.max_delay {
            self.max_delay
        } else {
            delay
        }
    }
}

/// Generate Chrome arguments with a unique instance id for pool isolation
///
/// Each pool slot gets its own user data and temp directory and its own
/// debugging port so concurrent instances never trip Chrome's singleton lock.
pub fn get_chrome_args_with_instance_id(config: &Config, instance_id: usize) -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), instance_id);

    let mut args = vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--disable-features=TranslateUI,ProcessSingleton".to_string(),
        "--hide-scrollbars".to_string(),
        format!(
            "--window-size={},{}",
            config.viewport.width, config.viewport.height
        ),
        format!("--user-data-dir=/tmp/capture-scheduler-{unique_id}"),
        format!("--remote-debugging-port={}", 9222 + instance_id),
    ];

    if let Some(memory_limit) = config.memory_limit {
        args.push(format!(
            "--js-flags=--max-old-space-size={}",
            memory_limit / 1024 / 1024
        ));
    }

    if let Some(user_agent) = &config.user_agent {
        args.push(format!("--user-agent={user_agent}"));
    }

    args
}

pub fn create_browser_config_with_instance_id(
    config: &Config,
    instance_id: usize,
) -> Result<chromiumoxide::browser::BrowserConfig, CaptureError> {
    use chromiumoxide::browser::BrowserConfig;

    let mut builder = BrowserConfig::builder()
        .window_size(config.viewport.width, config.viewport.height)
        .args(get_chrome_args_with_instance_id(config, instance_id));

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder.build().map_err(CaptureError::BrowserLaunchFailed)
}
