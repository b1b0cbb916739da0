//! Submission and status API, plus the one place every component is built.

use crate::browser_pool::{BrowserFactory, BrowserPool, BrowserPoolStats};
use crate::chrome::ChromeFactory;
use crate::credits::{CreditGuard, CreditStore, InMemoryCreditStore, InMemoryUsageLog, UsageLog};
use crate::executor::JobExecutor;
use crate::job::{InMemoryJobStore, JobStatusView, JobStore};
use crate::notify::{NotificationDispatcher, Notifier, WebhookNotifier};
use crate::queue::{build_queue, JobQueue, QueueStats};
use crate::ratelimit::RateLimiter;
use crate::storage::{LocalStorage, Storage};
use crate::utils::validate_url;
use crate::worker::{WorkerContext, WorkerPool, WorkerSettings, WorkerStats};
use crate::{telemetry, CaptureError, CaptureRequest, Config, Job, JobId};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Front door for callers: admits jobs and answers status queries.
#[derive(Clone)]
pub struct CaptureService {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    credits: Arc<CreditGuard>,
    rate_limiter: Arc<RateLimiter>,
    default_cost: i64,
}

impl CaptureService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        credits: Arc<CreditGuard>,
        rate_limiter: Arc<RateLimiter>,
        default_cost: i64,
    ) -> Self {
        Self {
            jobs,
            queue,
            credits,
            rate_limiter,
            default_cost,
        }
    }

    /// Validates, rate-limits and credit-checks a request, then queues it.
    /// Every rejection happens before anything is stored or enqueued.
    pub async fn submit(&self, request: CaptureRequest) -> Result<JobId, CaptureError> {
        match self.admit(request).await {
            Ok(id) => {
                telemetry::record_job_submitted();
                Ok(id)
            }
            Err(e) => {
                telemetry::record_job_rejected(e.reason());
                debug!("Rejected submission: {}", e);
                Err(e)
            }
        }
    }

    async fn admit(&self, request: CaptureRequest) -> Result<JobId, CaptureError> {
        if request.user_id.trim().is_empty() {
            return Err(CaptureError::Validation("user id is required".to_string()));
        }
        validate_url(&request.url)?;
        if let Some(webhook) = &request.webhook_url {
            validate_url(webhook)?;
        }
        if let Some(viewport) = &request.options.viewport {
            if viewport.width == 0 || viewport.height == 0 {
                return Err(CaptureError::Validation("viewport must be non-empty".to_string()));
            }
        }

        self.rate_limiter.check(&request.user_id)?;
        self.credits.precheck(&request.user_id, self.default_cost).await?;

        let job = Job::new(request, self.default_cost);
        let id = job.id;
        self.jobs.insert(job.clone()).await?;

        if let Err(e) = self.queue.enqueue(&job).await {
            warn!("Enqueue of job {} failed, discarding it: {}", id, e);
            self.jobs.remove(id).await?;
            return Err(e);
        }

        info!("Accepted job {} for user {} ({})", id, job.user_id, job.url);
        Ok(id)
    }

    /// Current state of a job, visible only to its owner.
    pub async fn status(
        &self,
        job_id: JobId,
        requester: &str,
    ) -> Result<JobStatusView, CaptureError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| CaptureError::JobNotFound(job_id.to_string()))?;

        if job.user_id != requester {
            return Err(CaptureError::JobNotAuthorized(job_id.to_string()));
        }
        Ok(job.view())
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, CaptureError> {
        self.credits.balance(user_id).await
    }
}

/// External collaborators the core is wired against.
pub struct Collaborators {
    pub browser_factory: Arc<dyn BrowserFactory>,
    pub storage: Arc<dyn Storage>,
    pub notifier: Arc<dyn Notifier>,
    pub credit_store: Arc<dyn CreditStore>,
    pub usage_log: Arc<dyn UsageLog>,
    pub jobs: Arc<dyn JobStore>,
}

impl Collaborators {
    /// Chrome, local disk, HTTP webhooks and in-memory ledgers.
    pub fn production(
        config: &Config,
        credit_store: Arc<InMemoryCreditStore>,
    ) -> Result<Self, CaptureError> {
        Ok(Self {
            browser_factory: Arc::new(ChromeFactory::new(config.clone())),
            storage: Arc::new(LocalStorage::new(
                config.storage_dir.clone(),
                config.public_base_url.clone(),
            )),
            notifier: Arc::new(WebhookNotifier::new(config.webhook_timeout)?),
            credit_store,
            usage_log: Arc::new(InMemoryUsageLog::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct SystemStats {
    pub queue: QueueStats,
    pub pool: BrowserPoolStats,
    pub workers: Vec<WorkerStats>,
}

/// Every running component, built by [`compose`].
pub struct CaptureSystem {
    pub service: CaptureService,
    pub pool: BrowserPool,
    queue: Arc<dyn JobQueue>,
    workers: WorkerPool,
    reaper: Option<JoinHandle<()>>,
    config: Config,
}

impl CaptureSystem {
    /// Starts the configured number of worker loops and the idle reaper.
    pub fn start(&mut self) {
        self.workers.start(self.config.worker_pool_size);
        if self.reaper.is_none() {
            self.reaper = Some(self.pool.start_idle_reaper(self.config.reaper_interval));
        }
    }

    pub async fn stats(&self) -> SystemStats {
        SystemStats {
            queue: self.queue.stats().await,
            pool: self.pool.stats().await,
            workers: self.workers.stats(),
        }
    }

    /// Stops the workers within the grace period, then the browsers.
    pub async fn shutdown(mut self) {
        self.workers.stop(self.config.shutdown_grace_period).await;
        if let Some(reaper) = self.reaper.take() {
            reaper.abort();
        }
        self.pool.shutdown().await;
        info!("Capture system shut down");
    }
}

/// Builds the whole pipeline from configuration and collaborators.
pub async fn compose(
    config: Config,
    collaborators: Collaborators,
) -> Result<CaptureSystem, CaptureError> {
    config.validate()?;

    let queue = build_queue(&config).await?;
    let credits = Arc::new(CreditGuard::new(
        collaborators.credit_store,
        collaborators.usage_log,
    ));
    let pool = BrowserPool::new(
        collaborators.browser_factory,
        config.browser_pool_size,
        config.browser_idle_timeout,
    )
    .await?;
    let executor = Arc::new(JobExecutor::new(
        collaborators.storage,
        config.render_timeout,
        config.viewport.clone(),
    ));

    let worker_context = Arc::new(WorkerContext {
        queue: queue.clone(),
        jobs: collaborators.jobs.clone(),
        credits: credits.clone(),
        pool: pool.clone(),
        executor,
        notifications: NotificationDispatcher::new(collaborators.notifier),
        settings: WorkerSettings::from_config(&config),
    });

    let service = CaptureService::new(
        collaborators.jobs,
        queue.clone(),
        credits,
        Arc::new(RateLimiter::per_minute(config.rate_limit_per_minute)),
        config.default_cost,
    );

    info!(
        "Composed capture system: {} workers, {} browsers",
        config.worker_pool_size, config.browser_pool_size
    );

    Ok(CaptureSystem {
        service,
        pool,
        queue,
        workers: WorkerPool::new(worker_context),
        reaper: None,
        config,
    })
}
