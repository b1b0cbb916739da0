//! Worker loops and the pool that runs them
//!
//! Each worker leases a message, reserves credit, borrows a browser, renders,
//! then settles or releases the credit and acknowledges, requeues or
//! dead-letters the message. The browser handle always goes back to the pool.
//!
//! A forced shutdown can only interrupt the wait for a browser or the render
//! itself. Once a render has finished, settlement runs to completion.

use crate::browser_pool::BrowserPool;
use crate::credits::{CreditGuard, CreditReservation};
use crate::executor::JobExecutor;
use crate::job::JobStore;
use crate::notify::NotificationDispatcher;
use crate::queue::{JobQueue, QueueMessage};
use crate::utils::{format_bytes, format_duration};
use crate::{telemetry, CaptureError, Config, Job, RetryConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub visibility_timeout: Duration,
    pub acquire_timeout: Duration,
    pub max_attempts: u32,
    pub retry: RetryConfig,
    /// Pause after a queue error before leasing again
    pub error_backoff: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout,
            acquire_timeout: config.acquire_timeout,
            max_attempts: config.max_attempts,
            retry: config.retry.clone(),
            error_backoff: config.poll_interval,
        }
    }
}

/// Collaborators shared by every worker loop.
pub struct WorkerContext {
    pub queue: Arc<dyn JobQueue>,
    pub jobs: Arc<dyn JobStore>,
    pub credits: Arc<CreditGuard>,
    pub pool: BrowserPool,
    pub executor: Arc<JobExecutor>,
    pub notifications: NotificationDispatcher,
    pub settings: WorkerSettings,
}

/// What one pass over a leased message ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
    /// A render attempt failed and the job went back on the queue
    Retried,
    /// Resources were short; the job went back without using an attempt
    Deferred,
    /// Message for a missing or already finished job
    Skipped,
    /// Cut off by shutdown and handed back to the queue
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub failed_count: usize,
    pub retried_count: usize,
}

#[derive(Clone)]
pub struct CaptureWorker {
    id: usize,
    name: String,
    context: Arc<WorkerContext>,
    force: watch::Receiver<bool>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    failed_count: Arc<AtomicUsize>,
    retried_count: Arc<AtomicUsize>,
}

impl CaptureWorker {
    /// `force` turning true cuts off a browser wait or render in progress.
    pub fn new(id: usize, context: Arc<WorkerContext>, force: watch::Receiver<bool>) -> Self {
        Self {
            id,
            name: format!("worker-{id}"),
            context,
            force,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            failed_count: Arc::new(AtomicUsize::new(0)),
            retried_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Leases until `stop` turns true.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        info!("Starting capture worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            if *stop.borrow() {
                break;
            }

            let visibility = self.context.settings.visibility_timeout;
            let leased = tokio::select! {
                _ = flag_raised(&mut stop) => break,
                leased = self.context.queue.lease(&self.name, visibility) => leased,
            };

            let message = match leased {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    error!("Worker {} failed to lease: {}", self.id, e);
                    tokio::time::sleep(self.context.settings.error_backoff).await;
                    continue;
                }
            };

            match self.process(&message).await {
                Ok(Outcome::Completed) => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Outcome::Failed) => {
                    self.failed_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Outcome::Retried) => {
                    self.retried_count.fetch_add(1, Ordering::Relaxed);
                }
                Ok(outcome) => {
                    debug!("Worker {} finished message {}: {:?}", self.id, message.id, outcome);
                }
                Err(e) => {
                    // the lease lapses and the message is redelivered
                    error!(
                        "Worker {} could not process job {}: {}",
                        self.id, message.job_id, e
                    );
                }
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        info!("Capture worker {} stopped", self.id);
    }

    pub async fn process(&self, message: &QueueMessage) -> Result<Outcome, CaptureError> {
        let ctx = &self.context;

        let Some(mut job) = ctx.jobs.get(message.job_id).await? else {
            warn!("Message {} references unknown job {}, dropping it", message.id, message.job_id);
            self.acknowledge(message).await;
            return Ok(Outcome::Skipped);
        };

        if job.status.is_terminal() {
            debug!(
                "Job {} already {}, acknowledging duplicate delivery",
                job.id, job.status
            );
            self.acknowledge(message).await;
            return Ok(Outcome::Skipped);
        }

        // a previous holder of this message lost its lease mid-attempt
        if let Some(stale) = job.reservation.take() {
            match ctx.credits.release_by_id(stale).await {
                Ok(true) => info!("Released stale reservation {} of job {}", stale, job.id),
                Ok(false) => {}
                Err(e) => warn!("Could not release stale reservation {}: {}", stale, e),
            }
        }

        job.mark_processing()?;
        ctx.jobs.save(&job).await?;
        debug!(
            "Worker {} processing job {} for user {} (delivery {})",
            self.id, job.id, job.user_id, message.deliveries
        );

        if job.attempts >= ctx.settings.max_attempts {
            let error = CaptureError::MaxRetriesExceeded {
                attempts: job.attempts,
                last_error: job
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "lease expired during final attempt".to_string()),
            };
            return self.fail(job, message, None, error, true).await;
        }

        let reservation = match ctx.credits.reserve(&job.user_id, job.id, job.cost).await {
            Ok(reservation) => reservation,
            Err(e @ CaptureError::InsufficientCredits { .. }) => {
                return self.fail(job, message, None, e, false).await;
            }
            Err(e) => {
                warn!("Credit reservation for job {} failed: {}", job.id, e);
                return self.defer(job, message, None).await;
            }
        };
        job.reservation = Some(reservation.id);
        ctx.jobs.save(&job).await?;

        let mut force = self.force.clone();
        let acquired = tokio::select! {
            acquired = ctx.pool.acquire(ctx.settings.acquire_timeout) => acquired,
            true = flag_raised(&mut force) => {
                return self.abandon(job, message, &reservation).await;
            }
        };
        let handle = match acquired {
            Ok(handle) => handle,
            Err(e) => {
                debug!("No browser for job {}: {}", job.id, e);
                return self.defer(job, message, Some(&reservation)).await;
            }
        };

        let attempt = job.begin_attempt();
        ctx.jobs.save(&job).await?;
        info!(
            "Worker {} rendering job {} (attempt {}/{}) on browser {:?}",
            self.id,
            job.id,
            attempt,
            ctx.settings.max_attempts,
            handle.slot_id()
        );

        let rendered = tokio::select! {
            rendered = ctx.executor.execute(&job, &handle) => rendered,
            true = flag_raised(&mut force) => {
                // the page may still be loading
                ctx.pool.release(handle, false).await;
                return self.abandon(job, message, &reservation).await;
            }
        };
        let healthy = !matches!(
            rendered,
            Err(CaptureError::Timeout(_)) | Err(CaptureError::BrowserUnavailable(_))
        );
        ctx.pool.release(handle, healthy).await;

        match rendered {
            Ok(result) => {
                if let Err(e) = ctx.credits.settle(&reservation).await {
                    error!(
                        "Settling reservation {} for job {} failed: {}",
                        reservation.id, job.id, e
                    );
                }
                job.reservation = None;
                job.mark_completed(result.url, result.processing_time)?;
                ctx.jobs.save(&job).await?;
                self.acknowledge(message).await;

                telemetry::record_job_completed(result.processing_time);
                info!(
                    "Job {} completed in {} ({})",
                    job.id,
                    format_duration(result.processing_time),
                    format_bytes(result.size)
                );
                ctx.notifications.notify(&job);
                Ok(Outcome::Completed)
            }
            Err(e) if e.is_retryable() && attempt >= ctx.settings.max_attempts => {
                let error = CaptureError::MaxRetriesExceeded {
                    attempts: attempt,
                    last_error: e.to_string(),
                };
                self.fail(job, message, Some(&reservation), error, true).await
            }
            Err(e) if e.is_retryable() => {
                self.release_credits(&reservation).await;
                job.reservation = None;
                job.error_message = Some(e.to_string());
                job.mark_queued()?;
                ctx.jobs.save(&job).await?;

                let delay = ctx.settings.retry.delay_for(attempt);
                ctx.queue.requeue(message, delay).await?;
                telemetry::record_job_retried();
                warn!(
                    "Job {} attempt {} failed ({}), retrying in {:?}",
                    job.id, attempt, e, delay
                );
                Ok(Outcome::Retried)
            }
            Err(e) => self.fail(job, message, Some(&reservation), e, false).await,
        }
    }

    /// Puts the job back without spending an attempt.
    async fn defer(
        &self,
        mut job: Job,
        message: &QueueMessage,
        reservation: Option<&CreditReservation>,
    ) -> Result<Outcome, CaptureError> {
        if let Some(reservation) = reservation {
            self.release_credits(reservation).await;
        }
        job.reservation = None;
        job.mark_queued()?;
        self.context.jobs.save(&job).await?;

        let delay = self.context.settings.retry.delay_for(message.deliveries);
        self.context.queue.requeue(message, delay).await?;
        debug!("Job {} deferred for {:?}", job.id, delay);
        Ok(Outcome::Deferred)
    }

    /// Moves the job to FAILED, settles the message and notifies.
    async fn fail(
        &self,
        mut job: Job,
        message: &QueueMessage,
        reservation: Option<&CreditReservation>,
        error: CaptureError,
        dead_letter: bool,
    ) -> Result<Outcome, CaptureError> {
        if let Some(reservation) = reservation {
            self.release_credits(reservation).await;
        }
        job.reservation = None;
        job.mark_failed(&error)?;
        self.context.jobs.save(&job).await?;

        if dead_letter {
            if let Err(e) = self.context.queue.dead_letter(message, error.reason()).await {
                warn!("Could not dead-letter message {}: {}", message.id, e);
            }
            telemetry::record_job_dead_lettered();
        } else {
            self.acknowledge(message).await;
        }

        telemetry::record_job_failed(error.reason());
        warn!("Job {} failed after {} attempts: {}", job.id, job.attempts, error);
        self.context.notifications.notify(&job);
        Ok(Outcome::Failed)
    }

    async fn release_credits(&self, reservation: &CreditReservation) {
        if let Err(e) = self.context.credits.release(reservation).await {
            error!(
                "Releasing reservation {} for job {} failed: {}",
                reservation.id, reservation.job_id, e
            );
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) {
        if let Err(e) = self.context.queue.acknowledge(message).await {
            warn!("Could not acknowledge message {}: {}", message.id, e);
        }
    }

    /// Hands a job cut off by shutdown back to the queue and refunds the
    /// credit its interrupted attempt held.
    async fn abandon(
        &self,
        mut job: Job,
        message: &QueueMessage,
        reservation: &CreditReservation,
    ) -> Result<Outcome, CaptureError> {
        warn!("Worker {} abandoning job {} at shutdown", self.id, job.id);

        self.release_credits(reservation).await;
        job.reservation = None;
        job.mark_queued()?;
        self.context.jobs.save(&job).await?;
        self.context.queue.requeue(message, Duration::ZERO).await?;
        Ok(Outcome::Abandoned)
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            failed_count: self.failed_count.load(Ordering::Relaxed),
            retried_count: self.retried_count.load(Ordering::Relaxed),
        }
    }
}

/// Resolves once the flag is set; false if its sender went away first.
async fn flag_raised(flag: &mut watch::Receiver<bool>) -> bool {
    flag.wait_for(|raised| *raised).await.is_ok()
}

/// Runs a fixed number of [`CaptureWorker`] loops over one shared context.
pub struct WorkerPool {
    context: Arc<WorkerContext>,
    workers: Vec<CaptureWorker>,
    tasks: JoinSet<()>,
    stop_tx: watch::Sender<bool>,
    force_tx: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(context: Arc<WorkerContext>) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (force_tx, _) = watch::channel(false);

        Self {
            context,
            workers: Vec::new(),
            tasks: JoinSet::new(),
            stop_tx,
            force_tx,
        }
    }

    pub fn start(&mut self, pool_size: usize) {
        if !self.workers.is_empty() {
            warn!("Worker pool already running {} workers", self.workers.len());
            return;
        }

        for id in 0..pool_size {
            let worker = CaptureWorker::new(id, self.context.clone(), self.force_tx.subscribe());
            self.workers.push(worker.clone());
            self.tasks.spawn(worker.run(self.stop_tx.subscribe()));
        }

        info!("Started {} capture workers", pool_size);
    }

    /// Stops leasing, lets in-flight renders run for up to `grace_period`,
    /// then cuts off whatever is left and requeues it.
    pub async fn stop(&mut self, grace_period: Duration) {
        info!("Stopping worker pool (grace period {:?})", grace_period);
        self.stop_tx.send_replace(true);

        let drained = tokio::time::timeout(grace_period, async {
            while self.tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                "{} workers still busy after grace period, forcing shutdown",
                self.tasks.len()
            );
            self.force_tx.send_replace(true);
            while self.tasks.join_next().await.is_some() {}
        }

        info!("Worker pool stopped");
    }

    pub fn stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(CaptureWorker::get_stats).collect()
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}
