//! Lease-based job queue
//!
//! Messages are handed to one worker at a time under a lease. A lease that is
//! neither acknowledged nor requeued before its visibility deadline lapses is
//! reclaimed and the message becomes leasable again, which gives
//! at-least-once delivery. Ordering is FIFO within one queue instance.

use crate::{telemetry, CaptureError, Config, Job, JobId, QueueBackend};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type MessageId = Uuid;
pub type LeaseToken = Uuid;

/// A leased message. Only the holder of the current lease token can settle it.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: MessageId,
    pub job_id: JobId,
    pub lease_token: LeaseToken,
    pub leased_by: String,
    pub visible_until: Instant,
    /// How many times this message has been leased, this lease included
    pub deliveries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub job_id: JobId,
    pub reason: String,
    pub deliveries: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &Job) -> Result<MessageId, CaptureError>;

    /// Waits up to the queue's poll interval for a visible message.
    async fn lease(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, CaptureError>;

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), CaptureError>;

    /// Returns the message to the queue, invisible for `delay`.
    async fn requeue(&self, message: &QueueMessage, delay: Duration) -> Result<(), CaptureError>;

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), CaptureError>;

    async fn stats(&self) -> QueueStats;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    id: MessageId,
    job_id: JobId,
    deliveries: u32,
    enqueued_at: DateTime<Utc>,
}

#[derive(Debug)]
struct InFlight {
    envelope: Envelope,
    lease_token: LeaseToken,
    visible_until: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Envelope>,
    delayed: Vec<(Instant, Envelope)>,
    in_flight: HashMap<MessageId, InFlight>,
    dead: Vec<DeadLetter>,
}

impl QueueState {
    /// Promotes due delayed messages and reclaims expired leases.
    fn reclaim(&mut self, now: Instant) {
        if !self.delayed.is_empty() {
            self.delayed.sort_by_key(|(due, _)| *due);
            let due_count = self.delayed.iter().take_while(|(due, _)| *due <= now).count();
            for (_, envelope) in self.delayed.drain(..due_count) {
                self.ready.push_back(envelope);
            }
        }

        let expired: Vec<MessageId> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.visible_until <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(lease) = self.in_flight.remove(&id) {
                warn!(
                    "Lease on message {} for job {} expired, returning it to the queue",
                    id, lease.envelope.job_id
                );
                self.ready.push_back(lease.envelope);
            }
        }
    }

    /// Earliest instant at which something may become visible.
    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(due, _)| *due).min();
        let leases = self.in_flight.values().map(|lease| lease.visible_until).min();

        match (delayed, leases) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn take_lease(&mut self, id: MessageId, token: LeaseToken) -> Result<InFlight, CaptureError> {
        match self.in_flight.get(&id) {
            Some(lease) if lease.lease_token == token => {}
            _ => return Err(CaptureError::LeaseLost(id.to_string())),
        }
        self.in_flight
            .remove(&id)
            .ok_or_else(|| CaptureError::LeaseLost(id.to_string()))
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            delayed: self.delayed.len(),
            in_flight: self.in_flight.len(),
            dead_lettered: self.dead.len(),
        }
    }

    fn live_envelopes(&self) -> Vec<Envelope> {
        let mut envelopes: Vec<Envelope> = self
            .in_flight
            .values()
            .map(|lease| lease.envelope.clone())
            .collect();
        envelopes.extend(self.ready.iter().cloned());
        envelopes.extend(self.delayed.iter().map(|(_, envelope)| envelope.clone()));
        envelopes.sort_by_key(|envelope| envelope.enqueued_at);
        envelopes
    }
}

pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
    poll_interval: Duration,
}

impl InMemoryQueue {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            poll_interval,
        }
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    async fn restore(&self, envelopes: Vec<Envelope>) {
        let mut state = self.state.lock().await;
        state.ready.extend(envelopes);
        if !state.ready.is_empty() {
            self.notify.notify_one();
        }
    }

    async fn snapshot(&self) -> Vec<Envelope> {
        self.state.lock().await.live_envelopes()
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: &Job) -> Result<MessageId, CaptureError> {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            job_id: job.id,
            deliveries: 0,
            enqueued_at: Utc::now(),
        };
        let id = envelope.id;

        {
            let mut state = self.state.lock().await;
            state.ready.push_back(envelope);
            telemetry::record_queue_depth(&state.stats());
        }
        self.notify.notify_one();

        debug!("Enqueued message {} for job {}", id, job.id);
        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, CaptureError> {
        let deadline = Instant::now() + self.poll_interval;

        loop {
            let next_wake = {
                let now = Instant::now();
                let mut state = self.state.lock().await;
                state.reclaim(now);

                if let Some(mut envelope) = state.ready.pop_front() {
                    envelope.deliveries += 1;
                    let lease_token = Uuid::new_v4();
                    let visible_until = now + visibility_timeout;
                    let message = QueueMessage {
                        id: envelope.id,
                        job_id: envelope.job_id,
                        lease_token,
                        leased_by: worker_id.to_string(),
                        visible_until,
                        deliveries: envelope.deliveries,
                    };
                    state.in_flight.insert(
                        envelope.id,
                        InFlight {
                            envelope,
                            lease_token,
                            visible_until,
                        },
                    );
                    telemetry::record_queue_depth(&state.stats());
                    return Ok(Some(message));
                }

                state.next_wake()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), CaptureError> {
        let mut state = self.state.lock().await;
        state.take_lease(message.id, message.lease_token)?;
        telemetry::record_queue_depth(&state.stats());
        Ok(())
    }

    async fn requeue(&self, message: &QueueMessage, delay: Duration) -> Result<(), CaptureError> {
        {
            let mut state = self.state.lock().await;
            let lease = state.take_lease(message.id, message.lease_token)?;
            if delay.is_zero() {
                state.ready.push_back(lease.envelope);
            } else {
                state.delayed.push((Instant::now() + delay, lease.envelope));
            }
            telemetry::record_queue_depth(&state.stats());
        }
        self.notify.notify_one();

        debug!(
            "Requeued message {} for job {} with delay {:?}",
            message.id, message.job_id, delay
        );
        Ok(())
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), CaptureError> {
        let mut state = self.state.lock().await;
        let lease = state.take_lease(message.id, message.lease_token)?;
        state.dead.push(DeadLetter {
            message_id: lease.envelope.id,
            job_id: lease.envelope.job_id,
            reason: reason.to_string(),
            deliveries: lease.envelope.deliveries,
            dead_lettered_at: Utc::now(),
        });
        telemetry::record_queue_depth(&state.stats());

        warn!(
            "Dead-lettered message {} for job {}: {}",
            message.id, message.job_id, reason
        );
        Ok(())
    }

    async fn stats(&self) -> QueueStats {
        self.state.lock().await.stats()
    }
}

/// In-memory queue mirrored to a JSON snapshot on every mutation.
///
/// Leases do not survive a restart: every message found in the snapshot is
/// visible again once the queue is reopened.
pub struct JournaledQueue {
    inner: InMemoryQueue,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JournaledQueue {
    pub async fn open(
        path: impl AsRef<Path>,
        poll_interval: Duration,
    ) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let inner = InMemoryQueue::new(poll_interval);

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                let envelopes: Vec<Envelope> = serde_json::from_str(&content)?;
                info!(
                    "Restored {} queued messages from {}",
                    envelopes.len(),
                    path.display()
                );
                inner.restore(envelopes).await;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self {
            inner,
            path,
            write_lock: Mutex::new(()),
        })
    }

    async fn persist(&self) -> Result<(), CaptureError> {
        let _guard = self.write_lock.lock().await;
        let envelopes = self.inner.snapshot().await;
        let content = serde_json::to_vec(&envelopes)?;

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters().await
    }
}

#[async_trait]
impl JobQueue for JournaledQueue {
    async fn enqueue(&self, job: &Job) -> Result<MessageId, CaptureError> {
        let id = self.inner.enqueue(job).await?;
        self.persist().await?;
        Ok(id)
    }

    async fn lease(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueueMessage>, CaptureError> {
        self.inner.lease(worker_id, visibility_timeout).await
    }

    async fn acknowledge(&self, message: &QueueMessage) -> Result<(), CaptureError> {
        self.inner.acknowledge(message).await?;
        self.persist().await
    }

    async fn requeue(&self, message: &QueueMessage, delay: Duration) -> Result<(), CaptureError> {
        self.inner.requeue(message, delay).await?;
        self.persist().await
    }

    async fn dead_letter(&self, message: &QueueMessage, reason: &str) -> Result<(), CaptureError> {
        self.inner.dead_letter(message, reason).await?;
        self.persist().await
    }

    async fn stats(&self) -> QueueStats {
        self.inner.stats().await
    }
}

/// Builds the configured queue backend.
pub async fn build_queue(config: &Config) -> Result<Arc<dyn JobQueue>, CaptureError> {
    match &config.queue_backend {
        QueueBackend::Memory => {
            info!("Using in-memory job queue");
            Ok(Arc::new(InMemoryQueue::new(config.poll_interval)))
        }
        QueueBackend::Journal { path } => {
            info!("Using journaled job queue at {}", path.display());
            Ok(Arc::new(JournaledQueue::open(path, config.poll_interval).await?))
        }
    }
}
