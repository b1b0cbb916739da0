//! Credit admission gate
//!
//! `reserve` deducts the job's cost from the user's balance up front;
//! `settle` makes the deduction permanent and records usage, `release`
//! refunds it. Only held reservations are tracked: a reservation is dropped
//! from the ledger the moment it is settled or released, so repeated
//! settle/release calls find nothing and are no-ops.

use crate::{telemetry, CaptureError, JobId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ReservationId = Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct CreditReservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub job_id: JobId,
    pub amount: i64,
    pub reserved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageEntry {
    pub user_id: UserId,
    pub job_id: JobId,
    pub reservation_id: ReservationId,
    pub amount: i64,
    pub settled_at: DateTime<Utc>,
}

/// Per-user balances. `try_debit` must be atomic with respect to other
/// debits and credits for the same user.
#[async_trait]
pub trait CreditStore: Send + Sync {
    async fn balance(&self, user_id: &str) -> Result<i64, CaptureError>;

    /// Deducts `amount` only if the balance covers it, returning what is left.
    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<i64, CaptureError>;

    async fn credit(&self, user_id: &str, amount: i64) -> Result<i64, CaptureError>;
}

/// Append-only sink for settled consumption.
#[async_trait]
pub trait UsageLog: Send + Sync {
    async fn append(&self, entry: UsageEntry) -> Result<(), CaptureError>;
}

#[derive(Default)]
pub struct InMemoryCreditStore {
    balances: DashMap<UserId, i64>,
}

impl InMemoryCreditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, user_id: impl Into<UserId>, balance: i64) {
        self.balances.insert(user_id.into(), balance);
    }
}

#[async_trait]
impl CreditStore for InMemoryCreditStore {
    async fn balance(&self, user_id: &str) -> Result<i64, CaptureError> {
        Ok(self.balances.get(user_id).map(|b| *b).unwrap_or(0))
    }

    async fn try_debit(&self, user_id: &str, amount: i64) -> Result<i64, CaptureError> {
        // the shard write lock serialises concurrent debits for one user
        match self.balances.get_mut(user_id) {
            Some(mut balance) if *balance >= amount => {
                *balance -= amount;
                Ok(*balance)
            }
            Some(balance) => Err(CaptureError::InsufficientCredits {
                user_id: user_id.to_string(),
                required: amount,
                available: *balance,
            }),
            None => Err(CaptureError::InsufficientCredits {
                user_id: user_id.to_string(),
                required: amount,
                available: 0,
            }),
        }
    }

    async fn credit(&self, user_id: &str, amount: i64) -> Result<i64, CaptureError> {
        let mut balance = self.balances.entry(user_id.to_string()).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }
}

#[derive(Default)]
pub struct InMemoryUsageLog {
    entries: Mutex<Vec<UsageEntry>>,
}

impl InMemoryUsageLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<UsageEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl UsageLog for InMemoryUsageLog {
    async fn append(&self, entry: UsageEntry) -> Result<(), CaptureError> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}

pub struct CreditGuard {
    store: Arc<dyn CreditStore>,
    usage_log: Arc<dyn UsageLog>,
    reservations: DashMap<ReservationId, CreditReservation>,
}

impl CreditGuard {
    pub fn new(store: Arc<dyn CreditStore>, usage_log: Arc<dyn UsageLog>) -> Self {
        Self {
            store,
            usage_log,
            reservations: DashMap::new(),
        }
    }

    /// Submission-time check; does not hold anything.
    pub async fn precheck(&self, user_id: &str, cost: i64) -> Result<(), CaptureError> {
        let available = self.store.balance(user_id).await?;
        if available < cost {
            return Err(CaptureError::InsufficientCredits {
                user_id: user_id.to_string(),
                required: cost,
                available,
            });
        }
        Ok(())
    }

    pub async fn reserve(
        &self,
        user_id: &str,
        job_id: JobId,
        cost: i64,
    ) -> Result<CreditReservation, CaptureError> {
        let remaining = self.store.try_debit(user_id, cost).await?;

        let reservation = CreditReservation {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            job_id,
            amount: cost,
            reserved_at: Utc::now(),
        };
        self.reservations.insert(reservation.id, reservation.clone());

        debug!(
            "Reserved {} credits for user {} (job {}), {} remaining",
            cost, user_id, job_id, remaining
        );
        Ok(reservation)
    }

    /// Takes the reservation off the ledger; false if it was already finalised.
    fn finalise(&self, id: ReservationId) -> bool {
        self.reservations.remove(&id).is_some()
    }

    /// Makes the deduction permanent. Returns false when nothing changed.
    pub async fn settle(&self, reservation: &CreditReservation) -> Result<bool, CaptureError> {
        if !self.finalise(reservation.id) {
            debug!("Reservation {} already finalised, settle ignored", reservation.id);
            return Ok(false);
        }

        telemetry::record_credits_settled(reservation.amount);
        info!(
            "Settled {} credits for user {} (job {})",
            reservation.amount, reservation.user_id, reservation.job_id
        );

        self.usage_log
            .append(UsageEntry {
                user_id: reservation.user_id.clone(),
                job_id: reservation.job_id,
                reservation_id: reservation.id,
                amount: reservation.amount,
                settled_at: Utc::now(),
            })
            .await?;

        Ok(true)
    }

    /// Refunds the held amount. Returns false when nothing changed.
    pub async fn release(&self, reservation: &CreditReservation) -> Result<bool, CaptureError> {
        if !self.finalise(reservation.id) {
            debug!("Reservation {} already finalised, release ignored", reservation.id);
            return Ok(false);
        }

        if let Err(e) = self.store.credit(&reservation.user_id, reservation.amount).await {
            // back on the ledger so a later release can refund it
            self.reservations.insert(reservation.id, reservation.clone());
            warn!(
                "Failed to refund reservation {} for user {}: {}",
                reservation.id, reservation.user_id, e
            );
            return Err(e);
        }

        telemetry::record_credits_released(reservation.amount);
        debug!(
            "Released {} credits back to user {} (job {})",
            reservation.amount, reservation.user_id, reservation.job_id
        );
        Ok(true)
    }

    /// Releases a reservation known only by id, e.g. one left behind by a lost lease.
    pub async fn release_by_id(&self, id: ReservationId) -> Result<bool, CaptureError> {
        let reservation = match self.reservations.get(&id) {
            Some(held) => held.clone(),
            None => return Ok(false),
        };
        self.release(&reservation).await
    }

    /// Whether the reservation is still held, neither settled nor released.
    pub fn is_held(&self, id: ReservationId) -> bool {
        self.reservations.contains_key(&id)
    }

    pub fn held_count(&self) -> usize {
        self.reservations.len()
    }

    pub async fn balance(&self, user_id: &str) -> Result<i64, CaptureError> {
        self.store.balance(user_id).await
    }
}
