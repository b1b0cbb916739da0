//! # Capture Scheduler
//!
//! Asynchronous web capture pipeline: callers submit requests to render a
//! page into an image or PDF, and a fixed set of worker loops executes them
//! against a bounded pool of headless Chrome instances, under per-user credit
//! and rate limits.
//!
//! ## Pipeline
//!
//! ```text
//! submit ─► JobQueue ─► worker: lease ─► CreditGuard::reserve ─► BrowserPool::acquire
//!                                    ─► JobExecutor::execute ─► settle / release
//!                                    ─► acknowledge / requeue / dead-letter ─► webhook
//! ```
//!
//! - **Job Queue**: lease-based, at-least-once. Unacknowledged leases lapse
//!   back to visibility after the visibility timeout.
//! - **Browser Pool**: fixed capacity, `acquire(timeout)` / `release(handle, healthy)`.
//!   Unhealthy and long-idle browsers are destroyed and replaced in place.
//! - **Credit Guard**: atomic reserve, then exactly one of settle or release.
//! - **Workers**: transient render failures are retried with exponential
//!   backoff up to `max_attempts`, then dead-lettered as `max_retries_exceeded`.
//! - **Notifications**: single-attempt webhook, off the settlement path.
//!
//! ## Job lifecycle
//!
//! | From | To | When |
//! |------|----|------|
//! | `queued` | `processing` | a worker leases the message |
//! | `processing` | `queued` | retryable failure or resource shortage |
//! | `processing` | `completed` | artifact uploaded, credits settled |
//! | `processing` | `failed` | permanent failure, no credit, or retries exhausted |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use capture_scheduler::{compose, CaptureRequest, Collaborators, Config, InMemoryCreditStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let credits = Arc::new(InMemoryCreditStore::new());
//!     credits.set_balance("alice", 10);
//!
//!     let collaborators = Collaborators::production(&config, credits)?;
//!     let mut system = compose(config, collaborators).await?;
//!     system.start();
//!
//!     let id = system
//!         .service
//!         .submit(CaptureRequest {
//!             user_id: "alice".to_string(),
//!             url: "https://example.com".to_string(),
//!             options: Default::default(),
//!             webhook_url: None,
//!         })
//!         .await?;
//!     println!("{:?}", system.service.status(id, "alice").await?);
//!
//!     system.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ```bash
//! capture-scheduler --pool-size 2 run --input jobs.jsonl --credits alice=10
//! capture-scheduler validate --config scheduler.json
//! ```

/// Configuration and settings for the scheduler
pub mod config;

/// Error taxonomy shared by every component
pub mod error;

/// Jobs, their state machine and the job store
pub mod job;

/// Lease-based job queue backends
pub mod queue;

/// Browser pool management for concurrent rendering contexts
pub mod browser_pool;

/// Chrome implementation of the rendering context
pub mod chrome;

/// Credit reservation and usage accounting
pub mod credits;

/// Per-user submission rate limiting
pub mod ratelimit;

/// Artifact storage
pub mod storage;

/// Single-attempt render execution
pub mod executor;

/// Webhook notifications
pub mod notify;

/// Worker loops and the worker pool
pub mod worker;

/// Submission API and component wiring
pub mod service;

/// Metrics recording and export
pub mod telemetry;

/// Command-line interface implementation
pub mod cli;

/// Utility functions and helpers
pub mod utils;


pub use browser_pool::*;
pub use chrome::*;
pub use cli::*;
pub use config::*;
pub use credits::*;
pub use error::*;
pub use executor::*;
pub use job::*;
pub use notify::*;
pub use queue::*;
pub use ratelimit::*;
pub use service::*;
pub use storage::*;
pub use utils::*;
pub use worker::*;
