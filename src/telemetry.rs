//! Metric names and recording helpers
//!
//! Everything goes through the `metrics` facade; without an installed
//! recorder the calls are no-ops, which is what the tests rely on.

use crate::queue::QueueStats;
use crate::CaptureError;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Once;
use std::time::Duration;
use tracing::info;

pub const JOBS_SUBMITTED: &str = "capture_jobs_submitted_total";
pub const JOBS_REJECTED: &str = "capture_jobs_rejected_total";
pub const JOBS_COMPLETED: &str = "capture_jobs_completed_total";
pub const JOBS_FAILED: &str = "capture_jobs_failed_total";
pub const JOBS_RETRIED: &str = "capture_jobs_retried_total";
pub const JOBS_DEAD_LETTERED: &str = "capture_jobs_dead_lettered_total";
pub const RENDER_DURATION: &str = "capture_render_duration_seconds";
pub const QUEUE_DEPTH: &str = "capture_queue_depth";
pub const QUEUE_IN_FLIGHT: &str = "capture_queue_in_flight";
pub const POOL_BUSY: &str = "capture_browser_pool_busy";
pub const POOL_UTILIZATION: &str = "capture_browser_pool_utilization";
pub const BROWSERS_RECYCLED: &str = "capture_browsers_recycled_total";
pub const CREDITS_SETTLED: &str = "capture_credits_settled_total";
pub const CREDITS_RELEASED: &str = "capture_credits_released_total";
pub const WEBHOOKS_DELIVERED: &str = "capture_webhooks_delivered_total";
pub const WEBHOOKS_FAILED: &str = "capture_webhooks_failed_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Installs the Prometheus recorder and its scrape endpoint on `addr`.
/// Must be called from within a tokio runtime.
pub fn install_prometheus_exporter(addr: SocketAddr) -> Result<(), CaptureError> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| CaptureError::Configuration(format!("metrics exporter: {e}")))?;

    describe_metrics();
    info!("Prometheus metrics available on http://{}/metrics", addr);
    Ok(())
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(JOBS_SUBMITTED, Unit::Count, "Jobs accepted onto the queue.");
        describe_counter!(
            JOBS_REJECTED,
            Unit::Count,
            "Submissions refused before enqueue, by reason."
        );
        describe_counter!(JOBS_COMPLETED, Unit::Count, "Jobs that reached COMPLETED.");
        describe_counter!(JOBS_FAILED, Unit::Count, "Jobs that reached FAILED, by reason.");
        describe_counter!(JOBS_RETRIED, Unit::Count, "Attempts scheduled for retry.");
        describe_counter!(
            JOBS_DEAD_LETTERED,
            Unit::Count,
            "Messages moved to the dead-letter store."
        );
        describe_histogram!(
            RENDER_DURATION,
            Unit::Seconds,
            "Wall time of successful captures."
        );
        describe_gauge!(QUEUE_DEPTH, Unit::Count, "Messages waiting to be leased.");
        describe_gauge!(QUEUE_IN_FLIGHT, Unit::Count, "Messages currently leased.");
        describe_gauge!(POOL_BUSY, Unit::Count, "Browser contexts lent to workers.");
        describe_gauge!(
            POOL_UTILIZATION,
            Unit::Percent,
            "Share of browser contexts lent to workers."
        );
        describe_counter!(
            BROWSERS_RECYCLED,
            Unit::Count,
            "Browser contexts destroyed and replaced, by cause."
        );
        describe_counter!(CREDITS_SETTLED, Unit::Count, "Credits permanently consumed.");
        describe_counter!(CREDITS_RELEASED, Unit::Count, "Credits refunded to users.");
        describe_counter!(WEBHOOKS_DELIVERED, Unit::Count, "Webhooks answered with 2xx.");
        describe_counter!(WEBHOOKS_FAILED, Unit::Count, "Webhooks that failed or timed out.");
    });
}

pub fn record_job_submitted() {
    counter!(JOBS_SUBMITTED).increment(1);
}

pub fn record_job_rejected(reason: &'static str) {
    counter!(JOBS_REJECTED, "reason" => reason).increment(1);
}

pub fn record_job_completed(duration: Duration) {
    counter!(JOBS_COMPLETED).increment(1);
    histogram!(RENDER_DURATION).record(duration.as_secs_f64());
}

pub fn record_job_failed(reason: &'static str) {
    counter!(JOBS_FAILED, "reason" => reason).increment(1);
}

pub fn record_job_retried() {
    counter!(JOBS_RETRIED).increment(1);
}

pub fn record_job_dead_lettered() {
    counter!(JOBS_DEAD_LETTERED).increment(1);
}

pub fn record_queue_depth(stats: &QueueStats) {
    gauge!(QUEUE_DEPTH).set((stats.ready + stats.delayed) as f64);
    gauge!(QUEUE_IN_FLIGHT).set(stats.in_flight as f64);
}

pub fn record_pool_usage(busy: usize, capacity: usize) {
    gauge!(POOL_BUSY).set(busy as f64);
    if capacity > 0 {
        gauge!(POOL_UTILIZATION).set((busy as f64 / capacity as f64) * 100.0);
    }
}

pub fn record_browser_recycled(cause: &'static str) {
    counter!(BROWSERS_RECYCLED, "cause" => cause).increment(1);
}

pub fn record_credits_settled(amount: i64) {
    counter!(CREDITS_SETTLED).increment(amount.max(0) as u64);
}

pub fn record_credits_released(amount: i64) {
    counter!(CREDITS_RELEASED).increment(amount.max(0) as u64);
}

pub fn record_webhook(delivered: bool) {
    if delivered {
        counter!(WEBHOOKS_DELIVERED).increment(1);
    } else {
        counter!(WEBHOOKS_FAILED).increment(1);
    }
}
