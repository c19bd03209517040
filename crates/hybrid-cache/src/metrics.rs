//! Prometheus metrics for the hybrid cache.
//!
//! This module provides:
//! - Tier metrics (hits by tier, misses, local entries)
//! - Load metrics (outcome, duration, coalesced waits, bypasses)
//! - Distributed tier errors and invalidation traffic
//! - Lock and background job metrics

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Tier metrics
    pub const CACHE_HITS_TOTAL: &str = "cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "cache_misses_total";
    pub const CACHE_ENTRIES: &str = "cache_entries";

    // Load metrics
    pub const CACHE_LOADS_TOTAL: &str = "cache_loads_total";
    pub const CACHE_LOAD_DURATION_SECONDS: &str = "cache_load_duration_seconds";
    pub const CACHE_COALESCED_TOTAL: &str = "cache_coalesced_total";
    pub const CACHE_BYPASS_TOTAL: &str = "cache_bypass_total";
    pub const CACHE_DECODE_FAILURES_TOTAL: &str = "cache_decode_failures_total";

    // Distributed tier and backplane
    pub const DISTRIBUTED_ERRORS_TOTAL: &str = "cache_distributed_errors_total";
    pub const INVALIDATIONS_TOTAL: &str = "cache_invalidations_total";

    // Locks
    pub const LOCK_ATTEMPTS_TOTAL: &str = "cache_lock_attempts_total";
    pub const LOCK_HOLD_DURATION_SECONDS: &str = "cache_lock_hold_duration_seconds";
    pub const LOCK_LOST_TOTAL: &str = "cache_lock_lost_total";

    // Background dispatcher
    pub const BACKGROUND_JOBS_TOTAL: &str = "cache_background_jobs_total";
    pub const BACKGROUND_REJECTED_TOTAL: &str = "cache_background_rejected_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }

            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

fn outcome(success: bool) -> &'static str {
    if success { "success" } else { "failure" }
}

// =============================================================================
// Tier Metrics
// =============================================================================

/// Record a cache hit.
pub fn record_cache_hit(tier: &str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier.to_string()).increment(1);
}

/// Record a miss in both tiers.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Set the number of cache entries.
pub fn set_cache_entries(tier: &str, count: usize) {
    gauge!(names::CACHE_ENTRIES, "tier" => tier.to_string()).set(count as f64);
}

// =============================================================================
// Load Metrics
// =============================================================================

pub fn record_load(success: bool, duration: Duration) {
    let outcome = outcome(success);
    counter!(names::CACHE_LOADS_TOTAL, "outcome" => outcome).increment(1);
    histogram!(names::CACHE_LOAD_DURATION_SECONDS, "outcome" => outcome)
        .record(duration.as_secs_f64());
}

/// Record a caller joining a load already in flight.
pub fn record_coalesced() {
    counter!(names::CACHE_COALESCED_TOTAL).increment(1);
}

/// Record a call made with a zero TTL.
pub fn record_bypass() {
    counter!(names::CACHE_BYPASS_TOTAL).increment(1);
}

pub fn record_decode_failure() {
    counter!(names::CACHE_DECODE_FAILURES_TOTAL).increment(1);
}

// =============================================================================
// Distributed Tier Metrics
// =============================================================================

/// Record a distributed tier or backplane error.
pub fn record_distributed_error(operation: &str) {
    counter!(names::DISTRIBUTED_ERRORS_TOTAL, "operation" => operation.to_string()).increment(1);
}

/// Record an invalidation message. `direction` is `published` or `received`.
pub fn record_invalidation(direction: &'static str, scope: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "direction" => direction, "scope" => scope).increment(1);
}

// =============================================================================
// Lock Metrics
// =============================================================================

pub fn record_lock_attempt(acquired: bool) {
    let result = if acquired { "acquired" } else { "contended" };
    counter!(names::LOCK_ATTEMPTS_TOTAL, "result" => result).increment(1);
}

pub fn record_lock_hold(duration: Duration) {
    histogram!(names::LOCK_HOLD_DURATION_SECONDS).record(duration.as_secs_f64());
}

/// Record a lease that expired before its holder released it.
pub fn record_lock_lost() {
    counter!(names::LOCK_LOST_TOTAL).increment(1);
}

// =============================================================================
// Background Metrics
// =============================================================================

pub fn record_background_job(job: &str, success: bool) {
    counter!(
        names::BACKGROUND_JOBS_TOTAL,
        "job" => job.to_string(),
        "outcome" => outcome(success)
    )
    .increment(1);
}

/// Record a job rejected because the queue was full.
pub fn record_background_rejected() {
    counter!(names::BACKGROUND_REJECTED_TOTAL).increment(1);
}
