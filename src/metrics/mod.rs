//! Prometheus metrics for lease coordination
//!
//! This module tracks:
//! - Claims: attempts, successes and conflicts per platform
//! - Leases: heartbeats, ownership loss, store failures
//! - Processing: error reports and escalations, owned units per platform
//! - Read API: request counts and latency
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all lease metrics
struct LeaseMetrics {
    claims: CounterVec,
    heartbeats: CounterVec,
    ownership_lost: CounterVec,
    store_failures: CounterVec,
    processing_errors: CounterVec,
    escalations: CounterVec,
    owned_units: GaugeVec,
    api_requests: CounterVec,
    api_duration: HistogramVec,
}

/// Global storage for lease metrics
static LEASE_METRICS: OnceLock<LeaseMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// If metric registration fails, errors are returned and subsequent metric
/// operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = collector_lease::metrics::init_metrics() {
///     eprintln!("Warning: Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let metrics = LeaseMetrics {
        claims: register_counter_vec!(
            "collector_lease_claims_total",
            "Claim attempts by platform and outcome (claimed, conflict, failed)",
            &["platform", "outcome"]
        )?,
        heartbeats: register_counter_vec!(
            "collector_lease_heartbeats_total",
            "Heartbeats by outcome (ok, lost, failed)",
            &["outcome"]
        )?,
        ownership_lost: register_counter_vec!(
            "collector_lease_ownership_lost_total",
            "Units whose ownership was lost mid-session",
            &["platform"]
        )?,
        store_failures: register_counter_vec!(
            "collector_lease_store_failures_total",
            "Store calls that failed or timed out",
            &["operation"]
        )?,
        processing_errors: register_counter_vec!(
            "collector_lease_processing_errors_total",
            "Processing errors reported by collectors",
            &["platform"]
        )?,
        escalations: register_counter_vec!(
            "collector_lease_escalations_total",
            "Units parked in error status after reaching the threshold",
            &["platform"]
        )?,
        owned_units: register_gauge_vec!(
            "collector_lease_owned_units",
            "Units currently held by this instance",
            &["platform"]
        )?,
        api_requests: register_counter_vec!(
            "collector_lease_api_requests_total",
            "Total API requests by endpoint and status",
            &["endpoint", "status"]
        )?,
        api_duration: register_histogram_vec!(
            "collector_lease_api_request_duration_seconds",
            "API request duration in seconds",
            &["endpoint"],
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]
        )?,
    };

    LEASE_METRICS
        .set(metrics)
        .map_err(|_| "Lease metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    LEASE_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record the outcome of a claim attempt
pub fn record_claim(platform: &str, outcome: &str) {
    if let Some(m) = LEASE_METRICS.get() {
        m.claims.with_label_values(&[platform, outcome]).inc();
    }
}

/// Record a heartbeat outcome
pub fn record_heartbeat(outcome: &str) {
    if let Some(m) = LEASE_METRICS.get() {
        m.heartbeats.with_label_values(&[outcome]).inc();
    }
}

/// Record a unit lost to another instance or to expiry
pub fn record_ownership_lost(platform: &str) {
    if let Some(m) = LEASE_METRICS.get() {
        m.ownership_lost.with_label_values(&[platform]).inc();
    }
}

/// Record a store call that failed or timed out
pub fn record_store_failure(operation: &str) {
    if let Some(m) = LEASE_METRICS.get() {
        m.store_failures.with_label_values(&[operation]).inc();
    }
}

/// Record a processing error and whether it escalated the unit
pub fn record_processing_error(platform: &str, escalated: bool) {
    let Some(m) = LEASE_METRICS.get() else {
        return;
    };

    m.processing_errors.with_label_values(&[platform]).inc();
    if escalated {
        m.escalations.with_label_values(&[platform]).inc();
    }
}

/// Update the owned-units gauge
pub fn set_owned_units(platform: &str, count: usize) {
    if let Some(m) = LEASE_METRICS.get() {
        m.owned_units.with_label_values(&[platform]).set(count as f64);
    }
}

/// Record API request
pub fn record_api_request(endpoint: &str, status: u16, duration_secs: f64) {
    let Some(m) = LEASE_METRICS.get() else {
        return;
    };

    let status_str = status.to_string();
    m.api_requests
        .with_label_values(&[endpoint, &status_str])
        .inc();
    m.api_duration
        .with_label_values(&[endpoint])
        .observe(duration_secs);
}

// ============================================================================
// Tests
// ============================================================================
