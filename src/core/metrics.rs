// src/core/metrics.rs

//! Defines and registers Prometheus metrics for the fetch pipeline.
//!
//! Uses `lazy_static` so metrics are registered exactly once globally, the
//! same convention used throughout this family of services.

use lazy_static::lazy_static;
use prometheus::{Counter, CounterVec, Histogram, TextEncoder, register_counter, register_counter_vec, register_histogram};

lazy_static! {
    /// Total fetches that completed via the FETCH path (cache admission).
    pub static ref FETCH_COMPLETED_TOTAL: Counter =
        register_counter!("ferrocache_fetch_completed_total", "Fetches that reached DONE via FETCH.").unwrap();

    /// Total fetches that completed via CONDFETCH (304 revalidation).
    pub static ref FETCH_CONDFETCH_TOTAL: Counter =
        register_counter!("ferrocache_fetch_condfetch_total", "Fetches that reached DONE via CONDFETCH.").unwrap();

    /// Total fetches that ended in the ERROR state (503 synthesis).
    pub static ref FETCH_ERROR_TOTAL: Counter =
        register_counter!("ferrocache_fetch_error_total", "Fetches that ended in ERROR.").unwrap();

    /// Total fetches abandoned by VCL policy before the request was sent.
    pub static ref FETCH_ABANDONED_TOTAL: Counter =
        register_counter!("ferrocache_fetch_abandoned_total", "Fetches abandoned by backend_fetch policy.").unwrap();

    /// Transport-level "recycled connection lost" retries (not counted against max_retries).
    pub static ref BACKEND_RETRY_TOTAL: Counter =
        register_counter!("ferrocache_backend_retry_total", "Transparent retries after a lost recycled connection.").unwrap();

    /// Policy-driven RETRY transitions, broken down by outcome.
    pub static ref POLICY_RETRY_TOTAL: CounterVec = register_counter_vec!(
        "ferrocache_policy_retry_total",
        "VCL backend_response RETRY transitions.",
        &["outcome"]
    )
    .unwrap();

    /// ESI parse errors (malformed match-table state, carry-buffer overflow).
    pub static ref ESI_PARSE_ERROR_TOTAL: Counter =
        register_counter!("ferrocache_esi_parse_error_total", "ESI parser errors.").unwrap();

    /// Storage allocation refusals that triggered a transient-storage salvage attempt.
    pub static ref STORAGE_SALVAGE_TOTAL: Counter =
        register_counter!("ferrocache_storage_salvage_total", "Times the primary storage allocator was refused and transient storage was tried.").unwrap();

    /// Latency of a full fetch, from MKBEREQ to DONE.
    pub static ref FETCH_LATENCY_SECONDS: Histogram =
        register_histogram!("ferrocache_fetch_latency_seconds", "End-to-end fetch latency in seconds.").unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
