//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Source and store connection status
//! - Per-stream event flow (received, skipped, committed)
//! - Checkpoint position
//! - Trigger failures and paused streams
//! - Circuit breaker and backoff activity
//!
//! No exporter is installed by this crate; without a recorder the macros
//! are no-ops.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use directory_replicator::metrics;
//! use std::time::Duration;
//!
//! metrics::record_events_received("people", 1);
//! metrics::record_commit("people", "applied", Duration::from_millis(3));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Connection Metrics
// =============================================================================

/// Record a connection attempt against a backend.
pub fn record_connection(name: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_connections_total", "backend" => name.to_string(), "status" => status).increment(1);
}

/// Record backend connection state (1 for the current state).
pub fn record_connection_state(name: &str, state: &str) {
    gauge!("replicator_connection_state", "backend" => name.to_string(), "state" => state.to_string()).set(1.0);
}

/// Record a store retry after a busy/locked response.
pub fn record_store_retry(backend: &str, operation: &str) {
    counter!(
        "replicator_store_retries_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

// =============================================================================
// Stream Metrics
// =============================================================================

/// Record events received from the feed.
pub fn record_events_received(consumer_id: &str, count: usize) {
    counter!("replicator_events_received_total", "consumer_id" => consumer_id.to_string()).increment(count as u64);
}

/// Record events dropped before the pipeline (replayed or out of scope).
pub fn record_events_skipped(consumer_id: &str, reason: &str) {
    counter!(
        "replicator_events_skipped_total",
        "consumer_id" => consumer_id.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record write intents produced per committed batch.
pub fn record_batch(consumer_id: &str, events: usize, intents: usize) {
    histogram!("replicator_batch_events", "consumer_id" => consumer_id.to_string()).record(events as f64);
    histogram!("replicator_batch_intents", "consumer_id" => consumer_id.to_string()).record(intents as f64);
}

/// Record a checkpoint commit outcome and its latency.
pub fn record_commit(consumer_id: &str, outcome: &str, duration: Duration) {
    counter!(
        "replicator_commits_total",
        "consumer_id" => consumer_id.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!("replicator_commit_duration_seconds", "consumer_id" => consumer_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record the committed checkpoint position.
pub fn record_checkpoint(consumer_id: &str, sequence_number: u64) {
    gauge!("replicator_checkpoint_sequence", "consumer_id" => consumer_id.to_string()).set(sequence_number as f64);
}

/// Record a trigger pipeline failure (stream pauses).
pub fn record_trigger_error(consumer_id: &str, stage_id: &str) {
    counter!(
        "replicator_trigger_errors_total",
        "consumer_id" => consumer_id.to_string(),
        "stage" => stage_id.to_string()
    )
    .increment(1);
}

/// Record a change log gap (entries trimmed before replication).
pub fn record_sequence_gap(consumer_id: &str) {
    counter!("replicator_sequence_gaps_total", "consumer_id" => consumer_id.to_string()).increment(1);
}

/// Record a backoff period before reconnecting.
pub fn record_backoff(consumer_id: &str, attempt: usize, delay: Duration) {
    counter!("replicator_backoffs_total", "consumer_id" => consumer_id.to_string()).increment(1);
    gauge!("replicator_backoff_attempt", "consumer_id" => consumer_id.to_string()).set(attempt as f64);
    histogram!("replicator_backoff_delay_seconds", "consumer_id" => consumer_id.to_string())
        .record(delay.as_secs_f64());
}

/// Gauge for stream health (0=connecting, 1=streaming, 2=backoff, 3=paused, 4=failed, 5=stopped).
pub fn set_stream_state(consumer_id: &str, state: &str) {
    let value = match state {
        "connecting" => 0.0,
        "streaming" => 1.0,
        "backoff" => 2.0,
        "paused" => 3.0,
        "failed" => 4.0,
        "stopped" => 5.0,
        _ => -1.0,
    };
    gauge!("replicator_stream_state", "consumer_id" => consumer_id.to_string()).set(value);
}

/// Gauge for number of registered streams.
pub fn set_active_streams(count: usize) {
    gauge!("replicator_active_streams").set(count as f64);
}

// =============================================================================
// Circuit Breaker Metrics
// =============================================================================

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replicator_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
