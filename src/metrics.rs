//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for the write path, the pull
//! protocol (both sides), timeout degradation, and upstream-reset
//! detection.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replicator_` and follow Prometheus
//! conventions: counters end in `_total`, gauges represent current state,
//! histograms track distributions. Per-database series carry a `db` label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed write and its latency.
pub fn record_write(db: &str, success: bool, latency: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replicator_writes_total", "db" => db.to_string(), "status" => status).increment(1);
    histogram!("replicator_write_duration_seconds", "db" => db.to_string())
        .record(latency.as_secs_f64());
}

/// Record a write rejected because the database is not a leader.
pub fn record_write_rejected(db: &str) {
    counter!("replicator_writes_rejected_total", "db" => db.to_string()).increment(1);
}

/// Record a mode-2 write that expired waiting for a follower ack.
pub fn record_write_ack_timeout(db: &str) {
    counter!("replicator_write_ack_timeouts_total", "db" => db.to_string()).increment(1);
}

/// Record a leader entering the degraded write-ack timeout.
pub fn record_degradation_entered(db: &str) {
    counter!("replicator_ack_timeout_degraded_total", "db" => db.to_string()).increment(1);
}

/// Record a leader recovering to the normal write-ack timeout.
pub fn record_degradation_recovered(db: &str) {
    counter!("replicator_ack_timeout_recovered_total", "db" => db.to_string()).increment(1);
}

/// Record one pull attempt by outcome ("success", "failure", "no_updates").
pub fn record_pull(db: &str, outcome: &str) {
    counter!("replicator_pulls_total", "db" => db.to_string(), "outcome" => outcome.to_string())
        .increment(1);
}

/// Record round-trip latency of one pull call.
pub fn record_pull_latency(db: &str, latency: Duration) {
    histogram!("replicator_pull_duration_seconds", "db" => db.to_string())
        .record(latency.as_secs_f64());
}

/// Record an empty pull answered by a non-leader upstream.
pub fn record_pull_from_non_leader(db: &str) {
    counter!("replicator_pulls_from_non_leader_total", "db" => db.to_string()).increment(1);
}

/// Record operations applied from upstream batches.
pub fn record_updates_applied(db: &str, ops: u64) {
    counter!("replicator_updates_applied_total", "db" => db.to_string()).increment(ops);
}

/// Record operations served to a downstream peer.
pub fn record_updates_served(db: &str, ops: u64) {
    counter!("replicator_updates_served_total", "db" => db.to_string()).increment(ops);
}

/// Record time spent serving one inbound pull (including long-poll wait).
pub fn record_serve_latency(db: &str, latency: Duration) {
    histogram!("replicator_serve_duration_seconds", "db" => db.to_string())
        .record(latency.as_secs_f64());
}

/// Record an inbound pull for a database this host does not have.
pub fn record_serve_miss(db: &str) {
    counter!("replicator_serve_misses_total", "db" => db.to_string()).increment(1);
}

/// Record an inbound pull from an observer peer.
pub fn record_observer_request(db: &str) {
    counter!("replicator_observer_requests_total", "db" => db.to_string()).increment(1);
}

/// Record an upstream reset attempt.
pub fn record_upstream_reset_attempt(db: &str) {
    counter!("replicator_upstream_reset_attempts_total", "db" => db.to_string()).increment(1);
}

/// Record a new outbound peer connection.
pub fn record_client_connection(peer: &str) {
    counter!("replicator_client_connections_total", "peer" => peer.to_string()).increment(1);
}

/// Current number of registered databases.
pub fn set_registered_dbs(count: usize) {
    gauge!("replicator_registered_dbs").set(count as f64);
}
