//! Cluster plane observability metrics
//!
//! Prometheus-compatible series for the write path, the close protocol,
//! peer discovery and broadcast fan-outs.

use std::time::Instant;

/// Record one dispatch attempt of a per-shard write batch
pub fn record_dispatch_attempt(attempt: u32) {
    metrics::counter!(
        "basalt_dispatch_attempts_total",
        "attempt" => attempt.to_string(),
    )
    .increment(1);
}

/// Record a write-path retry caused by a temporary error
pub fn record_dispatch_retry(error_type: &str) {
    metrics::counter!(
        "basalt_dispatch_retries_total",
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record rows written and rows failed by one statement
pub fn record_dispatch_rows(successes: u64, failures: u64) {
    metrics::counter!("basalt_dispatch_rows_total", "outcome" => "success")
        .increment(successes);
    metrics::counter!("basalt_dispatch_rows_total", "outcome" => "failure")
        .increment(failures);
}

/// Record a close protocol step outcome
pub fn record_close_step(step: &str, outcome: &str) {
    metrics::counter!(
        "basalt_close_steps_total",
        "step" => step.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Record a peer probe result
pub fn record_peer_probe(outcome: &str) {
    metrics::counter!(
        "basalt_discovery_probes_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Update the known master-eligible peer count
pub fn update_known_peers(count: usize) {
    metrics::gauge!("basalt_discovery_known_peers").set(count as f64);
}

/// Record the outcome counts of one broadcast fan-out
pub fn record_broadcast(action: &str, successes: u32, failures: u32, unavailable: u32) {
    metrics::counter!(
        "basalt_broadcast_shards_total",
        "action" => action.to_string(),
        "outcome" => "success",
    )
    .increment(successes as u64);
    metrics::counter!(
        "basalt_broadcast_shards_total",
        "action" => action.to_string(),
        "outcome" => "failure",
    )
    .increment(failures as u64);
    metrics::counter!(
        "basalt_broadcast_shards_total",
        "action" => action.to_string(),
        "outcome" => "unavailable",
    )
    .increment(unavailable as u64);
}

/// Update the applied cluster-state version gauge
pub fn update_cluster_state_version(version: u64) {
    metrics::gauge!("basalt_cluster_state_version").set(version as f64);
}

/// Guard timing a transport action
pub struct ActionTimer {
    action: String,
    target_node: String,
    start: Instant,
}

impl ActionTimer {
    pub fn new(action: &str, target_node: &str) -> Self {
        Self {
            action: action.to_string(),
            target_node: target_node.to_string(),
            start: Instant::now(),
        }
    }

    pub fn success(self) {
        self.record("ok");
    }

    pub fn error(self, error_type: &str) {
        metrics::counter!(
            "basalt_transport_errors_total",
            "action" => self.action.clone(),
            "error_type" => error_type.to_string(),
        )
        .increment(1);
        self.record("error");
    }

    fn record(self, status: &'static str) {
        metrics::histogram!(
            "basalt_transport_duration_seconds",
            "action" => self.action.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());
        metrics::counter!(
            "basalt_transport_requests_total",
            "action" => self.action,
            "target_node" => self.target_node,
            "status" => status,
        )
        .increment(1);
    }
}
