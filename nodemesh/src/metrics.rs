//! Observability metrics
//!
//! Prometheus-compatible metrics (through the `metrics` facade) for:
//! - Outbound node calls (duration, success, errors)
//! - Circuit breaker state and transitions
//! - Node health
//! - Result cache hits and misses
//! - Transactions needing manual intervention

use std::time::{Duration, Instant};

/// Record outbound call duration
pub fn record_rpc_duration(method: &str, target_node: &str, duration: Duration) {
    metrics::histogram!(
        "nodemesh_rpc_duration_seconds",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Record outbound call success
pub fn record_rpc_success(method: &str, target_node: &str) {
    metrics::counter!(
        "nodemesh_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "ok",
    )
    .increment(1);
}

/// Record outbound call error
pub fn record_rpc_error(method: &str, target_node: &str, error_type: &str) {
    metrics::counter!(
        "nodemesh_rpc_requests_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "nodemesh_rpc_errors_total",
        "method" => method.to_string(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record a call skipped because the node's breaker denied it
pub fn record_rpc_skipped(method: &str, target_node: &str) {
    metrics::counter!(
        "nodemesh_rpc_skipped_total",
        "method" => method.to_string(),
        "target_node" => target_node.to_string(),
    )
    .increment(1);
}

/// Record a circuit breaker state change
pub fn record_breaker_transition(node_id: &str, to_state: &str) {
    metrics::counter!(
        "nodemesh_circuit_breaker_transitions_total",
        "node" => node_id.to_string(),
        "to" => to_state.to_string(),
    )
    .increment(1);

    let value = match to_state {
        "closed" => 0.0,
        "half_open" => 1.0,
        _ => 2.0,
    };
    metrics::gauge!(
        "nodemesh_circuit_breaker_state",
        "node" => node_id.to_string(),
    )
    .set(value);
}

/// Update node health gauge
pub fn update_node_health(node_id: &str, healthy: bool) {
    metrics::gauge!(
        "nodemesh_node_healthy",
        "node" => node_id.to_string(),
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record node response time as seen by pings
pub fn record_ping(node_id: &str, success: bool, latency: Duration) {
    let status = if success { "ok" } else { "error" };
    metrics::counter!(
        "nodemesh_health_pings_total",
        "node" => node_id.to_string(),
        "status" => status,
    )
    .increment(1);

    if success {
        metrics::histogram!(
            "nodemesh_health_ping_seconds",
            "node" => node_id.to_string(),
        )
        .record(latency.as_secs_f64());
    }
}

/// Record registered node count by status
pub fn record_registered_nodes(active: usize, total: usize) {
    metrics::gauge!("nodemesh_nodes_active").set(active as f64);
    metrics::gauge!("nodemesh_nodes_total").set(total as f64);
}

/// Record result cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("nodemesh_search_cache_lookups_total", "result" => result).increment(1);
}

/// Record a completed federated search
pub fn record_federated_search(nodes_searched: usize, failed: usize, duration: Duration) {
    metrics::histogram!("nodemesh_federated_search_seconds").record(duration.as_secs_f64());
    metrics::histogram!("nodemesh_federated_search_nodes").record(nodes_searched as f64);
    if failed > 0 {
        metrics::counter!("nodemesh_federated_search_partial_total").increment(1);
    }
}

/// Record a transaction outcome
pub fn record_transaction(outcome: &str) {
    metrics::counter!(
        "nodemesh_transactions_total",
        "outcome" => outcome.to_string(),
    )
    .increment(1);
}

/// Record an inbound request rejected by the rate limiter
pub fn record_rate_limited(principal: &str) {
    metrics::counter!(
        "nodemesh_rate_limited_total",
        "principal" => principal.to_string(),
    )
    .increment(1);
}

/// Timer for outbound calls that records duration and outcome
pub struct RpcTimer {
    method: &'static str,
    target_node: String,
    start: Instant,
}

impl RpcTimer {
    pub fn new(method: &'static str, target_node: &str) -> Self {
        Self {
            method,
            target_node: target_node.to_string(),
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish with success
    pub fn success(self) -> Duration {
        let elapsed = self.start.elapsed();
        record_rpc_duration(self.method, &self.target_node, elapsed);
        record_rpc_success(self.method, &self.target_node);
        elapsed
    }

    /// Finish with error
    pub fn error(self, error_type: &str) -> Duration {
        let elapsed = self.start.elapsed();
        record_rpc_duration(self.method, &self.target_node, elapsed);
        record_rpc_error(self.method, &self.target_node, error_type);
        elapsed
    }
}
