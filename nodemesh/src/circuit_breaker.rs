//! Per-node circuit breakers
//!
//! Every remote call is gated by the breaker of its target node:
//!
//! ```text
//! States: Closed → Open → HalfOpen → Closed
//!
//! Transitions:
//!   closed → open:      failure count reaches failure_threshold
//!   open → half-open:   retry_timeout elapsed, on the next allow()
//!   half-open → closed: success count reaches success_threshold
//!   half-open → open:   any failure
//! ```
//!
//! In half-open only one trial call is let through at a time. State lives in
//! a sharded map keyed by node id, so each update holds only that node's shard
//! lock and two racing outcomes for the same node cannot lose an update.

use crate::config::CircuitBreakerConfig;
use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// When the outstanding half-open trial was granted
    trial_started: Option<Instant>,
    state_since: Instant,
    last_transition: DateTime<Utc>,
    total_successes: u64,
    total_failures: u64,
    rejected: u64,
    trips: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            trial_started: None,
            state_since: Instant::now(),
            last_transition: Utc::now(),
            total_successes: 0,
            total_failures: 0,
            rejected: 0,
            trips: 0,
        }
    }

    fn transition(&mut self, node_id: &str, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.state_since = Instant::now();
        self.last_transition = Utc::now();
        self.trial_started = None;
        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open => {
                self.success_count = 0;
                self.trips += 1;
            }
            CircuitState::HalfOpen => {
                self.success_count = 0;
            }
        }

        metrics::record_breaker_transition(node_id, to.as_str());
        match to {
            CircuitState::Open => warn!(
                "Circuit for node {} opened ({} -> open) after {} failure(s)",
                node_id,
                from.as_str(),
                self.failure_count
            ),
            _ => info!(
                "Circuit for node {} transitioned {} -> {}",
                node_id,
                from.as_str(),
                to.as_str()
            ),
        }
    }

    fn trial_in_flight(&self, retry_timeout: Duration) -> bool {
        self.trial_started
            .map(|t| t.elapsed() < retry_timeout)
            .unwrap_or(false)
    }
}

/// Operator-facing view of one breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatistics {
    pub node_id: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds until an open breaker admits a trial call
    pub retry_in_ms: Option<u64>,
    pub last_transition: DateTime<Utc>,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected: u64,
    pub trips: u64,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub retry_timeout_ms: u64,
}

/// Circuit breakers for all nodes, keyed by node id
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Decide whether a call to `node_id` may proceed.
    ///
    /// Takes the half-open trial slot when it grants a trial, so callers must
    /// report the outcome with [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow(&self, node_id: &str) -> bool {
        let retry_timeout = self.config.retry_timeout();
        let mut entry = self
            .states
            .entry(node_id.to_string())
            .or_insert_with(BreakerState::new);
        let state = entry.value_mut();

        let allowed = match state.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                if state.state_since.elapsed() >= retry_timeout {
                    state.transition(node_id, CircuitState::HalfOpen);
                    state.trial_started = Some(Instant::now());
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight(retry_timeout) {
                    false
                } else {
                    state.trial_started = Some(Instant::now());
                    true
                }
            }
        };

        if !allowed {
            state.rejected += 1;
        }
        allowed
    }

    /// Side-effect-free version of [`allow`](Self::allow)
    pub fn is_available(&self, node_id: &str) -> bool {
        let retry_timeout = self.config.retry_timeout();
        match self.states.get(node_id) {
            None => true,
            Some(state) => match state.state {
                CircuitState::Closed => true,
                CircuitState::Open => state.state_since.elapsed() >= retry_timeout,
                CircuitState::HalfOpen => !state.trial_in_flight(retry_timeout),
            },
        }
    }

    /// Current state, `Closed` for nodes never seen
    pub fn state(&self, node_id: &str) -> CircuitState {
        self.states
            .get(node_id)
            .map(|s| s.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Whether the breaker is open and its retry timeout has elapsed
    pub fn is_due_for_trial(&self, node_id: &str) -> bool {
        self.states
            .get(node_id)
            .map(|s| {
                s.state == CircuitState::Open
                    && s.state_since.elapsed() >= self.config.retry_timeout()
            })
            .unwrap_or(false)
    }

    pub fn record_success(&self, node_id: &str) {
        let mut entry = self
            .states
            .entry(node_id.to_string())
            .or_insert_with(BreakerState::new);
        let state = entry.value_mut();
        state.total_successes += 1;

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                state.trial_started = None;
                if state.success_count >= self.config.success_threshold {
                    state.transition(node_id, CircuitState::Closed);
                }
            }
            // Late answer from a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, node_id: &str) {
        let mut entry = self
            .states
            .entry(node_id.to_string())
            .or_insert_with(BreakerState::new);
        let state = entry.value_mut();
        state.total_failures += 1;

        match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.transition(node_id, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                state.failure_count += 1;
                state.transition(node_id, CircuitState::Open);
            }
            CircuitState::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Administrative override: force the breaker closed
    pub fn reset(&self, node_id: &str) {
        let mut entry = self
            .states
            .entry(node_id.to_string())
            .or_insert_with(BreakerState::new);
        let state = entry.value_mut();
        if state.state != CircuitState::Closed {
            state.transition(node_id, CircuitState::Closed);
        }
        state.failure_count = 0;
        state.success_count = 0;
        info!("Circuit for node {} reset by operator", node_id);
    }

    /// Forget a node's breaker
    pub fn remove(&self, node_id: &str) {
        self.states.remove(node_id);
    }

    pub fn statistics(&self, node_id: &str) -> BreakerStatistics {
        match self.states.get(node_id) {
            Some(state) => self.build_statistics(node_id, &state),
            None => self.build_statistics(node_id, &BreakerState::new()),
        }
    }

    /// Statistics for every node with a breaker, sorted by node id
    pub fn all_statistics(&self) -> Vec<BreakerStatistics> {
        let mut stats: Vec<BreakerStatistics> = self
            .states
            .iter()
            .map(|entry| self.build_statistics(entry.key(), entry.value()))
            .collect();
        stats.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        stats
    }

    fn build_statistics(&self, node_id: &str, state: &BreakerState) -> BreakerStatistics {
        let retry_in_ms = match state.state {
            CircuitState::Open => Some(
                self.config
                    .retry_timeout()
                    .saturating_sub(state.state_since.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerStatistics {
            node_id: node_id.to_string(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            retry_in_ms,
            last_transition: state.last_transition,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            rejected: state.rejected,
            trips: state.trips,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            retry_timeout_ms: self.config.retry_timeout_ms,
        }
    }
}
