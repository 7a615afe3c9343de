//! Periodic health checks of registered nodes
//!
//! ```text
//! Node status: active → error → active
//!
//! Transitions:
//!   active → error:   unhealthy_threshold consecutive failed pings
//!   error → active:   first successful ping
//! ```
//!
//! Ping outcomes also drive the node's circuit breaker. Nodes whose breaker is
//! open are left alone until the retry timeout elapses; then, with
//! `auto_recover` on, the monitor spends the half-open trial on a ping.

use crate::cache::ResultCache;
use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::client::NodeTransport;
use crate::config::HealthConfig;
use crate::registry::{HealthTransition, NodeRegistry};
use crate::types::{Node, NodeStatus};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, info, warn};

const MAX_CONCURRENT_PINGS: usize = 16;

/// Emitted when a node changes health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub node_id: String,
    pub node_name: String,
    pub transition: HealthTransition,
    pub consecutive_failures: u32,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of checking one node during a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Healthy,
    Unhealthy,
    /// Not pinged (breaker open or node not monitored)
    Skipped,
}

/// Summary of one health-check pass
#[derive(Debug, Clone, Default)]
pub struct CheckSummary {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub skipped: usize,
    pub events: Vec<HealthEvent>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    registry: Arc<NodeRegistry>,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<ResultCache>,
    transport: Arc<dyn NodeTransport>,
    http: reqwest::Client,
    event_tx: broadcast::Sender<HealthEvent>,
    running: RwLock<bool>,
    wake: Notify,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        registry: Arc<NodeRegistry>,
        breaker: Arc<CircuitBreaker>,
        cache: Arc<ResultCache>,
        transport: Arc<dyn NodeTransport>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            registry,
            breaker,
            cache,
            transport,
            http: reqwest::Client::new(),
            event_tx,
            running: RwLock::new(false),
            wake: Notify::new(),
        }
    }

    /// Subscribe to health events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.event_tx.subscribe()
    }

    /// Start the background task
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        *self.running.write() = true;
        let monitor = Arc::clone(&self);
        tokio::spawn(async move {
            monitor.run_loop().await;
        })
    }

    pub fn stop(&self) {
        *self.running.write() = false;
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.interval());
        info!(
            "Health monitor started with {}ms interval, unhealthy threshold: {}",
            self.config.interval_ms, self.config.unhealthy_threshold
        );

        while self.is_running() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
            if !self.is_running() {
                break;
            }

            let summary = self.check_all().await;
            let purged = self.cache.purge_expired();
            debug!(
                "Health pass: {} checked, {} healthy, {} unhealthy, {} skipped, {} cache entries purged",
                summary.checked, summary.healthy, summary.unhealthy, summary.skipped, purged
            );
        }

        info!("Health monitor stopped");
    }

    /// Ping every monitored node once
    pub async fn check_all(&self) -> CheckSummary {
        let nodes = self.registry.list(false);
        let outcomes: Vec<(PingResult, Option<HealthEvent>)> = stream::iter(nodes)
            .map(|node| self.check_node(node))
            .buffer_unordered(MAX_CONCURRENT_PINGS)
            .collect()
            .await;

        let mut summary = CheckSummary::default();
        for (result, event) in outcomes {
            match result {
                PingResult::Healthy => summary.healthy += 1,
                PingResult::Unhealthy => summary.unhealthy += 1,
                PingResult::Skipped => summary.skipped += 1,
            }
            if result != PingResult::Skipped {
                summary.checked += 1;
            }
            if let Some(event) = event {
                summary.events.push(event);
            }
        }
        summary.events.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        summary
    }

    async fn check_node(&self, node: Node) -> (PingResult, Option<HealthEvent>) {
        if !matches!(node.status, NodeStatus::Active | NodeStatus::Error) {
            return (PingResult::Skipped, None);
        }

        if self.breaker.state(&node.id) == CircuitState::Open {
            if !self.breaker.is_due_for_trial(&node.id) {
                return (PingResult::Skipped, None);
            }
            if !self.config.auto_recover {
                debug!("Breaker of node {} is due for a trial, auto recovery is off", node.id);
                return (PingResult::Skipped, None);
            }
        }
        if !self.breaker.allow(&node.id) {
            return (PingResult::Skipped, None);
        }

        let start = Instant::now();
        let success = match tokio::time::timeout(
            self.config.ping_timeout(),
            self.transport.ping(&node, self.config.ping_timeout()),
        )
        .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Ping of node {} failed: {}", node.id, e);
                false
            }
            Err(_) => {
                debug!("Ping of node {} timed out", node.id);
                false
            }
        };
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let transition = match self.registry.record_ping(&node.id, success, latency_ms) {
            Ok(t) => t,
            Err(e) => {
                warn!("Could not record ping for node {}: {}", node.id, e);
                None
            }
        };

        let event = transition.map(|t| self.emit(&node, t));
        let result = if success {
            PingResult::Healthy
        } else {
            PingResult::Unhealthy
        };
        (result, event)
    }

    fn emit(&self, node: &Node, transition: HealthTransition) -> HealthEvent {
        let consecutive_failures = self
            .registry
            .get(&node.id)
            .map(|n| n.metrics.consecutive_failures)
            .unwrap_or(0);
        let event = HealthEvent {
            node_id: node.id.clone(),
            node_name: node.name.clone(),
            transition,
            consecutive_failures,
            timestamp: Utc::now(),
        };

        let invalidated = self.cache.invalidate_node(&node.id);
        info!(
            "Node {} ({}) {}; {} cached result(s) dropped",
            node.id,
            node.name,
            transition.as_str(),
            invalidated
        );

        // No receivers is fine
        let _ = self.event_tx.send(event.clone());

        if let Some(url) = &self.config.alert_webhook_url {
            let http = self.http.clone();
            let url = url.clone();
            let payload = event.clone();
            tokio::spawn(async move {
                match http.post(&url).json(&payload).send().await {
                    Ok(resp) if resp.status().is_success() => {}
                    Ok(resp) => warn!("Alert webhook answered {}", resp.status()),
                    Err(e) => warn!("Failed to deliver health alert: {}", e),
                }
            });
        }

        event
    }
}
