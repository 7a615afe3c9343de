//! Node registry
//!
//! Holds every node ever registered. Records are never deleted: retiring a
//! node sets `retired_at` and keeps the record for audit.
//!
//! Hot-path readers use [`NodeRegistry::active`], which serves a shared
//! snapshot of the active set. The snapshot is rebuilt after its TTL or after
//! any structural write (registration, update, status change).

use crate::auth::{constant_time_eq, generate_secret, hash_secret};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::RegistryConfig;
use crate::error::{Error, Result};
use crate::metrics;
use crate::types::{Capability, Node, NodeDescriptor, NodeMetrics, NodeStatus, NodeUpdate};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of registering a node. The API key is only available here.
#[derive(Debug, Clone)]
pub struct Registration {
    pub node: Node,
    pub api_key: String,
}

/// Health change caused by a ping outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthTransition {
    /// Active node reached the consecutive failure threshold
    BecameUnhealthy,
    /// Node in error state answered a ping
    Recovered,
}

impl HealthTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthTransition::BecameUnhealthy => "healthy->unhealthy",
            HealthTransition::Recovered => "unhealthy->healthy",
        }
    }
}

/// Node counts by status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    pub maintenance: usize,
    pub error: usize,
    pub retired: usize,
}

struct Snapshot {
    built_at: Instant,
    nodes: Arc<Vec<Node>>,
}

/// Decrements the node's open connection count when dropped
pub struct ConnectionGuard<'a> {
    registry: &'a NodeRegistry,
    node_id: String,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        if let Some(mut node) = self.registry.nodes.get_mut(&self.node_id) {
            node.metrics.open_connections = node.metrics.open_connections.saturating_sub(1);
        }
    }
}

/// Registry of mesh nodes
pub struct NodeRegistry {
    config: RegistryConfig,
    unhealthy_threshold: u32,
    nodes: DashMap<String, Node>,
    /// slug -> node id
    slugs: DashMap<String, String>,
    breaker: Arc<CircuitBreaker>,
    snapshots: RwLock<HashMap<Option<Capability>, Snapshot>>,
}

impl NodeRegistry {
    pub fn new(
        config: RegistryConfig,
        unhealthy_threshold: u32,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            config,
            unhealthy_threshold: unhealthy_threshold.max(1),
            nodes: DashMap::new(),
            slugs: DashMap::new(),
            breaker,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    fn invalidate_snapshots(&self) {
        self.snapshots.write().clear();
        let stats = self.stats();
        metrics::record_registered_nodes(stats.active, stats.total);
    }

    /// Register a node. A descriptor carrying the id of an existing node with
    /// the same slug re-registers it: the record is reactivated and a new API
    /// key is issued.
    pub fn register(&self, descriptor: NodeDescriptor) -> Result<Registration> {
        let name = descriptor.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("node name must not be empty".into()));
        }
        let url = descriptor.url.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(Error::InvalidRequest(format!(
                "node url must be http(s), got '{}'",
                url
            )));
        }

        let slug = slugify(name);
        if slug.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "node name '{}' yields an empty slug",
                name
            )));
        }
        let id = descriptor
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let api_key = generate_secret("nmk_");
        let now = Utc::now();

        let node = match self.slugs.entry(slug.clone()) {
            Entry::Occupied(entry) => {
                if entry.get() != &id {
                    return Err(Error::DuplicateNode(slug));
                }
                let mut existing = self
                    .nodes
                    .get_mut(&id)
                    .ok_or_else(|| Error::Internal(format!("slug {} has no node", slug)))?;
                existing.name = name.to_string();
                existing.url = url.to_string();
                existing.api_key_hash = hash_secret(&api_key);
                existing.capabilities = descriptor.capabilities;
                existing.metadata = descriptor.metadata;
                existing.weight = descriptor.weight.unwrap_or(existing.weight);
                existing.status = NodeStatus::Active;
                existing.metrics.consecutive_failures = 0;
                existing.retired_at = None;
                existing.updated_at = now;
                info!("Re-registered node {} ({})", existing.id, slug);
                existing.clone()
            }
            Entry::Vacant(entry) => {
                if self.nodes.contains_key(&id) {
                    return Err(Error::DuplicateNode(id));
                }
                let node = Node {
                    id: id.clone(),
                    slug: slug.clone(),
                    name: name.to_string(),
                    url: url.to_string(),
                    api_key_hash: hash_secret(&api_key),
                    capabilities: descriptor.capabilities,
                    metadata: descriptor.metadata,
                    status: NodeStatus::Active,
                    weight: descriptor.weight.unwrap_or(1),
                    metrics: NodeMetrics::default(),
                    created_at: now,
                    updated_at: now,
                    retired_at: None,
                };
                self.nodes.insert(id.clone(), node.clone());
                entry.insert(id);
                info!("Registered node {} ({}) at {}", node.id, slug, node.url);
                node
            }
        };

        self.invalidate_snapshots();
        Ok(Registration { node, api_key })
    }

    pub fn update(&self, id: &str, update: NodeUpdate) -> Result<Node> {
        let updated = {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;

            if let Some(name) = update.name {
                node.name = name;
            }
            if let Some(url) = update.url {
                node.url = url;
            }
            if let Some(capabilities) = update.capabilities {
                node.capabilities = capabilities;
            }
            if let Some(metadata) = update.metadata {
                node.metadata = metadata;
            }
            if let Some(status) = update.status {
                node.status = status;
                if status == NodeStatus::Active {
                    node.retired_at = None;
                    node.metrics.consecutive_failures = 0;
                }
            }
            if let Some(weight) = update.weight {
                node.weight = weight;
            }
            node.updated_at = Utc::now();
            node.clone()
        };

        debug!("Updated node {}", id);
        self.invalidate_snapshots();
        Ok(updated)
    }

    /// Retire a node. The record stays in the registry.
    pub fn deactivate(&self, id: &str) -> Result<Node> {
        let node = {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
            let now = Utc::now();
            node.status = NodeStatus::Inactive;
            node.retired_at = Some(now);
            node.updated_at = now;
            node.clone()
        };

        info!("Deactivated node {}", id);
        self.invalidate_snapshots();
        Ok(node)
    }

    pub fn get(&self, id: &str) -> Option<Node> {
        self.nodes.get(id).map(|n| n.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All nodes ordered by registration time
    pub fn list(&self, include_retired: bool) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| include_retired || n.retired_at.is_none())
            .map(|n| n.clone())
            .collect();
        sort_by_registration(&mut nodes);
        nodes
    }

    /// Active, non-retired nodes, optionally filtered by capability
    pub fn active(&self, capability: Option<&Capability>) -> Arc<Vec<Node>> {
        let key = capability.cloned();
        let ttl = Duration::from_millis(self.config.active_cache_ttl_ms);

        if let Some(snapshot) = self.snapshots.read().get(&key) {
            if snapshot.built_at.elapsed() < ttl {
                return Arc::clone(&snapshot.nodes);
            }
        }

        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|n| n.is_active())
            .filter(|n| capability.map(|c| n.has_capability(c)).unwrap_or(true))
            .map(|n| n.clone())
            .collect();
        sort_by_registration(&mut nodes);
        let nodes = Arc::new(nodes);

        self.snapshots.write().insert(
            key,
            Snapshot {
                built_at: Instant::now(),
                nodes: Arc::clone(&nodes),
            },
        );
        nodes
    }

    /// Apply a ping outcome to the node's metrics, status and circuit breaker
    pub fn record_ping(
        &self,
        id: &str,
        success: bool,
        latency_ms: f64,
    ) -> Result<Option<HealthTransition>> {
        let alpha = self.config.latency_ema_alpha;
        let transition = {
            let mut node = self
                .nodes
                .get_mut(id)
                .ok_or_else(|| Error::NodeNotFound(id.to_string()))?;
            let now = Utc::now();
            node.metrics.last_ping = Some(now);

            if success {
                node.metrics.last_successful_ping = Some(now);
                node.metrics.consecutive_failures = 0;
                node.metrics.avg_response_ms =
                    Some(ema(node.metrics.avg_response_ms, latency_ms, alpha));
                if node.status == NodeStatus::Error && node.retired_at.is_none() {
                    node.status = NodeStatus::Active;
                    node.updated_at = now;
                    Some(HealthTransition::Recovered)
                } else {
                    None
                }
            } else {
                node.metrics.consecutive_failures += 1;
                if node.status == NodeStatus::Active
                    && node.metrics.consecutive_failures >= self.unhealthy_threshold
                {
                    node.status = NodeStatus::Error;
                    node.updated_at = now;
                    Some(HealthTransition::BecameUnhealthy)
                } else {
                    None
                }
            }
        };

        if success {
            self.breaker.record_success(id);
        } else {
            self.breaker.record_failure(id);
        }
        metrics::record_ping(id, success, Duration::from_secs_f64(latency_ms.max(0.0) / 1000.0));

        if let Some(t) = transition {
            match t {
                HealthTransition::BecameUnhealthy => {
                    warn!("Node {} marked unhealthy after failed pings", id)
                }
                HealthTransition::Recovered => info!("Node {} recovered", id),
            }
            metrics::update_node_health(id, t == HealthTransition::Recovered);
            self.invalidate_snapshots();
        }
        Ok(transition)
    }

    /// Feed the latency of a successful call into the response time average
    pub fn record_latency(&self, id: &str, latency_ms: f64) {
        let alpha = self.config.latency_ema_alpha;
        if let Some(mut node) = self.nodes.get_mut(id) {
            node.metrics.total_requests += 1;
            node.metrics.avg_response_ms =
                Some(ema(node.metrics.avg_response_ms, latency_ms, alpha));
        }
    }

    /// Count a failed call against the node
    pub fn record_call_failure(&self, id: &str) {
        if let Some(mut node) = self.nodes.get_mut(id) {
            node.metrics.total_requests += 1;
            node.metrics.total_failures += 1;
        }
    }

    /// Track an in-flight call for least-connections balancing
    pub fn begin_request(&self, id: &str) -> ConnectionGuard<'_> {
        if let Some(mut node) = self.nodes.get_mut(id) {
            node.metrics.open_connections += 1;
        }
        ConnectionGuard {
            registry: self,
            node_id: id.to_string(),
        }
    }

    /// Node id owning this API key, if any
    pub fn verify_api_key(&self, key: &str) -> Option<String> {
        let hash = hash_secret(key);
        self.nodes
            .iter()
            .find(|n| {
                n.retired_at.is_none() && constant_time_eq(n.api_key_hash.as_bytes(), hash.as_bytes())
            })
            .map(|n| n.id.clone())
    }

    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for node in self.nodes.iter() {
            stats.total += 1;
            if node.retired_at.is_some() {
                stats.retired += 1;
            }
            match node.status {
                NodeStatus::Active => stats.active += 1,
                NodeStatus::Inactive => stats.inactive += 1,
                NodeStatus::Maintenance => stats.maintenance += 1,
                NodeStatus::Error => stats.error += 1,
            }
        }
        stats
    }
}

fn ema(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(avg) => alpha * sample + (1.0 - alpha) * avg,
        None => sample,
    }
}

fn sort_by_registration(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
}

/// Lowercase, alphanumerics kept, every other run of characters becomes '-'
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
