//! Shared fixtures: an in-process transport standing in for remote nodes.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use nodemesh::client::{CallContext, NodeTransport};
use nodemesh::config::{Config, NodeRole};
use nodemesh::local::{ActionRegistry, Document, KeywordIndex};
use nodemesh::types::{
    ActionRequest, ActionResponse, Capability, HealthResponse, Node, NodeDescriptor,
    NodeMetadata, SearchItem, SearchRequest, SearchResponse,
};
use nodemesh::{Error, NodeMesh, Result};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SIGNING_SECRET: &str = "integration-test-secret-0123456789abcdef";

/// How a mock node answers searches
#[derive(Clone)]
pub enum SearchBehavior {
    Results(Vec<SearchItem>),
    Fail,
    Hang,
    /// Answer with the items after a pause
    Slow(Duration, Vec<SearchItem>),
}

/// Remote nodes keyed by name
#[derive(Default)]
pub struct MockTransport {
    search: Mutex<HashMap<String, SearchBehavior>>,
    failing_actions: Mutex<HashSet<(String, String)>>,
    ping_down: Mutex<HashSet<String>>,
    search_calls: Mutex<HashMap<String, usize>>,
    action_calls: Mutex<Vec<(String, String)>>,
    ping_calls: Mutex<HashMap<String, usize>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Counts a search as in flight until dropped
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on_search(&self, node: &str, behavior: SearchBehavior) {
        self.search.lock().insert(node.to_string(), behavior);
    }

    pub fn fail_action(&self, node: &str, action: &str) {
        self.failing_actions
            .lock()
            .insert((node.to_string(), action.to_string()));
    }

    pub fn set_ping(&self, node: &str, up: bool) {
        let mut down = self.ping_down.lock();
        if up {
            down.remove(node);
        } else {
            down.insert(node.to_string());
        }
    }

    pub fn search_calls(&self, node: &str) -> usize {
        self.search_calls.lock().get(node).copied().unwrap_or(0)
    }

    pub fn total_search_calls(&self) -> usize {
        self.search_calls.lock().values().sum()
    }

    pub fn ping_calls(&self, node: &str) -> usize {
        self.ping_calls.lock().get(node).copied().unwrap_or(0)
    }

    /// Most searches that were running at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// (node name, action) in call order
    pub fn action_calls(&self) -> Vec<(String, String)> {
        self.action_calls.lock().clone()
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    async fn ping(&self, node: &Node, _timeout: Duration) -> Result<HealthResponse> {
        *self.ping_calls.lock().entry(node.name.clone()).or_insert(0) += 1;
        if self.ping_down.lock().contains(&node.name) {
            return Err(Error::Transport(format!("{} refused connection", node.name)));
        }
        Ok(HealthResponse {
            status: "ok".into(),
            version: "test".into(),
            node_id: Some(node.id.clone()),
            role: Some("child".into()),
            capabilities: node.capabilities.clone(),
            timestamp: Utc::now(),
        })
    }

    async fn search(
        &self,
        node: &Node,
        request: &SearchRequest,
        _ctx: &CallContext,
    ) -> Result<SearchResponse> {
        *self.search_calls.lock().entry(node.name.clone()).or_insert(0) += 1;
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(running, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);
        let behavior = self.search.lock().get(&node.name).cloned();
        match behavior {
            Some(SearchBehavior::Results(mut items)) => {
                items.truncate(request.limit);
                Ok(SearchResponse {
                    count: items.len(),
                    results: items,
                    duration_ms: 1,
                })
            }
            Some(SearchBehavior::Slow(pause, mut items)) => {
                tokio::time::sleep(pause).await;
                items.truncate(request.limit);
                Ok(SearchResponse {
                    count: items.len(),
                    results: items,
                    duration_ms: pause.as_millis() as u64,
                })
            }
            Some(SearchBehavior::Fail) => {
                Err(Error::Transport(format!("{} refused connection", node.name)))
            }
            Some(SearchBehavior::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::Timeout("unreachable".into()))
            }
            None => Ok(SearchResponse {
                results: vec![],
                count: 0,
                duration_ms: 1,
            }),
        }
    }

    async fn execute(
        &self,
        node: &Node,
        request: &ActionRequest,
        _ctx: &CallContext,
    ) -> Result<ActionResponse> {
        self.action_calls
            .lock()
            .push((node.name.clone(), request.action.clone()));
        let fails = self
            .failing_actions
            .lock()
            .contains(&(node.name.clone(), request.action.clone()));
        if fails {
            return Ok(ActionResponse {
                success: false,
                result: json!(format!("{} rejected {}", node.name, request.action)),
            });
        }
        Ok(ActionResponse {
            success: true,
            result: json!({ "node": node.name, "action": request.action }),
        })
    }
}

pub fn item(id: &str, content: &str, score: f32) -> SearchItem {
    SearchItem {
        id: id.to_string(),
        content: content.to_string(),
        score,
        metadata: Map::new(),
        source_node: None,
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.node.enabled = true;
    config.node.role = NodeRole::Master;
    config.node.node_id = "master".into();
    config.node.name = "master".into();
    config.auth.signing_secret = SIGNING_SECRET.into();
    config.federation.request_timeout_ms = 200;
    config.federation.max_remote_nodes = 0;
    config.rate_limit.enabled = false;
    config
}

/// Mesh over the mock transport with one local document about rust
pub fn mesh_with(config: Config, transport: Arc<MockTransport>) -> Arc<NodeMesh> {
    let index = Arc::new(KeywordIndex::new());
    index.upsert(Document {
        id: "local-1".into(),
        content: "rust services on the master".into(),
        metadata: Map::new(),
    });
    let actions = Arc::new(ActionRegistry::new());
    index.register_actions(&actions);
    Arc::new(NodeMesh::with_transport(config, transport, index, actions))
}

/// Register a child node advertising the given domains and return its id
pub async fn register_with_domains(mesh: &NodeMesh, name: &str, domains: &[&str]) -> String {
    let mut descriptor = descriptor(name);
    descriptor.metadata.domains = domains.iter().map(|d| d.to_string()).collect();
    mesh.register_node(descriptor, false)
        .await
        .expect("registration")
        .node
        .id
}

pub fn descriptor(name: &str) -> NodeDescriptor {
    NodeDescriptor {
        name: name.to_string(),
        url: format!("http://{}.test:8640", name),
        capabilities: vec![Capability::Search, Capability::Actions],
        metadata: NodeMetadata::default(),
        weight: None,
        id: None,
    }
}

/// Register a child node and return its id
pub async fn register(mesh: &NodeMesh, name: &str) -> String {
    mesh.register_node(descriptor(name), false)
        .await
        .expect("registration")
        .node
        .id
}

pub fn remote_payload(value: &Value) -> Option<&str> {
    value.get("node").and_then(|v| v.as_str())
}
