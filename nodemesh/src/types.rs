//! Node records and node-to-node wire types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Something a node declares it can do
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Capability {
    Search,
    Actions,
    Status,
    Custom(String),
}

impl Capability {
    pub fn as_str(&self) -> &str {
        match self {
            Capability::Search => "search",
            Capability::Actions => "actions",
            Capability::Status => "status",
            Capability::Custom(name) => name,
        }
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "search" => Capability::Search,
            "actions" => Capability::Actions,
            "status" => Capability::Status,
            _ => Capability::Custom(s),
        }
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability::from(s.to_string())
    }
}

impl From<Capability> for String {
    fn from(c: Capability) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational status of a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Maintenance => "maintenance",
            NodeStatus::Error => "error",
        }
    }
}

/// Free-text and tag metadata used for relevance-based node selection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub data_types: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
}

/// Live metrics maintained by pings and calls
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    /// Exponential moving average of response time, `None` until first sample
    pub avg_response_ms: Option<f64>,
    pub open_connections: u32,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_successful_ping: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_failures: u64,
}

/// A registered node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub url: String,
    /// sha256 hex of the node's API key; never serialized to clients
    #[serde(skip_serializing, default)]
    pub api_key_hash: String,
    pub capabilities: Vec<Capability>,
    pub metadata: NodeMetadata,
    pub status: NodeStatus,
    pub weight: u32,
    pub metrics: NodeMetrics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retired_at: Option<DateTime<Utc>>,
}

impl Node {
    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active && self.retired_at.is_none()
    }

    /// Base URL without trailing slash
    pub fn base_url(&self) -> &str {
        self.url.trim_end_matches('/')
    }
}

/// Registration request (POST /register)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    #[serde(default)]
    pub metadata: NodeMetadata,
    #[serde(default)]
    pub weight: Option<u32>,
    /// Keep this id instead of generating one (children re-registering)
    #[serde(default)]
    pub id: Option<String>,
}

/// Partial update of a node (PATCH /nodes/:id)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUpdate {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Vec<Capability>>,
    #[serde(default)]
    pub metadata: Option<NodeMetadata>,
    #[serde(default)]
    pub status: Option<NodeStatus>,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl NodeUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.url.is_none()
            && self.capabilities.is_none()
            && self.metadata.is_none()
            && self.status.is_none()
            && self.weight.is_none()
    }
}

/// POST /register response. The API key and tokens are only shown once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub node: Node,
    pub api_key: String,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub token_type: String,
}

/// One search hit, as returned by a node and as merged by the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchItem {
    pub id: String,
    pub content: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Node that produced the item; set by the coordinator when merging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_node: Option<String>,
}

/// GET /health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    pub timestamp: DateTime<Utc>,
}

/// POST /search request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub options: Map<String, Value>,
}

fn default_limit() -> usize {
    10
}

/// POST /search response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchItem>,
    pub count: usize,
    pub duration_ms: u64,
}

/// POST /actions request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: Value,
}

/// POST /actions response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    #[serde(default)]
    pub result: Value,
}
