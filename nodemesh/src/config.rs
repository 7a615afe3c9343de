//! Configuration management for nodemesh
//!
//! Default config location: ./nodemesh.toml. Every field has a default, so an
//! empty file (or no file at all) yields a working standalone node.

use crate::balancer::Strategy;
use crate::types::{Capability, NodeMetadata};
use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Shortest accepted HS256 signing secret
pub const MIN_SECRET_LEN: usize = 32;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub load_balancing: LoadBalancingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub cors: CorsConfig,
    /// Take the client address from `x-forwarded-for`. Only enable behind a
    /// reverse proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8640".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            cors: CorsConfig::default(),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Allowed origins. Use "*" for any origin.
    #[serde(default)]
    pub origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            origins: Vec::new(),
        }
    }
}

/// Role of this instance in the mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Coordinates federated search and remote actions
    #[default]
    Master,
    /// Answers requests initiated by a master
    Child,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Master => "master",
            NodeRole::Child => "child",
        }
    }
}

/// Identity of this node and whether node features are on
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Enable node features (registration, federation, remote actions)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub role: NodeRole,

    /// Unique identifier for this node
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Human readable name, also used to derive the slug on registration
    #[serde(default = "default_node_name")]
    pub name: String,

    /// URL other nodes use to reach this one
    #[serde(default)]
    pub public_url: Option<String>,

    /// Master URL (children only)
    #[serde(default)]
    pub master_url: Option<String>,

    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<Capability>,

    #[serde(default)]
    pub metadata: NodeMetadata,
}

fn default_node_id() -> String {
    format!("node-{}", &uuid::Uuid::new_v4().to_string()[..8])
}

fn default_node_name() -> String {
    "nodemesh".to_string()
}

fn default_capabilities() -> Vec<Capability> {
    vec![Capability::Search, Capability::Actions, Capability::Status]
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            role: NodeRole::default(),
            node_id: default_node_id(),
            name: default_node_name(),
            public_url: None,
            master_url: None,
            capabilities: default_capabilities(),
            metadata: NodeMetadata::default(),
        }
    }
}

/// Token and API key settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Shared HS256 signing secret for access tokens. A random one is
    /// generated when missing; nodes of one mesh must share the same value.
    #[serde(default = "default_signing_secret")]
    pub signing_secret: String,

    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_secs: u64,

    #[serde(default = "default_refresh_ttl")]
    pub refresh_token_ttl_secs: u64,

    /// Operator-provisioned static API keys (weaker auth path)
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,

    /// When set, POST /register requires this value in `x-registration-token`
    #[serde(default)]
    pub registration_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub name: String,
}

fn default_signing_secret() -> String {
    crate::auth::generate_secret("")
}

fn default_access_ttl() -> u64 {
    3600
}

fn default_refresh_ttl() -> u64 {
    30 * 24 * 3600
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            signing_secret: default_signing_secret(),
            access_token_ttl_secs: default_access_ttl(),
            refresh_token_ttl_secs: default_refresh_ttl(),
            api_keys: Vec::new(),
            registration_token: None,
        }
    }
}

impl AuthConfig {
    pub fn access_token_ttl(&self) -> Duration {
        Duration::from_secs(self.access_token_ttl_secs)
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        Duration::from_secs(self.refresh_token_ttl_secs)
    }
}

/// Health monitor settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthConfig {
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Try a trial ping against open breakers whose retry timeout elapsed
    #[serde(default = "default_true")]
    pub auto_recover: bool,

    /// Consecutive failed pings before an active node is marked unhealthy
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Optional URL receiving a JSON POST on every health transition
    #[serde(default)]
    pub alert_webhook_url: Option<String>,
}

fn default_health_interval() -> u64 {
    60_000
}

fn default_ping_timeout() -> u64 {
    5_000
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval(),
            ping_timeout_ms: default_ping_timeout(),
            auto_recover: true,
            unhealthy_threshold: default_unhealthy_threshold(),
            alert_webhook_url: None,
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Circuit breaker thresholds shared by all nodes
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    #[serde(default = "default_retry_timeout")]
    pub retry_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    1
}

fn default_retry_timeout() -> u64 {
    60_000
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            retry_timeout_ms: default_retry_timeout(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

/// Federated search and fan-out settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FederationConfig {
    /// Timeout for every outbound node call
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Maximum concurrent outbound calls per fan-out
    #[serde(default = "default_max_parallel")]
    pub max_parallel_requests: usize,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    /// Cap on remote nodes queried per search (0 = all candidates)
    #[serde(default)]
    pub max_remote_nodes: usize,

    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    /// Cap on nodes kept by relevance selection (0 = every relevant node)
    #[serde(default)]
    pub relevance_max_nodes: usize,

    /// Nodes must score above this to be kept by relevance selection
    #[serde(default)]
    pub relevance_min_score: f64,

    /// Turns remembered per conversation
    #[serde(default = "default_conversation_turns")]
    pub conversation_turns: usize,
}

fn default_conversation_turns() -> usize {
    3
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_max_parallel() -> usize {
    10
}

fn default_cache_ttl() -> u64 {
    900
}

fn default_cache_max_entries() -> usize {
    1_000
}

fn default_search_limit() -> usize {
    10
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout(),
            max_parallel_requests: default_max_parallel(),
            cache_ttl_secs: default_cache_ttl(),
            cache_max_entries: default_cache_max_entries(),
            max_remote_nodes: 0,
            default_limit: default_search_limit(),
            relevance_max_nodes: 0,
            relevance_min_score: 0.0,
            conversation_turns: default_conversation_turns(),
        }
    }
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// How long an active-node snapshot is served before being rebuilt
    #[serde(default = "default_active_cache_ttl")]
    pub active_cache_ttl_ms: u64,

    /// Smoothing factor for the response time moving average
    #[serde(default = "default_ema_alpha")]
    pub latency_ema_alpha: f64,

    /// Ping a node before accepting its registration
    #[serde(default)]
    pub verify_on_register: bool,
}

fn default_active_cache_ttl() -> u64 {
    5_000
}

fn default_ema_alpha() -> f64 {
    0.3
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            active_cache_ttl_ms: default_active_cache_ttl(),
            latency_ema_alpha: default_ema_alpha(),
            verify_on_register: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct LoadBalancingConfig {
    #[serde(default)]
    pub strategy: Strategy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_rpm")]
    pub requests_per_minute: u32,

    /// Bucket size; defaults to the per-minute rate
    #[serde(default)]
    pub burst: Option<u32>,
}

fn default_rpm() -> u32 {
    60
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_minute: default_rpm(),
            burst: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log output format: "pretty" or "json"
    /// Override with LOG_FORMAT env var
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter string
    /// Override with RUST_LOG env var
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable Prometheus metrics at GET /metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_log_level() -> String {
    "info,nodemesh=debug".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: default_log_format(),
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    /// Number of node request records kept in memory
    #[serde(default = "default_audit_capacity")]
    pub capacity: usize,
}

fn default_audit_capacity() -> usize {
    1_000
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            capacity: default_audit_capacity(),
        }
    }
}

impl Config {
    /// Load config from file path, or create default
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path)?;
            toml::from_str(&content)?
        } else {
            let config = Config::default();
            if let Some(parent) = config_path.parent() {
                let _ = fs::create_dir_all(parent);
            }
            let _ = config.save(config_path);
            config
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Apply `NODEMESH_*` overrides from the given lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("NODEMESH_ENABLED") {
            self.node.enabled = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("NODEMESH_ROLE") {
            self.node.role = match v.to_lowercase().as_str() {
                "master" => NodeRole::Master,
                "child" => NodeRole::Child,
                other => bail!("NODEMESH_ROLE must be 'master' or 'child', got '{}'", other),
            };
        }
        if let Some(v) = lookup("NODEMESH_NODE_ID") {
            self.node.node_id = v;
        }
        if let Some(v) = lookup("NODEMESH_MASTER_URL") {
            self.node.master_url = Some(v);
        }
        if let Some(v) = lookup("NODEMESH_PUBLIC_URL") {
            self.node.public_url = Some(v);
        }
        if let Some(v) = lookup("NODEMESH_SIGNING_SECRET") {
            self.auth.signing_secret = v;
        }
        Ok(())
    }

    /// Reject configurations the core cannot run with
    pub fn validate(&self) -> Result<()> {
        // Token routes are mounted whether or not node features are enabled
        if self.auth.signing_secret.len() < MIN_SECRET_LEN {
            bail!(
                "auth.signing_secret must be at least {} bytes",
                MIN_SECRET_LEN
            );
        }
        if self.node.enabled
            && self.node.role == NodeRole::Child
            && self.node.master_url.is_none()
        {
            bail!("node.master_url is required for child nodes");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            bail!("circuit_breaker.failure_threshold must be > 0");
        }
        if self.circuit_breaker.success_threshold == 0 {
            bail!("circuit_breaker.success_threshold must be > 0");
        }
        if self.federation.max_parallel_requests == 0 {
            bail!("federation.max_parallel_requests must be > 0");
        }
        if !(0.0..=1.0).contains(&self.registry.latency_ema_alpha)
            || self.registry.latency_ema_alpha == 0.0
        {
            bail!("registry.latency_ema_alpha must be in (0, 1]");
        }
        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            bail!("rate_limit.requests_per_minute must be > 0");
        }
        Ok(())
    }

    /// Parse bind address into socket address
    pub fn parse_bind_addr(&self) -> Result<std::net::SocketAddr> {
        self.server
            .bind_addr
            .parse()
            .map_err(|e| anyhow!("Invalid bind address '{}': {}", self.server.bind_addr, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.node.enabled);
        assert_eq!(config.node.role, NodeRole::Master);
        assert_eq!(config.health.interval_ms, 60_000);
        assert_eq!(config.federation.request_timeout_ms, 30_000);
        assert_eq!(config.federation.max_parallel_requests, 10);
        assert_eq!(config.federation.cache_ttl_secs, 900);
        assert_eq!(config.auth.access_token_ttl_secs, 3600);
        assert_eq!(config.rate_limit.requests_per_minute, 60);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
    }

    #[test]
    fn test_empty_toml_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.registry.active_cache_ttl_ms, 5_000);
        assert!(config.health.auto_recover);
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [node]
            enabled = true
            role = "child"
            master_url = "http://master:8640"

            [circuit_breaker]
            failure_threshold = 3

            [load_balancing]
            strategy = "least_connections"
            "#,
        )
        .unwrap();
        assert_eq!(config.node.role, NodeRole::Child);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.retry_timeout_ms, 60_000);
        assert_eq!(config.load_balancing.strategy, Strategy::LeastConnections);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("NODEMESH_ENABLED", "true"),
            ("NODEMESH_ROLE", "child"),
            ("NODEMESH_MASTER_URL", "http://master:8640"),
            ("NODEMESH_SIGNING_SECRET", "0123456789abcdef0123456789abcdef"),
        ]);
        let mut config = Config::default();
        config
            .apply_env_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert!(config.node.enabled);
        assert_eq!(config.node.role, NodeRole::Child);
        assert_eq!(config.node.master_url.as_deref(), Some("http://master:8640"));
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_role_override() {
        let mut config = Config::default();
        let result = config.apply_env_overrides(|k| {
            (k == "NODEMESH_ROLE").then(|| "overlord".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let mut config = Config::default();
        config.node.enabled = true;
        config.auth.signing_secret = "short".into();
        assert!(config.validate().is_err());

        // Also with node features off, the API still verifies tokens
        config.node.enabled = false;
        config.auth.signing_secret = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_default_secret_is_random() {
        let a = Config::default();
        let b = Config::default();
        assert!(a.auth.signing_secret.len() >= MIN_SECRET_LEN);
        assert_ne!(a.auth.signing_secret, b.auth.signing_secret);
        a.validate().unwrap();

        let parsed: Config = toml::from_str("[auth]\naccess_token_ttl_secs = 60").unwrap();
        assert!(parsed.auth.signing_secret.len() >= MIN_SECRET_LEN);
    }

    #[test]
    fn test_validate_child_needs_master() {
        let mut config = Config::default();
        config.node.enabled = true;
        config.node.role = NodeRole::Child;
        config.auth.signing_secret = "x".repeat(32);
        assert!(config.validate().is_err());
        config.node.master_url = Some("http://master".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_create_writes_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("nodemesh.toml");
        let config = Config::load_or_create(&path).unwrap();
        assert!(path.exists());

        let reloaded = Config::load_or_create(&path).unwrap();
        assert_eq!(reloaded.server.bind_addr, config.server.bind_addr);
        // The generated secret is persisted, not regenerated on every start
        assert_eq!(reloaded.auth.signing_secret, config.auth.signing_secret);
    }
}
