//! The assembled coordination core of one node

use crate::actions::{ActionResult, RemoteActionDispatcher, TransactionResult, TransactionStep};
use crate::auth::AuthService;
use crate::balancer::LoadBalancer;
use crate::cache::{CacheStats, ResultCache};
use crate::circuit_breaker::{BreakerStatistics, CircuitBreaker};
use crate::client::{HttpNodeClient, NodeTransport};
use crate::config::{Config, NodeRole};
use crate::error::{Error, Result};
use crate::federation::{FederatedQuery, FederatedSearchCoordinator, SearchOutcome};
use crate::health::HealthMonitor;
use crate::local::{ActionRegistry, LocalSearch};
use crate::rate_limit::RateLimiter;
use crate::registry::{NodeRegistry, RegistryStats};
use crate::trace::RequestLog;
use crate::types::{
    ActionRequest, ActionResponse, Capability, HealthResponse, Node, NodeDescriptor, NodeMetrics,
    NodeStatus, NodeUpdate, RegistrationResponse, SearchRequest, SearchResponse,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// GET /status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: String,
    pub role: String,
    pub version: String,
    pub uptime_secs: u64,
    pub nodes: RegistryStats,
    pub open_connections: u32,
    pub breakers: Vec<BreakerStatistics>,
    pub cache: CacheStats,
    pub recent_requests: usize,
}

/// Every coordination component of a node, wired together
pub struct NodeMesh {
    config: Config,
    started_at: Instant,
    breaker: Arc<CircuitBreaker>,
    registry: Arc<NodeRegistry>,
    auth: Arc<AuthService>,
    cache: Arc<ResultCache>,
    transport: Arc<dyn NodeTransport>,
    local_search: Arc<dyn LocalSearch>,
    local_actions: Arc<ActionRegistry>,
    requests: Arc<RequestLog>,
    rate_limiter: Arc<RateLimiter>,
    federation: FederatedSearchCoordinator,
    actions: RemoteActionDispatcher,
    health: Arc<HealthMonitor>,
}

impl NodeMesh {
    /// Build a mesh talking to other nodes over HTTP
    pub fn new(
        config: Config,
        local_search: Arc<dyn LocalSearch>,
        local_actions: Arc<ActionRegistry>,
    ) -> Result<Self> {
        let auth = Arc::new(AuthService::new(config.auth.clone()));
        let transport: Arc<dyn NodeTransport> = Arc::new(HttpNodeClient::new(
            Arc::clone(&auth),
            config.node.node_id.clone(),
        )?);
        Ok(Self::assemble(config, auth, transport, local_search, local_actions))
    }

    /// Build a mesh over a custom transport
    pub fn with_transport(
        config: Config,
        transport: Arc<dyn NodeTransport>,
        local_search: Arc<dyn LocalSearch>,
        local_actions: Arc<ActionRegistry>,
    ) -> Self {
        let auth = Arc::new(AuthService::new(config.auth.clone()));
        Self::assemble(config, auth, transport, local_search, local_actions)
    }

    fn assemble(
        config: Config,
        auth: Arc<AuthService>,
        transport: Arc<dyn NodeTransport>,
        local_search: Arc<dyn LocalSearch>,
        local_actions: Arc<ActionRegistry>,
    ) -> Self {
        let node_id = config.node.node_id.clone();
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker));
        let registry = Arc::new(NodeRegistry::new(
            config.registry.clone(),
            config.health.unhealthy_threshold,
            Arc::clone(&breaker),
        ));
        let cache = Arc::new(ResultCache::new(
            config.federation.cache_ttl(),
            config.federation.cache_max_entries,
        ));
        let balancer = Arc::new(LoadBalancer::new(Arc::clone(&breaker)));
        let requests = Arc::new(RequestLog::new(config.audit.capacity));
        let rate_limiter = Arc::new(RateLimiter::new(&config.rate_limit));

        let federation = FederatedSearchCoordinator::new(
            node_id.clone(),
            config.federation.clone(),
            config.load_balancing.strategy,
            Arc::clone(&registry),
            Arc::clone(&breaker),
            balancer,
            Arc::clone(&cache),
            Arc::clone(&transport),
            Arc::clone(&local_search),
            Arc::clone(&requests),
        );
        let actions = RemoteActionDispatcher::new(
            node_id,
            config.federation.clone(),
            Arc::clone(&registry),
            Arc::clone(&breaker),
            Arc::clone(&transport),
            Arc::clone(&local_actions),
            Arc::clone(&requests),
        );
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            Arc::clone(&registry),
            Arc::clone(&breaker),
            Arc::clone(&cache),
            Arc::clone(&transport),
        ));

        Self {
            config,
            started_at: Instant::now(),
            breaker,
            registry,
            auth,
            cache,
            transport,
            local_search,
            local_actions,
            requests,
            rate_limiter,
            federation,
            actions,
            health,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.config.node.node_id
    }

    pub fn role(&self) -> NodeRole {
        self.config.node.role
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn auth(&self) -> &Arc<AuthService> {
        &self.auth
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn requests(&self) -> &Arc<RequestLog> {
        &self.requests
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn local_actions(&self) -> &Arc<ActionRegistry> {
        &self.local_actions
    }

    /// Register a node and issue its credentials. With `verify`, the node must
    /// answer a ping first.
    pub async fn register_node(
        &self,
        descriptor: NodeDescriptor,
        verify: bool,
    ) -> Result<RegistrationResponse> {
        if verify {
            let now = Utc::now();
            let unverified = Node {
                id: descriptor.id.clone().unwrap_or_default(),
                slug: String::new(),
                name: descriptor.name.clone(),
                url: descriptor.url.clone(),
                api_key_hash: String::new(),
                capabilities: descriptor.capabilities.clone(),
                metadata: descriptor.metadata.clone(),
                status: NodeStatus::Active,
                weight: descriptor.weight.unwrap_or(1),
                metrics: NodeMetrics::default(),
                created_at: now,
                updated_at: now,
                retired_at: None,
            };
            let timeout = self.config.health.ping_timeout();
            match tokio::time::timeout(timeout, self.transport.ping(&unverified, timeout)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(Error::NodeUnavailable(format!(
                        "{} did not answer: {}",
                        descriptor.url, e
                    )))
                }
                Err(_) => {
                    return Err(Error::NodeUnavailable(format!(
                        "{} did not answer within {}ms",
                        descriptor.url,
                        timeout.as_millis()
                    )))
                }
            }
        }

        let registration = self.registry.register(descriptor)?;
        // Re-registration replaces every earlier credential
        self.auth.revoke(&registration.node.id);
        self.breaker.reset(&registration.node.id);
        self.cache.invalidate_node(&registration.node.id);
        let tokens = self.auth.issue_token_pair(&registration.node.id)?;

        Ok(RegistrationResponse {
            node: registration.node,
            api_key: registration.api_key,
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
            access_expires_at: tokens.access_expires_at,
            refresh_expires_at: tokens.refresh_expires_at,
            token_type: tokens.token_type,
        })
    }

    pub fn update_node(&self, id: &str, update: NodeUpdate) -> Result<Node> {
        if update.is_empty() {
            return Err(Error::InvalidRequest("update has no fields".into()));
        }
        let node = self.registry.update(id, update)?;
        self.cache.invalidate_node(id);
        Ok(node)
    }

    /// Retire a node and revoke its credentials
    pub fn deactivate_node(&self, id: &str) -> Result<Node> {
        let node = self.registry.deactivate(id)?;
        self.auth.revoke(id);
        self.breaker.remove(id);
        self.cache.invalidate_node(id);
        Ok(node)
    }

    pub fn reset_breaker(&self, id: &str) -> Result<BreakerStatistics> {
        if !self.registry.contains(id) {
            return Err(Error::NodeNotFound(id.to_string()));
        }
        self.breaker.reset(id);
        Ok(self.breaker.statistics(id))
    }

    pub async fn federated_search(&self, query: FederatedQuery) -> Result<SearchOutcome> {
        self.federation.search(query).await
    }

    pub async fn federated_search_with_cancel(
        &self,
        query: FederatedQuery,
        cancel: CancellationToken,
    ) -> Result<SearchOutcome> {
        self.federation.search_with_cancel(query, cancel).await
    }

    pub async fn execute_action(
        &self,
        node_id: &str,
        action: &str,
        params: serde_json::Value,
        correlation_id: Option<&str>,
    ) -> Result<ActionResult> {
        self.actions
            .execute_on(node_id, action, params, correlation_id)
            .await
    }

    pub async fn execute_on_all(
        &self,
        action: &str,
        params: serde_json::Value,
        parallel: bool,
        correlation_id: Option<&str>,
    ) -> Vec<ActionResult> {
        self.actions
            .execute_on_all(action, params, parallel, correlation_id)
            .await
    }

    pub async fn execute_transaction(
        &self,
        steps: Vec<TransactionStep>,
        correlation_id: Option<&str>,
    ) -> Result<TransactionResult> {
        self.actions.execute_transaction(steps, correlation_id).await
    }

    /// Answer a search from another node with local data only
    pub async fn local_search(&self, request: SearchRequest) -> Result<SearchResponse> {
        if request.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".into()));
        }
        let start = Instant::now();
        let results = self
            .local_search
            .search(&request.query, request.limit, &request.options)
            .await?;
        Ok(SearchResponse {
            count: results.len(),
            results,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Run an action requested by another node
    pub async fn local_action(&self, request: ActionRequest) -> Result<ActionResponse> {
        let result = self
            .local_actions
            .execute(&request.action, request.params)
            .await?;
        Ok(ActionResponse {
            success: true,
            result,
        })
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            node_id: Some(self.config.node.node_id.clone()),
            role: Some(self.config.node.role.as_str().to_string()),
            capabilities: self.config.node.capabilities.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn status(&self) -> StatusReport {
        let open_connections = self
            .registry
            .list(false)
            .iter()
            .map(|n| n.metrics.open_connections)
            .sum();
        StatusReport {
            node_id: self.config.node.node_id.clone(),
            role: self.config.node.role.as_str().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            nodes: self.registry.stats(),
            open_connections,
            breakers: self.breaker.all_statistics(),
            cache: self.cache.stats(),
            recent_requests: self.requests.len(),
        }
    }

    pub fn has_capability(&self, capability: &Capability) -> bool {
        self.config.node.capabilities.contains(capability)
    }

    /// Start background health checks (masters only)
    pub fn start_health_monitor(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.node.role != NodeRole::Master {
            warn!("Health monitor only runs on master nodes");
            return None;
        }
        info!("Starting health monitor");
        Some(Arc::clone(&self.health).start())
    }
}
