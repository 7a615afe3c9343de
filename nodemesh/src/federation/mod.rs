//! Federated search across mesh nodes
//!
//! ```text
//! Query → candidates → cache? → [local, node 1, node 2, ...] → Merger → Result
//!                                        ↓
//!                    breaker gate, semaphore, per-call timeout
//!                                        ↓
//!                         partial results on failure
//! ```
//!
//! The local branch always runs and never waits for a permit. Remote nodes
//! whose circuit breaker rejects the call are skipped, not failed.

mod merger;

pub use merger::{content_fingerprint, MergedResults, NodeResults, ResultMerger};

use crate::balancer::{LoadBalancer, Strategy};
use crate::cache::ResultCache;
use crate::circuit_breaker::CircuitBreaker;
use crate::client::{CallContext, NodeTransport};
use crate::config::FederationConfig;
use crate::error::{Error, Result};
use crate::local::LocalSearch;
use crate::metrics::{self, RpcTimer};
use crate::registry::NodeRegistry;
use crate::selection::{ConversationContext, NodeSelector, TagOverlapScorer};
use crate::trace::{NodeRequestRecord, RequestLog, RequestOutcome};
use crate::types::{Capability, Node, SearchItem, SearchRequest};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A federated search request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FederatedQuery {
    pub query: String,
    /// Restrict the search to these nodes; all active search nodes otherwise
    #[serde(default)]
    pub node_ids: Option<Vec<String>>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub options: Map<String, Value>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Only query nodes whose metadata matches the query
    #[serde(default)]
    pub relevant: bool,
    /// Follow-up queries of one conversation prefer the nodes that answered
    /// earlier turns
    #[serde(default)]
    pub conversation_id: Option<String>,
}

impl FederatedQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn with_nodes(mut self, node_ids: Vec<String>) -> Self {
        self.node_ids = Some(node_ids);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_relevance(mut self) -> Self {
        self.relevant = true;
        self
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// A node branch that did not contribute results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub reason: String,
    pub is_timeout: bool,
}

/// Merged result of a federated search
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub query: String,
    pub results: Vec<SearchItem>,
    pub count: usize,
    /// Branches that answered, the local one included
    pub nodes_searched: usize,
    /// Branches dispatched, the local one included
    pub nodes_attempted: usize,
    /// Remote nodes not called because their breaker was open
    pub nodes_skipped: Vec<String>,
    pub failures: Vec<NodeFailure>,
    pub is_partial: bool,
    pub duration_ms: u64,
}

/// What [`FederatedSearchCoordinator::search`] returns
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub result: Arc<AggregatedResult>,
    pub cache_hit: bool,
}

struct BranchOutcome {
    node_id: String,
    local: bool,
    result: Result<Vec<SearchItem>>,
}

/// Fans a query out to the local index and remote nodes and merges the
/// answers
pub struct FederatedSearchCoordinator {
    local_node_id: String,
    config: FederationConfig,
    strategy: Strategy,
    registry: Arc<NodeRegistry>,
    breaker: Arc<CircuitBreaker>,
    balancer: Arc<LoadBalancer>,
    cache: Arc<ResultCache>,
    transport: Arc<dyn NodeTransport>,
    local: Arc<dyn LocalSearch>,
    requests: Arc<RequestLog>,
    merger: ResultMerger,
    selector: NodeSelector,
    conversations: Mutex<HashMap<String, (Instant, ConversationContext)>>,
}

/// Conversations tracked at once; the least recently used is dropped first
const MAX_CONVERSATIONS: usize = 1024;

impl FederatedSearchCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local_node_id: impl Into<String>,
        config: FederationConfig,
        strategy: Strategy,
        registry: Arc<NodeRegistry>,
        breaker: Arc<CircuitBreaker>,
        balancer: Arc<LoadBalancer>,
        cache: Arc<ResultCache>,
        transport: Arc<dyn NodeTransport>,
        local: Arc<dyn LocalSearch>,
        requests: Arc<RequestLog>,
    ) -> Self {
        let selector = NodeSelector::new(
            Box::new(TagOverlapScorer),
            config.relevance_min_score,
            config.relevance_max_nodes,
        );
        Self {
            local_node_id: local_node_id.into(),
            selector,
            conversations: Mutex::new(HashMap::new()),
            config,
            strategy,
            registry,
            breaker,
            balancer,
            cache,
            transport,
            local,
            requests,
            merger: ResultMerger::new(),
        }
    }

    /// Replace the relevance selector used for `relevant` queries
    pub fn with_selector(mut self, selector: NodeSelector) -> Self {
        self.selector = selector;
        self
    }

    fn conversation_nodes(&self, query: FederatedQuery) -> FederatedQuery {
        let Some(id) = query.conversation_id.clone() else {
            return query;
        };
        match self.conversations.lock().get_mut(&id) {
            Some((last_used, context)) => {
                *last_used = Instant::now();
                context.apply(query)
            }
            None => query,
        }
    }

    fn remember_turn(&self, conversation_id: Option<&str>, result: &AggregatedResult) {
        let Some(id) = conversation_id else {
            return;
        };
        let mut conversations = self.conversations.lock();
        if !conversations.contains_key(id) && conversations.len() >= MAX_CONVERSATIONS {
            let oldest = conversations
                .iter()
                .min_by_key(|(_, (last_used, _))| *last_used)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                conversations.remove(&oldest);
            }
        }
        let turns = self.config.conversation_turns;
        let (last_used, context) = conversations
            .entry(id.to_string())
            .or_insert_with(|| (Instant::now(), ConversationContext::new(turns)));
        *last_used = Instant::now();
        context.record_turn(result);
    }

    pub async fn search(&self, query: FederatedQuery) -> Result<SearchOutcome> {
        self.search_with_cancel(query, CancellationToken::new()).await
    }

    /// Like [`search`](Self::search); cancelling the token abandons every
    /// outstanding branch and returns what was gathered so far, uncached.
    pub async fn search_with_cancel(
        &self,
        query: FederatedQuery,
        cancel: CancellationToken,
    ) -> Result<SearchOutcome> {
        if query.query.trim().is_empty() {
            return Err(Error::InvalidRequest("query must not be empty".into()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let conversation_id = query.conversation_id.clone();
        let query = self.conversation_nodes(query);

        let start = Instant::now();
        let limit = match query.limit {
            Some(0) | None => self.config.default_limit,
            Some(n) => n,
        };
        let correlation_id = query
            .correlation_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let candidates = self.candidates(&query);
        let candidate_ids: Vec<String> = candidates.iter().map(|n| n.id.clone()).collect();
        let key = ResultCache::key(
            &query.query,
            &candidate_ids,
            &json!({ "limit": limit, "options": query.options }),
        );

        if let Some(cached) = self.cache.get(&key) {
            debug!(
                correlation_id = %correlation_id,
                "Federated search served from cache"
            );
            self.remember_turn(conversation_id.as_deref(), &cached);
            return Ok(SearchOutcome {
                result: cached,
                cache_hit: true,
            });
        }

        // Nodes behind an open breaker are reported as skipped before the
        // balancer narrows the rest
        let mut skipped = Vec::new();
        let mut available = Vec::with_capacity(candidates.len());
        for node in candidates {
            if self.breaker.is_available(&node.id) {
                available.push(node);
            } else {
                metrics::record_rpc_skipped("search", &node.id);
                skipped.push(node.id);
            }
        }

        let targets = if self.config.max_remote_nodes > 0 {
            self.balancer
                .select(&available, self.config.max_remote_nodes, self.strategy)
        } else {
            available
        };

        let mut allowed = Vec::new();
        for node in targets {
            if self.breaker.allow(&node.id) {
                allowed.push(node);
            } else {
                metrics::record_rpc_skipped("search", &node.id);
                skipped.push(node.id);
            }
        }
        skipped.sort();

        debug!(
            correlation_id = %correlation_id,
            "Dispatching search to local node and {} remote node(s), {} skipped",
            allowed.len(),
            skipped.len()
        );

        let request = SearchRequest {
            query: query.query.clone(),
            limit,
            options: query.options.clone(),
        };
        let ctx = CallContext::new(correlation_id.clone(), self.config.request_timeout());
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_requests.max(1)));

        let mut branches: FuturesUnordered<BoxFuture<'_, BranchOutcome>> = FuturesUnordered::new();
        branches.push(Box::pin(self.local_branch(&request)));
        for node in allowed.iter() {
            branches.push(Box::pin(self.remote_branch(
                node,
                &request,
                ctx.child(),
                Arc::clone(&semaphore),
            )));
        }
        let nodes_attempted = branches.len();

        let mut outcomes = Vec::with_capacity(nodes_attempted);
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = branches.next() => match next {
                    Some(outcome) => outcomes.push(outcome),
                    None => break,
                },
            }
        }
        drop(branches);

        if cancelled {
            for node in allowed.iter() {
                if !outcomes.iter().any(|o| o.node_id == node.id) {
                    let record = NodeRequestRecord::outbound(
                        &ctx.request_id,
                        &correlation_id,
                        &node.id,
                        "search",
                    );
                    self.requests.record(record.finish(RequestOutcome::Cancelled));
                }
            }
        }

        let mut failures = Vec::new();
        let mut node_results = Vec::new();
        let mut local_failed = false;
        for outcome in outcomes {
            match outcome.result {
                Ok(items) => node_results.push(NodeResults {
                    node_id: outcome.node_id,
                    items,
                }),
                Err(e) => {
                    if outcome.local {
                        local_failed = true;
                    }
                    failures.push(NodeFailure {
                        node_id: outcome.node_id,
                        is_timeout: matches!(e, Error::Timeout(_)),
                        reason: e.to_string(),
                    });
                }
            }
        }
        failures.sort_by(|a, b| a.node_id.cmp(&b.node_id));

        let remote_successes = node_results
            .iter()
            .filter(|r| r.node_id != self.local_node_id)
            .count();

        if cancelled && node_results.is_empty() {
            info!(correlation_id = %correlation_id, "Federated search cancelled");
            return Err(Error::Cancelled);
        }
        if local_failed && remote_successes == 0 {
            let reason = failures
                .iter()
                .find(|f| f.node_id == self.local_node_id)
                .map(|f| f.reason.clone())
                .unwrap_or_else(|| "local search failed".to_string());
            return Err(Error::SearchFailed(reason));
        }

        let nodes_searched = node_results.len();
        let merged = self.merger.merge(node_results, limit);
        let is_partial = cancelled || !failures.is_empty() || !skipped.is_empty();
        let duration = start.elapsed();

        if is_partial {
            warn!(
                correlation_id = %correlation_id,
                "Federated search returned partial results: {} failed, {} skipped",
                failures.len(),
                skipped.len()
            );
        }
        metrics::record_federated_search(nodes_searched, failures.len(), duration);

        let result = Arc::new(AggregatedResult {
            query: query.query,
            count: merged.results.len(),
            results: merged.results,
            nodes_searched,
            nodes_attempted,
            nodes_skipped: skipped,
            failures,
            is_partial,
            duration_ms: duration.as_millis() as u64,
        });

        if !cancelled {
            self.cache.put(key, candidate_ids, Arc::clone(&result));
            self.remember_turn(conversation_id.as_deref(), &result);
        }

        Ok(SearchOutcome {
            result,
            cache_hit: false,
        })
    }

    /// Remote nodes eligible for this query: the named nodes, else every
    /// active search node in registration order, narrowed by relevance when
    /// the query asks for it
    fn candidates(&self, query: &FederatedQuery) -> Vec<Node> {
        match &query.node_ids {
            Some(ids) if !ids.is_empty() => {
                let mut seen = std::collections::HashSet::new();
                ids.iter()
                    .filter(|id| **id != self.local_node_id)
                    .filter(|id| seen.insert(id.as_str()))
                    .filter_map(|id| match self.registry.get(id) {
                        Some(node) if node.is_active() && node.has_capability(&Capability::Search) => {
                            Some(node)
                        }
                        Some(_) => {
                            debug!("Ignoring node {}: not an active search node", id);
                            None
                        }
                        None => {
                            warn!("Ignoring unknown node id {} in federated search", id);
                            None
                        }
                    })
                    .collect()
            }
            _ => {
                let nodes: Vec<Node> = self
                    .registry
                    .active(Some(&Capability::Search))
                    .iter()
                    .filter(|n| n.id != self.local_node_id)
                    .cloned()
                    .collect();
                if !query.relevant {
                    return nodes;
                }
                let mut narrowed = self.selector.narrow(&query.query, &nodes);
                debug!(
                    "Relevance selection kept {} of {} node(s)",
                    narrowed.len(),
                    nodes.len()
                );
                // Cache keys and breaker accounting expect a stable order
                narrowed.sort_by_key(|n| (n.created_at, n.id.clone()));
                narrowed
            }
        }
    }

    async fn local_branch(&self, request: &SearchRequest) -> BranchOutcome {
        let result = match tokio::time::timeout(
            self.config.request_timeout(),
            self.local
                .search(&request.query, request.limit, &request.options),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout("local search".to_string())),
        };
        if let Err(e) = &result {
            warn!("Local search failed: {}", e);
        }
        BranchOutcome {
            node_id: self.local_node_id.clone(),
            local: true,
            result,
        }
    }

    async fn remote_branch(
        &self,
        node: &Node,
        request: &SearchRequest,
        ctx: CallContext,
        semaphore: Arc<Semaphore>,
    ) -> BranchOutcome {
        let _permit = semaphore.acquire_owned().await.ok();
        let _connection = self.registry.begin_request(&node.id);
        let record =
            NodeRequestRecord::outbound(&ctx.request_id, &ctx.correlation_id, &node.id, "search");
        let timer = RpcTimer::new("search", &node.id);

        let result = match tokio::time::timeout(
            ctx.timeout,
            self.transport.search(node, request, &ctx),
        )
        .await
        {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(format!(
                "node {} did not answer within {}ms",
                node.id,
                ctx.timeout.as_millis()
            ))),
        };

        let result = match result {
            Ok(response) => {
                let elapsed = timer.success();
                self.breaker.record_success(&node.id);
                self.registry
                    .record_latency(&node.id, elapsed.as_secs_f64() * 1000.0);
                self.requests.record(record.finish(RequestOutcome::Success));
                debug!(
                    "Node {} returned {} result(s) in {:?}",
                    node.id,
                    response.results.len(),
                    elapsed
                );
                Ok(response.results)
            }
            Err(e) => {
                timer.error(e.error_type());
                if e.is_node_fault() {
                    self.breaker.record_failure(&node.id);
                    self.registry.record_call_failure(&node.id);
                } else {
                    self.breaker.record_success(&node.id);
                }
                let outcome = match &e {
                    Error::Timeout(_) => RequestOutcome::Timeout,
                    other => RequestOutcome::Failure {
                        reason: other.to_string(),
                    },
                };
                self.requests.record(record.finish(outcome));
                warn!("Search on node {} failed: {}", node.id, e);
                Err(e)
            }
        };

        BranchOutcome {
            node_id: node.id.clone(),
            local: false,
            result,
        }
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn request_timeout(&self) -> Duration {
        self.config.request_timeout()
    }
}
