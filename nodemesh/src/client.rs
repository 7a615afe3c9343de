//! Outbound node-to-node calls
//!
//! [`NodeTransport`] is the seam between the coordinator and the network.
//! [`HttpNodeClient`] speaks the JSON/HTTP protocol and authenticates with an
//! access token minted for the local node.

use crate::auth::AuthService;
use crate::error::{Error, Result};
use crate::types::{
    ActionRequest, ActionResponse, HealthResponse, Node, SearchRequest, SearchResponse,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_ERROR_BODY: usize = 512;

/// Per-call context propagated to the remote node
#[derive(Debug, Clone)]
pub struct CallContext {
    pub correlation_id: String,
    pub request_id: String,
    pub timeout: Duration,
}

impl CallContext {
    pub fn new(correlation_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            request_id: uuid::Uuid::new_v4().to_string(),
            timeout,
        }
    }

    /// Same correlation id, fresh request id
    pub fn child(&self) -> Self {
        Self::new(self.correlation_id.clone(), self.timeout)
    }
}

/// Calls a remote node
#[async_trait]
pub trait NodeTransport: Send + Sync {
    async fn ping(&self, node: &Node, timeout: Duration) -> Result<HealthResponse>;

    async fn search(
        &self,
        node: &Node,
        request: &SearchRequest,
        ctx: &CallContext,
    ) -> Result<SearchResponse>;

    async fn execute(
        &self,
        node: &Node,
        request: &ActionRequest,
        ctx: &CallContext,
    ) -> Result<ActionResponse>;
}

/// reqwest-backed transport
pub struct HttpNodeClient {
    http: Client,
    auth: Arc<AuthService>,
    local_node_id: String,
}

impl HttpNodeClient {
    pub fn new(auth: Arc<AuthService>, local_node_id: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("nodemesh/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            auth,
            local_node_id: local_node_id.into(),
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        let (token, _) = self.auth.issue_access_token(&self.local_node_id)?;
        Ok(builder.bearer_auth(token))
    }

    fn with_context(builder: RequestBuilder, ctx: &CallContext) -> RequestBuilder {
        builder
            .timeout(ctx.timeout)
            .header(CORRELATION_ID_HEADER, &ctx.correlation_id)
            .header(REQUEST_ID_HEADER, &ctx.request_id)
    }

    async fn check(node: &Node, resp: Response) -> Result<Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY {
            let mut cut = MAX_ERROR_BODY;
            while !body.is_char_boundary(cut) {
                cut -= 1;
            }
            body.truncate(cut);
        }
        Err(Error::RemoteStatus {
            node_id: node.id.clone(),
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl NodeTransport for HttpNodeClient {
    async fn ping(&self, node: &Node, timeout: Duration) -> Result<HealthResponse> {
        let url = format!("{}/health", node.base_url());
        debug!("Pinging node {} at {}", node.id, url);
        let resp = self.http.get(&url).timeout(timeout).send().await?;
        let resp = Self::check(node, resp).await?;
        Ok(resp.json().await?)
    }

    async fn search(
        &self,
        node: &Node,
        request: &SearchRequest,
        ctx: &CallContext,
    ) -> Result<SearchResponse> {
        let url = format!("{}/search", node.base_url());
        let builder = Self::with_context(self.http.post(&url).json(request), ctx);
        let resp = self.authorized(builder)?.send().await?;
        let resp = Self::check(node, resp).await?;
        Ok(resp.json().await?)
    }

    async fn execute(
        &self,
        node: &Node,
        request: &ActionRequest,
        ctx: &CallContext,
    ) -> Result<ActionResponse> {
        let url = format!("{}/actions", node.base_url());
        let builder = Self::with_context(self.http.post(&url).json(request), ctx);
        let resp = self.authorized(builder)?.send().await?;
        let resp = Self::check(node, resp).await?;
        Ok(resp.json().await?)
    }
}
