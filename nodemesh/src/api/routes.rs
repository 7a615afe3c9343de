use crate::actions::{ActionResult, TransactionResult, TransactionStep};
use crate::auth::TokenPair;
use crate::circuit_breaker::BreakerStatistics;
use crate::client::CORRELATION_ID_HEADER;
use crate::config::NodeRole;
use crate::error::{Error, Result};
use crate::federation::FederatedQuery;
use crate::mesh::{NodeMesh, StatusReport};
use crate::trace::NodeRequestRecord;
use crate::types::{
    ActionRequest, ActionResponse, HealthResponse, Node, NodeDescriptor, NodeUpdate,
    RegistrationResponse, SearchRequest, SearchResponse,
};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const REGISTRATION_TOKEN_HEADER: &str = "x-registration-token";
pub const CACHE_STATUS_HEADER: &str = "x-cache";

fn correlation_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CORRELATION_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

pub async fn health(State(mesh): State<Arc<NodeMesh>>) -> Json<HealthResponse> {
    Json(mesh.health())
}

pub async fn register(
    State(mesh): State<Arc<NodeMesh>>,
    headers: HeaderMap,
    Json(descriptor): Json<NodeDescriptor>,
) -> Result<(StatusCode, Json<RegistrationResponse>)> {
    if mesh.role() != NodeRole::Master {
        return Err(Error::InvalidRequest(
            "registration is only accepted by master nodes".into(),
        ));
    }
    let presented = headers
        .get(REGISTRATION_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    mesh.auth().check_registration_token(presented)?;

    let verify = mesh.config().registry.verify_on_register;
    let registration = mesh.register_node(descriptor, verify).await?;
    tracing::info!(
        target: "nodemesh::audit",
        node_id = %registration.node.id,
        url = %registration.node.url,
        "Node registered"
    );
    Ok((StatusCode::CREATED, Json(registration)))
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// The refresh token may come as bearer credential or in the body
pub async fn refresh_token(
    State(mesh): State<Arc<NodeMesh>>,
    headers: HeaderMap,
    body: Option<Json<RefreshRequest>>,
) -> Result<Json<TokenPair>> {
    let from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());
    let token = body
        .and_then(|Json(b)| b.refresh_token)
        .or(from_header)
        .filter(|t| !t.is_empty())
        .ok_or(Error::InvalidRefreshToken)?;

    mesh.auth().refresh(&token).map(Json)
}

pub async fn search(
    State(mesh): State<Arc<NodeMesh>>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>> {
    mesh.local_search(request).await.map(Json)
}

pub async fn actions(
    State(mesh): State<Arc<NodeMesh>>,
    Json(request): Json<ActionRequest>,
) -> Result<Json<ActionResponse>> {
    mesh.local_action(request).await.map(Json)
}

pub async fn status(State(mesh): State<Arc<NodeMesh>>) -> Json<StatusReport> {
    Json(mesh.status())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListNodesParams {
    #[serde(default)]
    pub include_retired: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesList {
    pub nodes: Vec<Node>,
    pub count: usize,
}

pub async fn list_nodes(
    State(mesh): State<Arc<NodeMesh>>,
    Query(params): Query<ListNodesParams>,
) -> Json<NodesList> {
    let nodes = mesh.registry().list(params.include_retired);
    Json(NodesList {
        count: nodes.len(),
        nodes,
    })
}

pub async fn get_node(
    Path(id): Path<String>,
    State(mesh): State<Arc<NodeMesh>>,
) -> Result<Json<Node>> {
    mesh.registry()
        .get(&id)
        .map(Json)
        .ok_or(Error::NodeNotFound(id))
}

pub async fn update_node(
    Path(id): Path<String>,
    State(mesh): State<Arc<NodeMesh>>,
    Json(update): Json<NodeUpdate>,
) -> Result<Json<Node>> {
    mesh.update_node(&id, update).map(Json)
}

pub async fn deactivate_node(
    Path(id): Path<String>,
    State(mesh): State<Arc<NodeMesh>>,
) -> Result<Json<Node>> {
    let node = mesh.deactivate_node(&id)?;
    tracing::info!(target: "nodemesh::audit", node_id = %id, "Node deactivated");
    Ok(Json(node))
}

pub async fn reset_breaker(
    Path(id): Path<String>,
    State(mesh): State<Arc<NodeMesh>>,
) -> Result<Json<BreakerStatistics>> {
    mesh.reset_breaker(&id).map(Json)
}

/// Cache status goes in a header so repeated answers keep identical bodies
pub async fn federated_search(
    State(mesh): State<Arc<NodeMesh>>,
    headers: HeaderMap,
    Json(mut query): Json<FederatedQuery>,
) -> Result<Response> {
    if query.correlation_id.is_none() {
        query.correlation_id = correlation_id(&headers);
    }
    let outcome = mesh.federated_search(query).await?;

    let cache_status = if outcome.cache_hit { "hit" } else { "miss" };
    let mut response = Json(outcome.result.as_ref()).into_response();
    response
        .headers_mut()
        .insert(CACHE_STATUS_HEADER, HeaderValue::from_static(cache_status));
    Ok(response)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FederatedActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Run on this node only; every capable node otherwise
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default = "default_parallel")]
    pub parallel: bool,
}

fn default_parallel() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FederatedActionResponse {
    pub results: Vec<ActionResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

pub async fn federated_actions(
    State(mesh): State<Arc<NodeMesh>>,
    headers: HeaderMap,
    Json(request): Json<FederatedActionRequest>,
) -> Result<Json<FederatedActionResponse>> {
    if request.action.trim().is_empty() {
        return Err(Error::InvalidRequest("action must not be empty".into()));
    }
    let correlation = correlation_id(&headers);

    let results = match &request.node_id {
        Some(node_id) => vec![
            mesh.execute_action(
                node_id,
                &request.action,
                request.params,
                correlation.as_deref(),
            )
            .await?,
        ],
        None => {
            mesh.execute_on_all(
                &request.action,
                request.params,
                request.parallel,
                correlation.as_deref(),
            )
            .await
        }
    };

    let skipped = results.iter().filter(|r| r.skipped).count();
    let succeeded = results.iter().filter(|r| r.success).count();
    Ok(Json(FederatedActionResponse {
        failed: results.len() - succeeded - skipped,
        succeeded,
        skipped,
        results,
    }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub steps: Vec<TransactionStep>,
}

pub async fn federated_transactions(
    State(mesh): State<Arc<NodeMesh>>,
    headers: HeaderMap,
    Json(request): Json<TransactionRequest>,
) -> Result<Json<TransactionResult>> {
    let correlation = correlation_id(&headers);
    mesh.execute_transaction(request.steps, correlation.as_deref())
        .await
        .map(Json)
}

#[derive(Debug, Deserialize)]
pub struct RequestsParams {
    #[serde(default = "default_records")]
    pub limit: usize,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

fn default_records() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequestsList {
    pub records: Vec<NodeRequestRecord>,
    pub count: usize,
}

pub async fn requests(
    State(mesh): State<Arc<NodeMesh>>,
    Query(params): Query<RequestsParams>,
) -> Json<RequestsList> {
    let records = match &params.correlation_id {
        Some(id) => mesh.requests().by_correlation(id),
        None => mesh
            .requests()
            .recent(params.limit, params.node_id.as_deref()),
    };
    Json(RequestsList {
        count: records.len(),
        records,
    })
}
