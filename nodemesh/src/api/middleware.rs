use crate::auth::{Principal, Role};
use crate::client::{CORRELATION_ID_HEADER, REQUEST_ID_HEADER};
use crate::error::Error;
use crate::mesh::NodeMesh;
use crate::rate_limit::RateLimitResult;
use crate::trace::{NodeRequestRecord, RequestOutcome};
use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use std::sync::Arc;

/// Routes that do not require authentication
const AUTH_WHITELIST: &[&str] = &["/health", "/register", "/refresh-token"];

/// Node-to-node routes open to peer nodes; everything else needs an operator
const NODE_ROUTES: &[&str] = &["/search", "/actions", "/status"];

/// Routes exempt from rate limiting
const RATE_LIMIT_SKIP: &[&str] = &["/health"];

/// Node-to-node calls recorded in the request log
const AUDITED: &[(&str, &str)] = &[("/search", "search"), ("/actions", "action")];

pub(crate) fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Role required to call `path`
fn required_role(path: &str) -> Role {
    if NODE_ROUTES.contains(&path) {
        Role::Node
    } else {
        Role::Operator
    }
}

/// Client address for logging and rate limiting. `x-forwarded-for` is only
/// honoured when the server sits behind a trusted proxy.
fn client_ip(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(forwarded) = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.split(',').next())
            .map(str::trim)
            .filter(|s| !s.is_empty())
        {
            return forwarded.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn auth_middleware(
    State(mesh): State<Arc<NodeMesh>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();

    // Skip auth for whitelisted routes
    if AUTH_WHITELIST.iter().any(|w| path == *w) {
        return next.run(request).await;
    }

    let credential = match bearer_token(&request) {
        Some(c) if !c.is_empty() => c.to_string(),
        _ => return Error::InvalidToken("missing bearer token".into()).into_response(),
    };

    let trust_forwarded_for = mesh.config().server.trust_forwarded_for;
    let principal = match mesh.auth().authenticate(&credential, mesh.registry()) {
        Ok(principal) => principal,
        Err(e) => {
            tracing::warn!(
                target: "nodemesh::audit",
                path = %request.uri().path(),
                client_ip = %client_ip(&request, trust_forwarded_for),
                error = %e,
                "Rejected request"
            );
            return e.into_response();
        }
    };

    let required = required_role(request.uri().path());
    if !principal.role.permits(required) {
        tracing::warn!(
            target: "nodemesh::audit",
            path = %request.uri().path(),
            principal = %principal.id,
            role = principal.role.as_str(),
            "Denied request outside principal's role"
        );
        return Error::Forbidden(format!(
            "{} role required for {}",
            required.as_str(),
            request.uri().path()
        ))
        .into_response();
    }

    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Runs after authentication so requests are limited per principal
pub async fn rate_limit_middleware(
    State(mesh): State<Arc<NodeMesh>>,
    request: Request,
    next: Next,
) -> Response {
    let limiter = mesh.rate_limiter();
    let path = request.uri().path();
    if !limiter.is_enabled() || RATE_LIMIT_SKIP.iter().any(|s| path == *s) {
        return next.run(request).await;
    }

    let key = match request.extensions().get::<Principal>() {
        Some(p) => p.id.clone(),
        None => format!(
            "ip:{}",
            client_ip(&request, mesh.config().server.trust_forwarded_for)
        ),
    };

    match limiter.check(&key) {
        RateLimitResult::Allowed => next.run(request).await,
        RateLimitResult::RateLimited { retry_after } => {
            crate::metrics::record_rate_limited(&key);
            Error::RateLimitExceeded {
                retry_after_secs: retry_after.as_secs_f64().ceil() as u64,
            }
            .into_response()
        }
    }
}

/// Records node-to-node calls received by this node
pub async fn audit_middleware(
    State(mesh): State<Arc<NodeMesh>>,
    request: Request,
    next: Next,
) -> Response {
    let action_type = match AUDITED.iter().find(|(p, _)| request.uri().path() == *p) {
        Some((_, action)) => *action,
        None => return next.run(request).await,
    };
    let principal = match request.extensions().get::<Principal>() {
        Some(p) => p.clone(),
        None => return next.run(request).await,
    };

    // The request is borrowed here only; it must not be held across the await
    let (request_id, correlation_id) = {
        let headers = request.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        };
        let request_id =
            header(REQUEST_ID_HEADER).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let correlation_id = header(CORRELATION_ID_HEADER).unwrap_or_else(|| request_id.clone());
        (request_id, correlation_id)
    };

    let record = NodeRequestRecord::inbound(
        &request_id,
        &correlation_id,
        &principal.id,
        action_type,
        principal.method,
    );
    let response = next.run(request).await;

    let status = response.status();
    let outcome = if status.is_success() {
        RequestOutcome::Success
    } else {
        RequestOutcome::Failure {
            reason: format!("status {}", status.as_u16()),
        }
    };
    mesh.requests().record(record.finish(outcome));
    response
}
