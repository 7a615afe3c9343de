use crate::config::CorsConfig;
use crate::mesh::NodeMesh;
use crate::Result;
use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::middleware::{audit_middleware, auth_middleware, rate_limit_middleware};
use super::routes;

pub struct ApiServer {
    mesh: Arc<NodeMesh>,
    cors_config: CorsConfig,
    extra_routes: Option<Router>,
}

impl ApiServer {
    pub fn new(mesh: Arc<NodeMesh>) -> Self {
        let cors_config = mesh.config().server.cors.clone();
        Self {
            mesh,
            cors_config,
            extra_routes: None,
        }
    }

    /// Merge unauthenticated routes, e.g. a metrics endpoint
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.extra_routes = Some(routes);
        self
    }

    /// Build CORS layer from configuration
    fn build_cors_layer(&self) -> CorsLayer {
        if !self.cors_config.enabled {
            return CorsLayer::new();
        }

        let origins: Vec<HeaderValue> = self
            .cors_config
            .origins
            .iter()
            .filter(|o| *o != "*")
            .filter_map(|o| o.parse().ok())
            .collect();

        let has_wildcard = self.cors_config.origins.iter().any(|o| o == "*");

        let cors = if has_wildcard {
            CorsLayer::new().allow_origin(tower_http::cors::Any)
        } else if origins.is_empty() {
            CorsLayer::new()
        } else {
            CorsLayer::new().allow_origin(origins)
        };

        cors.allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
    }

    pub fn router(&self) -> Router {
        let state = self.mesh.clone();

        let node_routes = Router::new()
            .route("/health", get(routes::health))
            .route("/register", post(routes::register))
            .route("/refresh-token", post(routes::refresh_token))
            .route("/search", post(routes::search))
            .route("/actions", post(routes::actions))
            .route("/status", get(routes::status))
            // Master administration
            .route("/nodes", get(routes::list_nodes))
            .route(
                "/nodes/:id",
                get(routes::get_node)
                    .patch(routes::update_node)
                    .delete(routes::deactivate_node),
            )
            .route("/nodes/:id/breaker/reset", post(routes::reset_breaker))
            .route("/federated/search", post(routes::federated_search))
            .route("/federated/actions", post(routes::federated_actions))
            .route("/federated/transactions", post(routes::federated_transactions))
            .route("/requests", get(routes::requests))
            // Layers run bottom-up: auth, then rate limit, then audit
            .layer(middleware::from_fn_with_state(state.clone(), audit_middleware))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                rate_limit_middleware,
            ))
            .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
            .with_state(state);

        let mut app = Router::new().merge(node_routes);
        if let Some(extra) = &self.extra_routes {
            app = app.merge(extra.clone());
        }

        app.layer(self.build_cors_layer())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn serve(self, addr: &str) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Node API listening on {}", addr);
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(self, listener: tokio::net::TcpListener) -> Result<()> {
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .map_err(|e| crate::Error::Internal(e.to_string()))?;

        Ok(())
    }
}
