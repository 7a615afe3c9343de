//! nodemesh - master/child node coordination
//!
//! A master node keeps a registry of child nodes, fans searches out to them
//! and runs actions on them. Children register themselves and answer the
//! master's requests over the same JSON/HTTP protocol.
//!
//! # Architecture
//!
//! - **Registry**: node records, API keys, live metrics, active-node snapshots
//! - **Circuit breaker**: per-node closed/open/half-open state gating every call
//! - **Auth**: HS256 access tokens, single-use refresh tokens, API keys
//! - **Federation**: parallel fan-out with per-node timeouts, merge and dedupe
//! - **Actions**: remote actions, broadcast, transactions with compensation
//! - **Health**: periodic pings driving node status and breaker recovery
//! - **API**: axum router for the node-to-node and administration endpoints
//!
//! [`NodeMesh`] wires the components together.

pub mod actions;
pub mod api;
pub mod auth;
pub mod balancer;
pub mod cache;
pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod enrollment;
pub mod error;
pub mod federation;
pub mod health;
pub mod local;
pub mod mesh;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod selection;
pub mod trace;
pub mod types;

pub use actions::{ActionResult, RemoteActionDispatcher, TransactionResult, TransactionStep};
pub use api::ApiServer;
pub use auth::{AuthService, TokenPair};
pub use balancer::{LoadBalancer, Strategy};
pub use cache::ResultCache;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use client::{CallContext, HttpNodeClient, NodeTransport};
pub use config::Config;
pub use enrollment::Enrollment;
pub use error::{Error, Result};
pub use federation::{AggregatedResult, FederatedQuery, FederatedSearchCoordinator};
pub use health::{HealthEvent, HealthMonitor};
pub use local::{ActionRegistry, KeywordIndex, LocalSearch};
pub use mesh::NodeMesh;
pub use registry::NodeRegistry;
pub use types::*;
