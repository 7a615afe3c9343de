//! JSON/HTTP node API

mod error;
pub mod middleware;
pub mod routes;
pub mod server;

pub use routes::{
    FederatedActionRequest, FederatedActionResponse, NodesList, RefreshRequest, RequestsList,
    TransactionRequest, CACHE_STATUS_HEADER, REGISTRATION_TOKEN_HEADER,
};
pub use server::ApiServer;
