//! Error types for node coordination

use crate::actions::TransactionResult;
use thiserror::Error;

/// Errors that can occur while coordinating nodes
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Node already registered: {0}")]
    DuplicateNode(String),

    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    ExpiredToken,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Action '{action}' failed on node {node_id}: {reason}")]
    ActionExecution {
        node_id: String,
        action: String,
        reason: String,
    },

    #[error(
        "Transaction left {} step(s) requiring manual intervention",
        .0.manual_intervention().len()
    )]
    PartialTransactionFailure(Box<TransactionResult>),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimitExceeded { retry_after_secs: u64 },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote node {node_id} answered {status}: {body}")]
    RemoteStatus {
        node_id: String,
        status: u16,
        body: String,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::NodeNotFound(_) => "node_not_found",
            Error::DuplicateNode(_) => "duplicate_node",
            Error::NodeUnavailable(_) => "node_unavailable",
            Error::InvalidToken(_) => "invalid_token",
            Error::ExpiredToken => "expired_token",
            Error::InvalidRefreshToken => "invalid_refresh_token",
            Error::Forbidden(_) => "forbidden",
            Error::ActionExecution { .. } => "action_execution",
            Error::PartialTransactionFailure(_) => "partial_transaction_failure",
            Error::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Error::Timeout(_) => "timeout",
            Error::Transport(_) => "transport",
            Error::RemoteStatus { .. } => "remote_status",
            Error::InvalidRequest(_) => "invalid_request",
            Error::SearchFailed(_) => "search_failed",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::Serialization(_) => "serialization",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether this error says something about the health of the remote node.
    ///
    /// Transport failures, timeouts and 5xx answers count against a node's
    /// circuit breaker. A 4xx answer means the node is up and rejected the
    /// request, which is not a node fault.
    pub fn is_node_fault(&self) -> bool {
        match self {
            Error::Timeout(_) | Error::Transport(_) | Error::NodeUnavailable(_) => true,
            Error::RemoteStatus { status, .. } => *status >= 500,
            Error::Serialization(_) => true,
            _ => false,
        }
    }

    /// Whether this is an authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidToken(_) | Error::ExpiredToken | Error::InvalidRefreshToken
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Error::Timeout(err.to_string())
        } else if err.is_decode() {
            Error::Serialization(err.to_string())
        } else {
            Error::Transport(err.to_string())
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
