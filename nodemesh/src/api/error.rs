//! Error responses for the node API

use crate::error::Error;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
    status: u16,
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    #[serde(rename = "type")]
    error_type: String,
    reason: String,
    /// Step-by-step report of a transaction needing manual intervention
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<serde_json::Value>,
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::NodeNotFound(_) => StatusCode::NOT_FOUND,
            Error::DuplicateNode(_) => StatusCode::CONFLICT,
            Error::NodeUnavailable(_) | Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            Error::InvalidToken(_) | Error::ExpiredToken | Error::InvalidRefreshToken => {
                StatusCode::UNAUTHORIZED
            }
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::ActionExecution { .. }
            | Error::RemoteStatus { .. }
            | Error::Transport(_)
            | Error::SearchFailed(_) => StatusCode::BAD_GATEWAY,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Error::InvalidRequest(_) | Error::Serialization(_) => StatusCode::BAD_REQUEST,
            Error::PartialTransactionFailure(_) | Error::Config(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!("Request rejected: {}", self);
        }

        let report = match &self {
            Error::PartialTransactionFailure(result) => serde_json::to_value(result.as_ref()).ok(),
            _ => None,
        };
        let retry_after = match &self {
            Error::RateLimitExceeded { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetail {
                error_type: self.error_type().to_string(),
                reason: self.to_string(),
                report,
            },
            status: status.as_u16(),
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs.max(1)));
        }
        response
    }
}
