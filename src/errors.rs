use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Failures of a single routed call. Never fatal to the aggregator.
#[derive(Debug, Clone, Error)]
pub enum RouteError {
    #[error("invalid target `{target}`: {reason}")]
    InvalidTarget {
        target: String,
        reason: &'static str,
    },
    #[error("server `{0}` is not configured")]
    ServerNotFound(String),
    #[error("server `{server_id}` is unavailable")]
    ChildUnavailable { server_id: String },
    #[error("server `{server_id}` did not respond within {timeout:?}")]
    UpstreamTimeout { server_id: String, timeout: Duration },
    #[error("server `{server_id}` input stream is closed")]
    WriteError { server_id: String },
    #[error("invalid params: {0}")]
    InvalidParams(&'static str),
}

impl RouteError {
    pub fn invalid_target(target: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidTarget {
            target: target.into(),
            reason,
        }
    }

    pub fn child_unavailable(server_id: impl Into<String>) -> Self {
        Self::ChildUnavailable {
            server_id: server_id.into(),
        }
    }

    /// Stable machine-readable code carried in JSON-RPC `error.data.code`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidTarget { .. } => "invalid_target",
            Self::ServerNotFound(_) => "server_not_found",
            Self::ChildUnavailable { .. } | Self::WriteError { .. } => "child_unavailable",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::InvalidParams(_) => "invalid_params",
        }
    }
}

/// Transport-level failures answered with a plain HTTP error.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("bad request: {message}")]
    BadRequest {
        code: &'static str,
        message: &'static str,
    },
    #[error("not found: {message}")]
    NotFound {
        code: &'static str,
        message: &'static str,
    },
    #[error("not acceptable: {message}")]
    NotAcceptable {
        code: &'static str,
        message: &'static str,
    },
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
}

impl AppError {
    pub fn bad_request(code: &'static str, message: &'static str) -> Self {
        Self::BadRequest { code, message }
    }

    pub fn not_found(code: &'static str, message: &'static str) -> Self {
        Self::NotFound { code, message }
    }

    pub fn not_acceptable(code: &'static str, message: &'static str) -> Self {
        Self::NotAcceptable { code, message }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            Self::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            Self::NotFound { code, message } => (StatusCode::NOT_FOUND, code, message),
            Self::NotAcceptable { code, message } => (StatusCode::NOT_ACCEPTABLE, code, message),
        };

        (
            status,
            Json(ErrorResponse {
                code: code.to_string(),
                message: message.to_string(),
                details: json!({}),
            }),
        )
            .into_response()
    }
}
