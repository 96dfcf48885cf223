//! Axum HTTP handlers for the web server
//!
//! Provides the Streamable HTTP endpoint on `/` (POST, GET, DELETE) and the
//! health endpoint.

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{future::join_all, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::errors::AppError;
use crate::http::sessions::{event_stream, message_event, SESSION_HEADER};
use crate::mcp::rpc::{json_rpc_error, INVALID_REQUEST, PARSE_ERROR};
use crate::mcp::server::handle_json_rpc_value;
use crate::registry::{ServerStatus, SessionState};
use crate::AppState;

const EVENT_STREAM: &str = "text/event-stream";
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let servers = state.registry.statuses();
    let status = if servers
        .iter()
        .all(|server| server.state == SessionState::Ready)
    {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse { status, servers })
}

pub async fn mcp_post(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session_id = session_id(&headers, query);
    if let Some(session_id) = session_id.as_deref() {
        if !state.sessions.contains(session_id) {
            return AppError::not_found("unknown_session", "no open SSE session with this id")
                .into_response();
        }
    }

    let response = match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => process_payload(&state, payload).await,
        Err(_) => Some(json_rpc_error(None, PARSE_ERROR, "Parse error")),
    };

    let Some(response) = response else {
        return StatusCode::ACCEPTED.into_response();
    };

    if let Some(session_id) = session_id.as_deref() {
        if !state.sessions.push(session_id, response) {
            debug!(session_id, "session closed before its response was delivered");
        }
        return StatusCode::ACCEPTED.into_response();
    }

    if prefers_event_stream(&headers) {
        let events = stream::iter([Ok::<_, std::convert::Infallible>(message_event(&response))]);
        return Sse::new(events).into_response();
    }

    (StatusCode::OK, Json(response)).into_response()
}

/// Handles a single message or a batch. `None` when nothing needs answering.
async fn process_payload(state: &AppState, payload: Value) -> Option<Value> {
    let Value::Array(batch) = payload else {
        return handle_json_rpc_value(state, payload).await;
    };

    if batch.is_empty() {
        return Some(Value::Array(vec![json_rpc_error(
            None,
            INVALID_REQUEST,
            "Invalid Request",
        )]));
    }

    let responses: Vec<Value> = join_all(
        batch
            .into_iter()
            .map(|item| handle_json_rpc_value(state, item)),
    )
    .await
    .into_iter()
    .flatten()
    .collect();

    if responses.is_empty() {
        None
    } else {
        Some(Value::Array(responses))
    }
}

pub async fn mcp_get(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !accepts(&headers, EVENT_STREAM) {
        return AppError::not_acceptable(
            "event_stream_required",
            "GET requires Accept: text/event-stream",
        )
        .into_response();
    }

    let session = state.sessions.open();
    let Ok(session_header) = HeaderValue::from_str(&session.id) else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let stream = event_stream(session, state.registry.subscribe());

    (
        [(SESSION_HEADER, session_header)],
        Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)),
    )
        .into_response()
}

pub async fn mcp_delete(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = session_id(&headers, query) else {
        return AppError::bad_request("missing_session", "Mcp-Session-Id header is required")
            .into_response();
    };

    if state.sessions.close(&session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        AppError::not_found("unknown_session", "no open SSE session with this id").into_response()
    }
}

/// Session named by the `Mcp-Session-Id` header or the `sessionId` query.
fn session_id(headers: &HeaderMap, query: SessionQuery) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
        .or(query.session_id)
}

fn accepts(headers: &HeaderMap, media_type: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|item| item.split(';').next().unwrap_or_default().trim())
        .any(|item| item.eq_ignore_ascii_case(media_type))
}

fn prefers_event_stream(headers: &HeaderMap) -> bool {
    accepts(headers, EVENT_STREAM) && !accepts(headers, "application/json")
}
