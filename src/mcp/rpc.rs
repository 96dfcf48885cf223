//! JSON-RPC protocol representations and formatting utilities
//!
//! Provides the envelopes exchanged with clients and children, and the mapping
//! of routing failures onto JSON-RPC error payloads.

use rust_mcp_sdk::schema::{
    JsonrpcErrorResponse, JsonrpcResultResponse, RequestId, Result as McpResult, RpcError,
};
use serde_json::{json, Value};

use crate::errors::RouteError;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const SERVER_UNAVAILABLE: i32 = -32000;
pub const REQUEST_TIMEOUT: i32 = -32001;

pub fn is_json_rpc_error(value: &Value) -> bool {
    value.get("error").is_some()
}

pub fn route_error_to_json_rpc(id: Option<Value>, err: &RouteError) -> Value {
    let (code, message) = match err {
        RouteError::InvalidTarget { .. }
        | RouteError::ServerNotFound(_)
        | RouteError::InvalidParams(_) => (INVALID_PARAMS, "Invalid params"),
        RouteError::ChildUnavailable { .. } | RouteError::WriteError { .. } => {
            (SERVER_UNAVAILABLE, "Server unavailable")
        }
        RouteError::UpstreamTimeout { .. } => (REQUEST_TIMEOUT, "Request timed out"),
    };

    json_rpc_error_with_data(
        id,
        code,
        message,
        Some(json!({
            "code": err.code(),
            "message": err.to_string(),
            "details": {}
        })),
    )
}

pub fn json_rpc_error(id: Option<Value>, code: i32, message: &str) -> Value {
    json_rpc_error_with_data(id, code, message, None)
}

pub fn json_rpc_error_with_data(
    id: Option<Value>,
    code: i32,
    message: &str,
    data: Option<Value>,
) -> Value {
    let response = JsonrpcErrorResponse::new(
        RpcError {
            code: i64::from(code),
            data,
            message: message.to_string(),
        },
        id.as_ref().and_then(value_to_request_id),
    );
    serde_json::to_value(response).expect("jsonrpc error response serialization")
}

pub fn json_rpc_result(id: Option<Value>, result: Value) -> Value {
    if let Some(request_id) = id.as_ref().and_then(value_to_request_id) {
        let extra = result.as_object().cloned();
        let response = JsonrpcResultResponse::new(request_id, McpResult { meta: None, extra });
        return serde_json::to_value(response).expect("jsonrpc result response serialization");
    }

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

/// Re-addresses a child's response to the external caller. Everything except
/// the `id` is relayed as the child sent it.
pub fn relay_response(id: Option<Value>, mut response: Value) -> Value {
    if let Some(object) = response.as_object_mut() {
        object.insert("id".to_string(), id.unwrap_or(Value::Null));
        object
            .entry("jsonrpc")
            .or_insert_with(|| Value::String("2.0".to_string()));
    }
    response
}

pub fn json_rpc_request(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        request["params"] = params;
    }
    request
}

pub fn json_rpc_notification(method: &str, params: Option<Value>) -> Value {
    let mut notification = json!({
        "jsonrpc": "2.0",
        "method": method,
    });
    if let Some(params) = params {
        notification["params"] = params;
    }
    notification
}

pub fn value_to_request_id(value: &Value) -> Option<RequestId> {
    if let Some(string_id) = value.as_str() {
        return Some(RequestId::String(string_id.to_string()));
    }

    value.as_i64().map(RequestId::Integer)
}

pub fn request_id_to_value(id: RequestId) -> Value {
    match id {
        RequestId::String(value) => Value::String(value),
        RequestId::Integer(value) => Value::Number(value.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn route_errors_carry_stable_codes() {
        let timeout = route_error_to_json_rpc(
            Some(json!(7)),
            &RouteError::UpstreamTimeout {
                server_id: "fs".to_string(),
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(timeout["id"], 7);
        assert_eq!(timeout["error"]["code"], REQUEST_TIMEOUT);
        assert_eq!(timeout["error"]["data"]["code"], "upstream_timeout");

        let write = route_error_to_json_rpc(
            Some(json!("a")),
            &RouteError::WriteError {
                server_id: "fs".to_string(),
            },
        );
        assert_eq!(write["error"]["code"], SERVER_UNAVAILABLE);
        assert_eq!(write["error"]["data"]["code"], "child_unavailable");

        let target = route_error_to_json_rpc(
            Some(json!(1)),
            &RouteError::invalid_target("echo", "missing server prefix"),
        );
        assert_eq!(target["error"]["code"], INVALID_PARAMS);
        assert_eq!(target["error"]["data"]["code"], "invalid_target");
    }

    #[test]
    fn relay_response_only_replaces_id() {
        let child = json!({"jsonrpc": "2.0", "id": 41, "result": {"content": [], "isError": false}});
        let relayed = relay_response(Some(json!("client-1")), child);

        assert_eq!(
            relayed,
            json!({"jsonrpc": "2.0", "id": "client-1", "result": {"content": [], "isError": false}})
        );
    }

    #[test]
    fn requests_omit_absent_params() {
        let request = json_rpc_request(3, "tools/list", None);
        assert_eq!(request, json!({"jsonrpc": "2.0", "id": 3, "method": "tools/list"}));
    }
}
