//! JSON-RPC framing for inbound MCP requests

use serde_json::Value;

use crate::error::rpc_codes;
use crate::protocol::{JsonRpcResponse, RequestId};

/// A well-formed inbound message
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Absent for notifications
    pub id: Option<RequestId>,
    /// Method name
    pub method: String,
    /// Params, if any
    pub params: Option<Value>,
}

impl InboundMessage {
    /// Notifications get 202 and no body, with or without an id
    #[must_use]
    pub fn is_notification(&self) -> bool {
        is_notification_method(&self.method)
    }
}

pub(crate) fn extract_request_id(value: &Value) -> Option<RequestId> {
    match value {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .map(RequestId::Number),
        _ => None,
    }
}

fn is_notification_method(method: &str) -> bool {
    method.starts_with("notifications/")
}

/// Validate the envelope of a parsed JSON body
pub fn parse_request(value: &Value) -> Result<InboundMessage, JsonRpcResponse> {
    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Invalid JSON-RPC version",
        ));
    }

    let id = value.get("id").and_then(extract_request_id);

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            JsonRpcResponse::error(id.clone(), rpc_codes::INVALID_REQUEST, "Missing method")
        })?;

    if !is_notification_method(method) && id.is_none() {
        return Err(JsonRpcResponse::error(
            None,
            rpc_codes::INVALID_REQUEST,
            "Missing id",
        ));
    }

    Ok(InboundMessage {
        id,
        method: method.to_string(),
        params: value.get("params").cloned(),
    })
}
