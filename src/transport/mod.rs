//! Transport implementations for MCP backends

mod http;
mod stdio;

pub use self::http::{HttpMode, HttpTransport};
pub use self::stdio::StdioTransport;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::protocol::{
    ClientCapabilities, Info, InitializeParams, JsonRpcResponse, PROTOCOL_VERSION,
};
use crate::{Error, Result};

/// Headers attached to every backend request on behalf of the caller.
///
/// Values are credentials; `Debug` never prints them.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OutboundHeaders(BTreeMap<String, String>);

impl OutboundHeaders {
    /// No headers
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Header value by exact name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterate over name/value pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// No headers set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of headers
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Debug for OutboundHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

impl FromIterator<(String, String)> for OutboundHeaders {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Transport trait for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for response
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &OutboundHeaders,
    ) -> Result<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()>;

    /// Check if transport is connected
    fn is_connected(&self) -> bool;

    /// Transport kind (`streamable-http`, `sse`, `stdio`)
    fn kind(&self) -> &'static str;

    /// Close the transport
    async fn close(&self) -> Result<()>;
}

/// `initialize` params sent by the hub when it connects to a backend
#[must_use]
pub fn initialize_params() -> Value {
    let params = InitializeParams {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: ClientCapabilities::default(),
        client_info: Info {
            name: "mcp-hub".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
        },
    };
    serde_json::to_value(params).unwrap_or_else(|_| json!({}))
}

/// Unwrap a JSON-RPC response into its result, surfacing backend errors
pub fn into_result(response: JsonRpcResponse) -> Result<Value> {
    if let Some(err) = response.error {
        return Err(Error::JsonRpc {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    #[test]
    fn debug_hides_header_values() {
        let mut headers = OutboundHeaders::new();
        headers.insert("Authorization", "Bearer secret-token");
        let printed = format!("{headers:?}");
        assert!(printed.contains("Authorization"));
        assert!(!printed.contains("secret-token"));
    }

    #[test]
    fn handshake_announces_the_hub() {
        let params = initialize_params();
        assert_eq!(params["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(params["capabilities"], json!({}));
        assert_eq!(params["clientInfo"]["name"], "mcp-hub");
        assert!(params["clientInfo"].get("title").is_none());
    }

    #[test]
    fn into_result_maps_rpc_errors() {
        let ok = JsonRpcResponse::success(RequestId::Number(1), json!({"tools": []}));
        assert_eq!(into_result(ok).unwrap()["tools"], json!([]));

        let err = JsonRpcResponse::error(Some(RequestId::Number(2)), -32602, "bad args");
        match into_result(err) {
            Err(Error::JsonRpc { code, message, .. }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad args");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
