//! Shared fixtures: in-process fake backends behind the real HTTP router

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tower::ServiceExt;

use mcp_hub::config::Config;
use mcp_hub::connection::TransportConnector;
use mcp_hub::credentials::{OAuthClientInfo, TokenExchanger, TokenGrant};
use mcp_hub::gateway::{AppState, Gateway};
use mcp_hub::protocol::{JsonRpcResponse, RequestId};
use mcp_hub::store::BackendServer;
use mcp_hub::transport::{OutboundHeaders, Transport};
use mcp_hub::{Error, Result};

/// Key for `u1` in `org-a`
pub const KEY_A: &str = "mcp_key_org_a";
/// Key for `u2` in `org-b`
pub const KEY_B: &str = "mcp_key_org_b";
/// Key for `u1` allowed only `echo`
pub const KEY_SCOPED: &str = "mcp_key_scoped";
/// Key for `u3` in `org-a`, who never authorized GitHub
pub const KEY_U3: &str = "mcp_key_u3";

/// One `tools/call` a fake backend received
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub backend: String,
    pub tool: String,
    pub arguments: Value,
    pub authorization: Option<String>,
}

/// Catalogs per backend id plus a log of every call.
///
/// A `tools/call` of `slow` never answers in time.
#[derive(Default)]
pub struct FakeBackends {
    catalogs: HashMap<String, Vec<Value>>,
    /// Backends whose `tools/list` fails
    broken_catalogs: HashSet<String>,
    pub calls: Mutex<Vec<RecordedCall>>,
    pub connects: AtomicUsize,
    pub lists: AtomicUsize,
}

impl FakeBackends {
    pub fn new() -> Self {
        let mut catalogs = HashMap::new();
        catalogs.insert(
            "srv1".to_string(),
            vec![
                tool("echo", "Echo the input back"),
                tool("add", "Add two numbers"),
            ],
        );
        catalogs.insert(
            "srv2".to_string(),
            vec![tool("search_web", "Search the web for pages")],
        );
        catalogs.insert(
            "gh".to_string(),
            vec![tool("create_issue", "Create a GitHub issue")],
        );
        catalogs.insert(
            "big".to_string(),
            vec![
                tool("send_email", "Send an email message to a recipient"),
                tool("list_calendar_events", "List upcoming calendar events"),
                tool("create_invoice", "Create a customer invoice"),
                tool("delete_file", "Delete a file from storage"),
            ],
        );
        Self {
            catalogs,
            ..Self::default()
        }
    }

    /// Add a tool to a backend's catalog
    pub fn with_tool(mut self, backend: &str, name: &str, description: &str) -> Self {
        self.catalogs
            .entry(backend.to_string())
            .or_default()
            .push(tool(name, description));
        self
    }

    /// Make a backend's `tools/list` fail
    pub fn with_broken_catalog(mut self, backend: &str) -> Self {
        self.broken_catalogs.insert(backend.to_string());
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }
}

fn tool(name: &str, description: &str) -> Value {
    json!({
        "name": name,
        "description": description,
        "inputSchema": {"type": "object", "properties": {"text": {"type": "string"}}}
    })
}

struct FakeTransport {
    backend: String,
    shared: Arc<FakeBackends>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &OutboundHeaders,
    ) -> Result<JsonRpcResponse> {
        let id = RequestId::Number(1);
        match method {
            "tools/list" => {
                self.shared.lists.fetch_add(1, Ordering::SeqCst);
                if self.shared.broken_catalogs.contains(&self.backend) {
                    return Err(Error::backend_protocol(&self.backend, "catalog body was not JSON"));
                }
                let tools = self
                    .shared
                    .catalogs
                    .get(&self.backend)
                    .cloned()
                    .unwrap_or_default();
                Ok(JsonRpcResponse::success(id, json!({ "tools": tools })))
            }
            "tools/call" => {
                let params = params.unwrap_or_default();
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params["arguments"].clone();
                self.shared.calls.lock().push(RecordedCall {
                    backend: self.backend.clone(),
                    tool: tool.clone(),
                    arguments: arguments.clone(),
                    authorization: headers.get("Authorization").map(str::to_string),
                });
                if tool == "slow" {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                if tool == "add" {
                    return Ok(JsonRpcResponse::error_with_data(
                        Some(id),
                        -32602,
                        "numbers required",
                        json!({"hint": "pass a and b"}),
                    ));
                }
                let text = json!({"backend": self.backend, "tool": tool, "arguments": arguments});
                Ok(JsonRpcResponse::success(
                    id,
                    json!({"content": [{"type": "text", "text": text.to_string()}], "isError": false}),
                ))
            }
            other => Err(Error::Protocol(format!("unexpected method {other}"))),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FakeConnector(pub Arc<FakeBackends>);

#[async_trait]
impl TransportConnector for FakeConnector {
    async fn connect(
        &self,
        backend: &BackendServer,
        _headers: &OutboundHeaders,
    ) -> Result<Arc<dyn Transport>> {
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeTransport {
            backend: backend.id.clone(),
            shared: Arc::clone(&self.0),
        }))
    }
}

/// Exchanger whose provider rejects every refresh
#[derive(Default)]
pub struct RejectingExchanger {
    pub calls: AtomicUsize,
}

#[async_trait]
impl TokenExchanger for RejectingExchanger {
    async fn refresh(&self, _client: &OAuthClientInfo, _refresh_token: &str) -> Result<TokenGrant> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::backend_protocol("idp", "invalid_grant"))
    }
}

pub const BASE_YAML: &str = r"
server:
  public_url: 'https://hub.example.com'
  call_timeout: 5s
auth:
  rate_limit: 0
connection:
  connect_attempts: 1
transform:
  encoding:
    enabled: false
store:
  backends:
    - id: srv1
      name: Echo server
      transport: { type: streamable_http, url: 'http://srv1.internal/mcp' }
      auth: { type: static_key, config_id: cfg1 }
    - id: srv2
      transport: { type: sse, url: 'http://srv2.internal/sse' }
    - id: gh
      name: GitHub
      transport: { type: streamable_http, url: 'http://gh.internal/mcp' }
      auth:
        type: oauth
        token_endpoint: 'https://github.example.com/login/oauth/access_token'
        client_id: hub-client
        scopes: ['repo', 'read:user']
    - id: big
      transport: { type: streamable_http, url: 'http://big.internal/mcp' }
      tool_search: true
    - id: down
      transport: { type: streamable_http, url: 'http://down.internal/mcp' }
      status: stopped
    - id: broken
      transport: { type: streamable_http, url: 'http://broken.internal/mcp' }
      status: error
    - id: gone
      transport: { type: streamable_http, url: 'http://gone.internal/mcp' }
      deleted: true
  endpoints:
    - id: ep1
      org_id: org-a
      children:
        - { backend_id: srv1, instance_name: main }
        - { backend_id: srv2, instance_name: web }
        - { backend_id: gone, instance_name: old }
    - id: ep-gh
      org_id: org-a
      children:
        - { backend_id: gh, instance_name: work }
    - id: ep-search
      org_id: org-a
      children:
        - { backend_id: big, instance_name: suite }
    - id: ep-sick
      org_id: org-a
      children:
        - { backend_id: srv1, instance_name: main }
        - { backend_id: down, instance_name: a }
        - { backend_id: broken, instance_name: b }
    - id: ep-empty
      org_id: org-a
      children:
        - { backend_id: gone, instance_name: old }
    - id: ep-b
      org_id: org-b
      children:
        - { backend_id: srv2, instance_name: web }
  api_keys:
    - { key: mcp_key_org_a, name: ci, org_id: org-a, user_id: u1 }
    - { key: mcp_key_org_b, name: other, org_id: org-b, user_id: u2 }
    - { key: mcp_key_scoped, name: scoped, org_id: org-a, user_id: u1, allowed_tools: [echo] }
    - { key: mcp_key_revoked, name: revoked, org_id: org-a, user_id: u1, active: false }
    - { key: mcp_key_stranger, name: stranger, org_id: org-a, user_id: u9 }
    - { key: mcp_key_u3, name: u3, org_id: org-a, user_id: u3 }
  users:
    - { id: u1, orgs: [org-a] }
    - { id: u2, orgs: [org-b] }
    - { id: u3, orgs: [org-a] }
    - { id: u9, orgs: [org-z] }
  oauth_tokens:
    - instance: gh
      user_id: u1
      access_token: stale
      refresh_token: r-stale
      expires_at: '2000-01-01T00:00:00Z'
  secrets:
    - backend_id: srv1
      config_id: cfg1
      values: { api_key: srv1-secret }
";

/// Hub over [`BASE_YAML`] with an optional YAML fragment merged on top
pub struct Hub {
    pub app: Router,
    pub state: Arc<AppState>,
    pub backends: Arc<FakeBackends>,
    pub exchanger: Arc<RejectingExchanger>,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        Self::with_backends(FakeBackends::new(), tweak)
    }

    pub fn with_backends(backends: FakeBackends, tweak: impl FnOnce(&mut Config)) -> Self {
        let mut config: Config = serde_yaml::from_str(BASE_YAML).unwrap();
        tweak(&mut config);
        let backends = Arc::new(backends);
        let exchanger = Arc::new(RejectingExchanger::default());
        let gateway = Gateway::with_parts(
            config,
            Arc::new(FakeConnector(Arc::clone(&backends))),
            exchanger.clone(),
        )
        .unwrap();
        Self {
            app: gateway.router(),
            state: Arc::clone(gateway.state()),
            backends,
            exchanger,
        }
    }

    /// POST a JSON-RPC body to an endpoint with an API key
    pub async fn rpc(&self, endpoint: &str, key: &str, body: Value) -> (StatusCode, HeaderMap, Value) {
        let request = Request::post(format!("/mcp/{endpoint}"))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {key}"))
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    /// Like [`Hub::rpc`], inside an existing client session
    pub async fn rpc_in(
        &self,
        session: &str,
        endpoint: &str,
        key: &str,
        body: Value,
    ) -> (StatusCode, HeaderMap, Value) {
        let request = Request::post(format!("/mcp/{endpoint}"))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {key}"))
            .header("mcp-session-id", session)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }
}

pub fn call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments}
    })
}

pub fn list(id: i64) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/list"})
}

/// Parse the JSON carried in the first text content item
pub fn text_payload(result: &Value) -> Value {
    let text = result["content"][0]["text"].as_str().unwrap();
    serde_json::from_str(text).unwrap()
}
