//! HTTP/SSE transport implementation
//!
//! Streamable HTTP posts JSON-RPC straight to the backend URL. SSE mode
//! opens the event stream, reads the `endpoint` event, then posts to the
//! announced message URL; replies come back as `message` events on the
//! still-open stream and are matched to waiting requests by id. Either way
//! the `MCP-Session-Id` returned by the backend is echoed on every later
//! request.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{OutboundHeaders, Transport, initialize_params, into_result};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION, RequestId};
use crate::{Error, Result};

const SESSION_HEADER: &str = "mcp-session-id";
const VERSION_HEADER: &str = "mcp-protocol-version";

type Pending = DashMap<String, oneshot::Sender<JsonRpcResponse>>;

/// HTTP flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMode {
    /// Direct POST
    Streamable,
    /// SSE handshake, then POST
    Sse,
}

impl HttpMode {
    /// Transport kind label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Streamable => "streamable-http",
            Self::Sse => "sse",
        }
    }
}

/// HTTP transport for MCP servers using SSE or Streamable HTTP protocol
pub struct HttpTransport {
    backend_id: String,
    client: Client,
    base_url: String,
    /// Message endpoint (from the SSE handshake, or `base_url` for streamable)
    message_url: RwLock<Option<String>>,
    /// Headers sent on the handshake and as defaults on every request
    headers: OutboundHeaders,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<String>,
    request_id: AtomicI64,
    connected: Arc<AtomicBool>,
    /// Requests waiting for their reply on the event stream, keyed by id
    pending: Arc<Pending>,
    /// Event stream reader (SSE mode only)
    reader: Mutex<Option<JoinHandle<()>>>,
    mode: HttpMode,
}

impl HttpTransport {
    /// Build a transport without connecting
    pub fn new(
        backend_id: &str,
        url: &str,
        mode: HttpMode,
        headers: OutboundHeaders,
        connect_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client build failed: {e}")))?;

        Ok(Arc::new(Self {
            backend_id: backend_id.to_string(),
            client,
            base_url: url.to_string(),
            message_url: RwLock::new(None),
            headers,
            session_id: RwLock::new(None),
            protocol_version: RwLock::new(PROTOCOL_VERSION.to_string()),
            request_id: AtomicI64::new(1),
            connected: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(DashMap::new()),
            reader: Mutex::new(None),
            mode,
        }))
    }

    /// Perform the handshake and MCP `initialize`
    pub async fn initialize(&self) -> Result<()> {
        match self.mode {
            HttpMode::Streamable => {
                *self.message_url.write() = Some(self.base_url.clone());
                debug!(backend = %self.backend_id, url = %self.base_url, "Streamable HTTP mode - direct POST");
            }
            HttpMode::Sse => {
                let endpoint = self.establish_sse_connection().await?;
                let message_url = self.resolve_message_url(&endpoint)?;
                info!(backend = %self.backend_id, message_url = %message_url, "SSE handshake complete");
                *self.message_url.write() = Some(message_url);
            }
        }

        let request = JsonRpcRequest::new(RequestId::Number(0), "initialize", Some(initialize_params()));
        let result = into_result(self.send_request(&request, &OutboundHeaders::new()).await?)
            .map_err(|e| self.protocol_error(format!("Initialize failed: {e:?}")))?;

        if let Some(version) = result.get("protocolVersion").and_then(Value::as_str) {
            *self.protocol_version.write() = version.to_string();
        }

        self.notify("notifications/initialized", None).await?;
        self.connected.store(true, Ordering::Relaxed);
        debug!(backend = %self.backend_id, mode = self.mode.as_str(), "HTTP transport initialized");
        Ok(())
    }

    fn unreachable(&self, detail: impl ToString) -> Error {
        Error::unreachable(&self.backend_id, detail)
    }

    fn protocol_error(&self, detail: impl ToString) -> Error {
        Error::backend_protocol(&self.backend_id, detail)
    }

    /// Open the event stream and read it until the `endpoint` event arrives.
    ///
    /// The stream stays open afterwards: a reader task routes every later
    /// `message` event to the request waiting for it.
    async fn establish_sse_connection(&self) -> Result<String> {
        let mut headers = self.build_headers(&OutboundHeaders::new())?;
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self
            .client
            .get(&self.base_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| self.unreachable(format!("SSE connection failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, "SSE endpoint"));
        }

        let reader = EventReader {
            backend_id: self.backend_id.clone(),
            pending: Arc::clone(&self.pending),
            connected: Arc::clone(&self.connected),
        };
        let mut stream = Box::pin(response.bytes_stream());
        let mut decoder = SseDecoder::default();
        let endpoint = loop {
            let chunk = match stream.next().await {
                Some(chunk) => chunk.map_err(|e| self.unreachable(format!("SSE read failed: {e}")))?,
                None => return Err(self.protocol_error("SSE stream ended without endpoint event")),
            };
            let mut endpoint = None;
            for event in decoder.feed(&chunk) {
                if endpoint.is_none() && event.name == "endpoint" {
                    endpoint = Some(event.data);
                } else {
                    reader.dispatch(&event);
                }
            }
            if let Some(endpoint) = endpoint {
                break endpoint;
            }
        };

        self.capture_query_session(&endpoint);
        *self.reader.lock() = Some(tokio::spawn(reader.run(stream, decoder)));
        Ok(endpoint)
    }

    /// Some SSE servers carry the session in the endpoint query string
    fn capture_query_session(&self, endpoint: &str) {
        let parsed = Url::parse(endpoint).or_else(|_| Url::parse(&format!("http://localhost{endpoint}")));
        if let Ok(url) = parsed {
            if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == "session_id" || k == "sessionId") {
                *self.session_id.write() = Some(value.to_string());
            }
        }
    }

    /// Resolve a potentially relative message URL against the SSE URL
    fn resolve_message_url(&self, endpoint: &str) -> Result<String> {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(endpoint.to_string());
        }
        let base = Url::parse(&self.base_url)
            .map_err(|e| Error::Config(format!("Invalid SSE URL: {e}")))?;
        base.join(endpoint)
            .map(|u| u.to_string())
            .map_err(|e| self.protocol_error(format!("Invalid endpoint event '{endpoint}': {e}")))
    }

    fn message_url(&self) -> String {
        self.message_url
            .read()
            .clone()
            .unwrap_or_else(|| self.base_url.clone())
    }

    /// Connection defaults, then per-call overrides, then protocol headers
    fn build_headers(&self, overrides: &OutboundHeaders) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in self.headers.iter().chain(overrides.iter()) {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("Invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("Invalid value for header '{name}'")))?;
            headers.insert(name, value);
        }

        if let Ok(v) = HeaderValue::from_str(&self.protocol_version.read()) {
            headers.insert(VERSION_HEADER, v);
        }
        if let Some(session) = self.session_id.read().as_deref() {
            if let Ok(v) = HeaderValue::from_str(session) {
                headers.insert(SESSION_HEADER, v);
            }
        }
        Ok(headers)
    }

    fn status_error(&self, status: StatusCode, what: &str) -> Error {
        if status.is_server_error() || status == StatusCode::NOT_FOUND {
            self.unreachable(format!("{what} returned {status}"))
        } else {
            self.protocol_error(format!("{what} returned {status}"))
        }
    }

    /// Register a waiter for a reply delivered on the event stream
    fn await_event(&self, id: &RequestId) -> EventWaiter<'_> {
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);
        EventWaiter {
            pending: &self.pending,
            key,
            rx,
        }
    }

    async fn send_request(
        &self,
        request: &JsonRpcRequest,
        overrides: &OutboundHeaders,
    ) -> Result<JsonRpcResponse> {
        let url = self.message_url();
        let mut headers = self.build_headers(overrides)?;
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        // Registered before the POST so a fast reply cannot be missed
        let waiter = (self.mode == HttpMode::Sse).then(|| self.await_event(&request.id));

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(request)
            .send()
            .await
            .map_err(|e| self.unreachable(format!("POST {url} failed: {e}")))?;

        if let Some(id) = response.headers().get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            let mut session = self.session_id.write();
            if session.as_deref() != Some(id) {
                debug!(backend = %self.backend_id, "Stored backend session id");
                *session = Some(id.to_string());
            }
        }

        let status = response.status();
        if !status.is_success() {
            return Err(self.status_error(status, "Backend"));
        }

        let is_sse = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let text = response
            .text()
            .await
            .map_err(|e| self.unreachable(format!("Response read failed: {e}")))?;

        if status == StatusCode::ACCEPTED || text.trim().is_empty() {
            let Some(mut waiter) = waiter else {
                return Err(self.protocol_error(format!("Backend answered {status} without a response")));
            };
            trace!(backend = %self.backend_id, id = %request.id, "Waiting for reply on event stream");
            return (&mut waiter.rx)
                .await
                .map_err(|_| self.unreachable("SSE stream closed before responding"));
        }

        if is_sse {
            parse_sse_response(&text, &request.id)
                .ok_or_else(|| self.protocol_error("No JSON-RPC response in event stream"))
        } else {
            serde_json::from_str(&text)
                .map_err(|e| self.protocol_error(format!("Invalid JSON-RPC response: {e}")))
        }
    }

    fn stop_reader(&self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}

/// Removes its pending entry however the request ends
struct EventWaiter<'a> {
    pending: &'a Pending,
    key: String,
    rx: oneshot::Receiver<JsonRpcResponse>,
}

impl Drop for EventWaiter<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
struct SseEvent {
    name: String,
    data: String,
}

/// Incremental `text/event-stream` parser
#[derive(Default)]
struct SseDecoder {
    buffer: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    /// Consume a chunk; returns every event it completed
    fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                if !self.data.is_empty() {
                    events.push(SseEvent {
                        name: self.name.take().unwrap_or_else(|| "message".to_string()),
                        data: self.data.join("\n"),
                    });
                }
                self.name = None;
                self.data.clear();
            } else if let Some(name) = line.strip_prefix("event:") {
                self.name = Some(name.trim().to_string());
            } else if let Some(data) = line.strip_prefix("data:") {
                self.data.push(data.strip_prefix(' ').unwrap_or(data).to_string());
            }
        }
        events
    }
}

/// Routes replies from the event stream to their waiting requests
struct EventReader {
    backend_id: String,
    pending: Arc<Pending>,
    connected: Arc<AtomicBool>,
}

impl EventReader {
    async fn run<S, B>(self, mut stream: S, mut decoder: SseDecoder)
    where
        S: Stream<Item = reqwest::Result<B>> + Unpin,
        B: AsRef<[u8]>,
    {
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(chunk) => {
                    for event in decoder.feed(chunk.as_ref()) {
                        self.dispatch(&event);
                    }
                }
                Err(e) => {
                    debug!(backend = %self.backend_id, error = %e, "SSE read failed");
                    break;
                }
            }
        }
        self.connected.store(false, Ordering::Relaxed);
        // Wake every waiter: their senders drop here
        self.pending.clear();
        debug!(backend = %self.backend_id, "SSE reader task ended");
    }

    fn dispatch(&self, event: &SseEvent) {
        if event.name != "message" {
            trace!(backend = %self.backend_id, event = %event.name, "Ignoring SSE event");
            return;
        }
        match serde_json::from_str::<JsonRpcResponse>(&event.data) {
            Ok(response) if response.result.is_some() || response.error.is_some() => {
                let Some(id) = response.id.as_ref().map(ToString::to_string) else {
                    return;
                };
                if let Some((_, sender)) = self.pending.remove(&id) {
                    let _ = sender.send(response);
                } else {
                    trace!(backend = %self.backend_id, id = %id, "No request waiting for reply");
                }
            }
            Ok(_) => trace!(backend = %self.backend_id, "Ignoring backend notification"),
            Err(e) => warn!(backend = %self.backend_id, error = %e, "Unparsable SSE message"),
        }
    }
}

/// Pick the response matching `id` out of an event-stream body
fn parse_sse_response(body: &str, id: &RequestId) -> Option<JsonRpcResponse> {
    let mut fallback = None;
    for line in body.lines() {
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let Ok(response) = serde_json::from_str::<JsonRpcResponse>(data.trim()) else {
            continue;
        };
        if response.id.as_ref() == Some(id) {
            return Some(response);
        }
        fallback.get_or_insert(response);
    }
    fallback
}

#[async_trait]
impl Transport for HttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        headers: &OutboundHeaders,
    ) -> Result<JsonRpcResponse> {
        let request = JsonRpcRequest::new(self.next_id(), method, params);
        self.send_request(&request, headers).await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let url = self.message_url();
        let mut headers = self.build_headers(&OutboundHeaders::new())?;
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&JsonRpcNotification::new(method, params))
            .send()
            .await
            .map_err(|e| self.unreachable(format!("Notification failed: {e}")))?;

        if !response.status().is_success() {
            warn!(backend = %self.backend_id, status = %response.status(), method, "Notification rejected");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn kind(&self) -> &'static str {
        self.mode.as_str()
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        self.stop_reader();
        self.pending.clear();

        // Streamable servers free the session on DELETE
        let session = self.session_id.read().clone();
        if let (HttpMode::Streamable, Some(id)) = (self.mode, session) {
            match self
                .client
                .delete(self.message_url())
                .header(SESSION_HEADER, id)
                .send()
                .await
            {
                Ok(response) if !response.status().is_success() => {
                    debug!(backend = %self.backend_id, status = %response.status(), "Session DELETE rejected");
                }
                Ok(_) => {}
                Err(e) => debug!(backend = %self.backend_id, error = %e, "Session DELETE failed"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport(mode: HttpMode) -> Arc<HttpTransport> {
        let mut headers = OutboundHeaders::new();
        headers.insert("Authorization", "Bearer default");
        HttpTransport::new("srv", "http://localhost:9000/sse", mode, headers, Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn relative_endpoint_resolves_against_sse_url() {
        let t = transport(HttpMode::Sse);
        assert_eq!(
            t.resolve_message_url("/messages?session_id=abc").unwrap(),
            "http://localhost:9000/messages?session_id=abc"
        );
        assert_eq!(
            t.resolve_message_url("https://other/msg").unwrap(),
            "https://other/msg"
        );
    }

    #[test]
    fn endpoint_query_session_is_captured() {
        let t = transport(HttpMode::Sse);
        t.capture_query_session("/messages?session_id=abc123");
        assert_eq!(t.session_id.read().as_deref(), Some("abc123"));
    }

    #[test]
    fn per_call_headers_override_defaults() {
        let t = transport(HttpMode::Streamable);
        let mut overrides = OutboundHeaders::new();
        overrides.insert("Authorization", "Bearer fresh");
        overrides.insert("X-Team", "core");
        let headers = t.build_headers(&overrides).unwrap();
        assert_eq!(headers["authorization"], "Bearer fresh");
        assert_eq!(headers["x-team"], "core");
        assert_eq!(headers[VERSION_HEADER], PROTOCOL_VERSION);
    }

    #[test]
    fn invalid_header_name_is_rejected() {
        let t = transport(HttpMode::Streamable);
        let mut overrides = OutboundHeaders::new();
        overrides.insert("bad header", "x");
        assert!(matches!(t.build_headers(&overrides), Err(Error::Config(_))));
    }

    #[test]
    fn sse_body_matches_request_id() {
        let body = format!(
            "event: message\ndata: {}\n\nevent: message\ndata: {}\n\n",
            json!({"jsonrpc": "2.0", "method": "notifications/progress"}),
            json!({"jsonrpc": "2.0", "id": 5, "result": {"ok": true}}),
        );
        let resp = parse_sse_response(&body, &RequestId::Number(5)).unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn server_errors_count_as_unreachable() {
        let t = transport(HttpMode::Streamable);
        assert!(t.status_error(StatusCode::BAD_GATEWAY, "Backend").is_retryable());
        assert!(!t.status_error(StatusCode::BAD_REQUEST, "Backend").is_retryable());
    }

    #[test]
    fn client_statuses_are_backend_faults() {
        let t = transport(HttpMode::Streamable);
        let err = t.status_error(StatusCode::FORBIDDEN, "Backend");
        assert!(matches!(err, Error::BackendProtocol { ref backend, .. } if backend == "srv"));
        assert_eq!(err.http_status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn decoder_reassembles_split_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.feed(b"event: endpoint\nda").is_empty());
        let events = decoder.feed(b"ta: /messages?session_id=x\n\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    name: "endpoint".into(),
                    data: "/messages?session_id=x".into(),
                },
                SseEvent {
                    name: "message".into(),
                    data: "{\"a\":\n1}".into(),
                },
            ]
        );
        // Comments and bare blank lines produce nothing
        assert!(decoder.feed(b": keepalive\n\n").is_empty());
    }

    #[tokio::test]
    async fn reader_routes_replies_by_id() {
        let reader = EventReader {
            backend_id: "srv".into(),
            pending: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(true)),
        };
        let (tx, rx) = oneshot::channel();
        reader.pending.insert("7".into(), tx);

        let message = |data: Value| SseEvent {
            name: "message".into(),
            data: data.to_string(),
        };
        // A server-initiated request reusing the id is not a reply
        reader.dispatch(&message(json!({"jsonrpc": "2.0", "id": 7, "method": "ping"})));
        assert!(reader.pending.contains_key("7"));

        reader.dispatch(&message(json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}})));
        assert!(reader.pending.is_empty());
        assert_eq!(rx.await.unwrap().result.unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn closed_stream_fails_waiters() {
        let reader = EventReader {
            backend_id: "srv".into(),
            pending: Arc::new(DashMap::new()),
            connected: Arc::new(AtomicBool::new(true)),
        };
        let (tx, rx) = oneshot::channel();
        reader.pending.insert("1".into(), tx);
        let connected = Arc::clone(&reader.connected);

        let chunks: Vec<reqwest::Result<Vec<u8>>> = vec![Ok(b": hello\n\n".to_vec())];
        reader.run(futures::stream::iter(chunks), SseDecoder::default()).await;

        assert!(rx.await.is_err());
        assert!(!connected.load(Ordering::Relaxed));
    }
}
