//! Legacy SSE backends: POSTs are answered 202, replies travel on the event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mcp_hub::connection::{DefaultConnector, TransportConnector};
use mcp_hub::store::BackendServer;
use mcp_hub::transport::{HttpMode, HttpTransport, OutboundHeaders, Transport, into_result};

/// The open event stream, if a client connected
#[derive(Clone, Default)]
struct LegacyServer {
    stream: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

fn frame(event: &str, data: &str) -> String {
    format!("event: {event}\ndata: {data}\n\n")
}

async fn open_stream(State(server): State<LegacyServer>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(frame("endpoint", "/messages?session_id=legacy-1")).unwrap();
    *server.stream.lock() = Some(tx);

    let frames = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });
    ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(frames)).into_response()
}

async fn accept_message(State(server): State<LegacyServer>, Json(message): Json<Value>) -> StatusCode {
    let Some(id) = message.get("id").cloned() else {
        return StatusCode::ACCEPTED;
    };
    let result = match message["method"].as_str() {
        Some("initialize") => json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "legacy", "version": "0.1.0"}
        }),
        Some("tools/list") => json!({"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}),
        _ => json!({"content": [{"type": "text", "text": message["params"]["arguments"].to_string()}]}),
    };

    let stream = server.stream.lock().clone();
    if let Some(tx) = stream {
        let log = json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}});
        tx.send(frame("message", &log.to_string())).unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": id, "result": result});
        tx.send(frame("message", &reply.to_string())).unwrap();
    }
    StatusCode::ACCEPTED
}

async fn never_answer() -> StatusCode {
    tokio::time::sleep(Duration::from_secs(60)).await;
    StatusCode::OK
}

/// Serve a legacy backend; returns the URL it is configured under.
///
/// Without `hang_on_post` a streamable POST to that URL gets 405.
async fn serve(hang_on_post: bool) -> String {
    let base: MethodRouter<LegacyServer> = if hang_on_post {
        get(open_stream).post(never_answer)
    } else {
        get(open_stream)
    };
    let app = Router::new()
        .route("/mcp", base)
        .route("/messages", post(accept_message))
        .with_state(LegacyServer::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{addr}/mcp")
}

fn backend(url: &str) -> BackendServer {
    serde_json::from_value(json!({
        "id": "legacy",
        "transport": {"type": "streamable_http", "url": url}
    }))
    .unwrap()
}

#[tokio::test]
async fn sse_replies_arrive_on_the_event_stream() {
    let url = serve(false).await;
    let transport =
        HttpTransport::new("legacy", &url, HttpMode::Sse, OutboundHeaders::new(), Duration::from_secs(2)).unwrap();
    transport.initialize().await.unwrap();
    assert!(transport.is_connected());

    let headers = OutboundHeaders::new();
    let tools = into_result(transport.request("tools/list", None, &headers).await.unwrap()).unwrap();
    assert_eq!(tools["tools"][0]["name"], "echo");

    let params = json!({"name": "echo", "arguments": {"text": "hi"}});
    let called = into_result(transport.request("tools/call", Some(params), &headers).await.unwrap()).unwrap();
    assert_eq!(called["content"][0]["text"], r#"{"text":"hi"}"#);

    transport.close().await.unwrap();
    assert!(!transport.is_connected());
}

#[tokio::test]
async fn streamable_backend_falls_back_to_sse() {
    let url = serve(false).await;
    let connector = DefaultConnector::new(Duration::from_secs(2));
    let transport = connector
        .connect(&backend(&url), &OutboundHeaders::new())
        .await
        .unwrap();
    assert_eq!(transport.kind(), "sse");

    let tools = into_result(
        transport
            .request("tools/list", None, &OutboundHeaders::new())
            .await
            .unwrap(),
    )
    .unwrap();
    assert_eq!(tools["tools"][0]["name"], "echo");
}

#[tokio::test]
async fn hanging_streamable_attempt_leaves_budget_for_sse() {
    let url = serve(true).await;
    let connector = DefaultConnector::new(Duration::from_millis(500));
    let transport = connector
        .connect(&backend(&url), &OutboundHeaders::new())
        .await
        .unwrap();
    assert_eq!(transport.kind(), "sse");
}
