//! Inbound authentication and delegated re-authorization, end to end

mod common;

use std::sync::atomic::Ordering;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::json;

use common::{Hub, KEY_A, KEY_U3, call, list};

fn code_of(body: &serde_json::Value) -> &str {
    body["error"]["data"]["code"].as_str().unwrap_or_default()
}

#[tokio::test]
async fn missing_credentials_hint_both_forms() {
    let hub = Hub::new();
    let request = Request::post("/mcp/ep1")
        .body(Body::from(list(1).to_string()))
        .unwrap();
    let (status, headers, body) = hub.send(request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(headers.get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    assert_eq!(code_of(&body), "missing_credentials");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("Authorization: Bearer"));
    assert!(message.contains("X-API-Key"));
}

#[tokio::test]
async fn api_key_header_is_accepted() {
    let hub = Hub::new();
    let request = Request::post("/mcp/ep1")
        .header("x-api-key", KEY_A)
        .body(Body::from(list(1).to_string()))
        .unwrap();
    let (status, _, body) = hub.send(request).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["result"]["tools"].is_array());
}

#[tokio::test]
async fn unknown_and_revoked_keys_are_indistinguishable() {
    let hub = Hub::new();
    let (status_unknown, _, unknown) = hub.rpc("ep1", "mcp_not_a_key", list(1)).await;
    let (status_revoked, _, revoked) = hub.rpc("ep1", "mcp_key_revoked", list(1)).await;

    assert_eq!(status_unknown, StatusCode::UNAUTHORIZED);
    assert_eq!(status_revoked, StatusCode::UNAUTHORIZED);
    assert_eq!(unknown["error"], revoked["error"]);
    assert_eq!(code_of(&unknown), "invalid_api_key");
}

#[tokio::test]
async fn garbage_bearer_is_malformed() {
    let hub = Hub::new();
    let (status, _, body) = hub.rpc("ep1", "not-a-token", list(1)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(code_of(&body), "token_malformed");
}

#[tokio::test]
async fn key_for_a_non_member_is_rejected() {
    let hub = Hub::new();
    let (status, _, body) = hub.rpc("ep1", "mcp_key_stranger", list(1)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(code_of(&body), "not_org_member");
}

#[tokio::test]
async fn rate_limit_applies_per_principal() {
    let hub = Hub::with_config(|c| c.auth.rate_limit = 2);
    for _ in 0..2 {
        let (status, _, _) = hub.rpc("ep1", KEY_A, list(1)).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) = hub.rpc("ep1", KEY_A, list(1)).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers.get(header::RETRY_AFTER).unwrap(), "60");
    assert_eq!(body["error"]["code"], -32004);

    // Another principal has its own bucket
    let (status, _, _) = hub.rpc("ep1", KEY_U3, list(1)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_delegated_token_requires_reauth() {
    let hub = Hub::new();
    let (status, headers, body) = hub
        .rpc("ep-gh", KEY_U3, call(4, "gh__work__create_issue", json!({})))
        .await;

    let metadata = "https://hub.example.com/.well-known/oauth-protected-resource/mcp/gh";
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(
        headers.get(header::WWW_AUTHENTICATE).unwrap(),
        &format!("Bearer resource_metadata=\"{metadata}\"")
    );
    assert_eq!(body["id"], 4);
    assert_eq!(body["error"]["code"], -32010);
    assert_eq!(
        body["error"]["data"],
        json!({"type": "ReAuthRequired", "resource_metadata": metadata})
    );
    assert_eq!(hub.exchanger.calls.load(Ordering::SeqCst), 0);
    assert!(hub.backends.calls().is_empty());
}

#[tokio::test]
async fn rejected_refresh_requires_reauth() {
    let hub = Hub::new();
    let (status, _, body) = hub.rpc("ep-gh", KEY_A, list(1)).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], -32010);
    assert_eq!(hub.exchanger.calls.load(Ordering::SeqCst), 1);
    assert_eq!(hub.backends.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn protected_resource_metadata_is_public() {
    let hub = Hub::new();
    let request = Request::get("/.well-known/oauth-protected-resource/mcp/gh")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = hub.send(request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resource"], "https://hub.example.com/mcp/gh");
    assert_eq!(
        body["authorization_servers"],
        json!(["https://github.example.com"])
    );
    assert_eq!(body["scopes_supported"], json!(["repo", "read:user"]));
    assert_eq!(body["resource_name"], "GitHub");
}

#[tokio::test]
async fn metadata_only_exists_for_delegated_backends() {
    let hub = Hub::new();
    for path in [
        "/.well-known/oauth-protected-resource/mcp/srv1",
        "/.well-known/oauth-protected-resource/mcp/unknown",
    ] {
        let request = Request::get(path).body(Body::empty()).unwrap();
        let (status, _, _) = hub.send(request).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
    }
}
