//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde_json::{Value, json};
use tower_http::{catch_panic::CatchPanicLayer, compression::CompressionLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::rpc::{InboundMessage, parse_request};
use crate::auth::{AuthGate, Principal, auth_middleware};
use crate::connection::ConnectionManager;
use crate::error::{AuthError, rpc_codes};
use crate::protocol::{
    Info, InitializeResult, JsonRpcResponse, RequestId, ServerCapabilities, ToolsCallParams,
    ToolsCapability, ToolsListResult, negotiate_version,
};
use crate::routing::{CallContext, ToolRouter};
use crate::scheduler::{ScheduleError, TriggerRegistry, TriggerSpec};
use crate::store::{BackendAuth, CredentialStore};
use crate::transform::TransformPipeline;
use crate::Error;

/// Session header shared with MCP clients
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Session used when a client sends none and the response header is ignored
const DEFAULT_SESSION: &str = "default";

/// Shared application state
pub struct AppState {
    /// Tool routing
    pub router: Arc<ToolRouter>,
    /// Response shaping for tool results
    pub transform: Arc<TransformPipeline>,
    /// Scheduling triggers
    pub triggers: Arc<TriggerRegistry>,
    /// Backend connections (for stats)
    pub connections: Arc<ConnectionManager>,
    /// Platform records
    pub store: Arc<dyn CredentialStore>,
    /// Externally visible base URL, no trailing slash
    pub base_url: String,
}

/// Create the router
pub fn create_router(state: Arc<AppState>, gate: Arc<AuthGate>, max_body_size: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/mcp/{endpoint_id}", post(mcp_handler))
        .route(
            "/.well-known/oauth-protected-resource/mcp/{backend_id}",
            get(protected_resource_handler),
        )
        .route("/schedules", post(register_schedule).get(list_schedules))
        .route("/schedules/{id}", delete(unregister_schedule))
        .layer(middleware::from_fn_with_state(gate, auth_middleware))
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(CatchPanicLayer::new())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Liveness plus pool and cache occupancy
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connections.stats(),
        "catalog_cache": state.router.cache().stats(),
        "triggers": state.triggers.list().len(),
    }))
}

/// JSON-RPC over `POST /mcp/{endpoint_id}`
async fn mcp_handler(
    State(state): State<Arc<AppState>>,
    Path(endpoint_id): Path<String>,
    principal: Option<Extension<Principal>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(Extension(principal)) = principal else {
        return crate::auth::unauthorized_response(&AuthError::MissingCredentials);
    };

    let requested = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    handle_rpc(&state, &endpoint_id, principal, requested, &body).await
}

fn with_session(mut response: Response, session_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(session_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    response
}

async fn handle_rpc(
    state: &AppState,
    endpoint_id: &str,
    principal: Principal,
    requested_session: Option<String>,
    body: &[u8],
) -> Response {
    let request: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            let response =
                JsonRpcResponse::error(None, rpc_codes::PARSE_ERROR, format!("Invalid JSON: {e}"));
            return (StatusCode::BAD_REQUEST, Json(response)).into_response();
        }
    };

    let message = match parse_request(&request) {
        Ok(m) => m,
        Err(response) => return (StatusCode::BAD_REQUEST, Json(response)).into_response(),
    };

    if message.is_notification() {
        debug!(method = %message.method, "Notification accepted");
        return StatusCode::ACCEPTED.into_response();
    }

    let InboundMessage { id, method, params } = message;
    let Some(id) = id else {
        return rpc_status(
            StatusCode::BAD_REQUEST,
            JsonRpcResponse::error(None, rpc_codes::INVALID_REQUEST, "Missing id"),
        );
    };

    // initialize opens a fresh session; other sessionless calls share one
    let session_id = requested_session.unwrap_or_else(|| {
        if method == "initialize" {
            Uuid::new_v4().to_string()
        } else {
            DEFAULT_SESSION.to_string()
        }
    });
    let ctx = CallContext {
        principal,
        session_id,
        correlation_id: Uuid::new_v4().to_string(),
    };

    let response = route(state, endpoint_id, &ctx, id, &method, params).await;
    with_session(response, &ctx.session_id)
}

async fn route(
    state: &AppState,
    endpoint_id: &str,
    ctx: &CallContext,
    id: RequestId,
    method: &str,
    params: Option<Value>,
) -> Response {
    match method {
        "initialize" => match state.router.endpoint(endpoint_id, &ctx.principal).await {
            Ok(_) => rpc_ok(id, initialize_result(params.as_ref())),
            Err(e) => error_response(state, Some(id), e).await,
        },
        "ping" => rpc_ok(id, json!({})),
        "tools/list" => match state.router.aggregate(endpoint_id, ctx).await {
            Ok(tools) => {
                let result = ToolsListResult {
                    tools,
                    next_cursor: None,
                };
                match serde_json::to_value(result) {
                    Ok(v) => rpc_ok(id, v),
                    Err(e) => error_response(state, Some(id), e.into()).await,
                }
            }
            Err(e) => error_response(state, Some(id), e).await,
        },
        "tools/call" => {
            let parsed = params
                .map(serde_json::from_value::<ToolsCallParams>)
                .transpose();
            let call = match parsed {
                Ok(Some(call)) => call,
                Ok(None) => {
                    return rpc_status(
                        StatusCode::BAD_REQUEST,
                        JsonRpcResponse::error(
                            Some(id),
                            rpc_codes::INVALID_PARAMS,
                            "tools/call requires params",
                        ),
                    );
                }
                Err(e) => {
                    return rpc_status(
                        StatusCode::BAD_REQUEST,
                        JsonRpcResponse::error(
                            Some(id),
                            rpc_codes::INVALID_PARAMS,
                            format!("Invalid tools/call params: {e}"),
                        ),
                    );
                }
            };
            info!(
                endpoint = endpoint_id,
                tool = %call.name,
                correlation_id = %ctx.correlation_id,
                "tools/call"
            );
            match state
                .router
                .dispatch(endpoint_id, &call.name, call.arguments, ctx)
                .await
            {
                Ok(result) => {
                    let outcome = state.transform.apply(result).await;
                    if outcome.was_converted {
                        debug!(tool = %call.name, "Result re-encoded");
                    }
                    rpc_ok(id, outcome.value)
                }
                Err(e) => error_response(state, Some(id), e).await,
            }
        }
        other => rpc_status(
            StatusCode::OK,
            JsonRpcResponse::error(
                Some(id),
                rpc_codes::METHOD_NOT_FOUND,
                format!("Method not found: {other}"),
            ),
        ),
    }
}

fn initialize_result(params: Option<&Value>) -> Value {
    let requested = params
        .and_then(|p| p.get("protocolVersion"))
        .and_then(Value::as_str);
    let result = InitializeResult {
        protocol_version: negotiate_version(requested).to_string(),
        capabilities: ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: false,
            }),
        },
        server_info: Info {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
        },
        instructions: None,
    };
    serde_json::to_value(result).unwrap_or_else(|_| json!({}))
}

fn rpc_ok(id: RequestId, result: Value) -> Response {
    rpc_status(StatusCode::OK, JsonRpcResponse::success(id, result))
}

fn rpc_status(status: StatusCode, response: JsonRpcResponse) -> Response {
    (status, Json(response)).into_response()
}

/// Metadata URL clients follow to re-authorize a backend
#[must_use]
pub fn resource_metadata_url(base_url: &str, backend_id: &str) -> String {
    format!("{base_url}/.well-known/oauth-protected-resource/mcp/{backend_id}")
}

/// Map an error to its HTTP status and JSON-RPC body.
///
/// Internal detail stays in the logs; the body only carries
/// [`Error::public_message`].
async fn error_response(state: &AppState, id: Option<RequestId>, err: Error) -> Response {
    match err {
        Error::ReAuthRequired {
            backend_id,
            user_id,
        } => {
            info!(backend = %backend_id, user = %user_id, "Re-authorization required");
            reauth_response(&state.base_url, id, &backend_id)
        }
        Error::JsonRpc {
            code,
            message,
            data,
        } => {
            let response = match data {
                Some(d) => {
                    let masked = state.transform.apply_error_data(d).await;
                    JsonRpcResponse::error_with_data(id, code, message, masked)
                }
                None => JsonRpcResponse::error(id, code, message),
            };
            rpc_status(StatusCode::OK, response)
        }
        Error::AuthRejected(reason) => {
            warn!(code = reason.code(), "Authentication failed");
            let response = JsonRpcResponse::error_with_data(
                id,
                rpc_codes::UNAUTHORIZED,
                reason.to_string(),
                json!({"code": reason.code()}),
            );
            (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(response),
            )
                .into_response()
        }
        Error::BackendUnhealthy { ref backends } => {
            warn!(backends = ?backends, "Backends unhealthy");
            let response = JsonRpcResponse::error_with_data(
                id,
                err.to_rpc_code(),
                err.public_message(),
                json!({"backends": backends}),
            );
            rpc_status(err.http_status(), response)
        }
        other => {
            let status = other.http_status();
            if status.is_server_error() {
                error!(error = %other, detail = ?other, "Request failed");
            } else {
                warn!(error = %other, "Request rejected");
            }
            rpc_status(
                status,
                JsonRpcResponse::error(id, other.to_rpc_code(), other.public_message()),
            )
        }
    }
}

/// 401 telling the client which backend needs the user to re-authorize
#[must_use]
pub fn reauth_response(base_url: &str, id: Option<RequestId>, backend_id: &str) -> Response {
    let metadata = resource_metadata_url(base_url, backend_id);
    let body = JsonRpcResponse::error_with_data(
        id,
        rpc_codes::REAUTH_REQUIRED,
        format!("Re-authorization required for backend {backend_id}"),
        json!({"type": "ReAuthRequired", "resource_metadata": metadata}),
    );
    let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer resource_metadata=\"{metadata}\"")) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

/// RFC 9728 protected-resource metadata for a delegated-auth backend
async fn protected_resource_handler(
    State(state): State<Arc<AppState>>,
    Path(backend_id): Path<String>,
) -> Response {
    let backend = match state.store.backend(&backend_id).await {
        Ok(Some(b)) if !b.deleted => b,
        Ok(_) => return not_found(&format!("backend '{backend_id}'")),
        Err(e) => {
            error!(backend = %backend_id, error = %e, "Backend lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.public_message()})),
            )
                .into_response();
        }
    };

    let BackendAuth::OAuth {
        token_endpoint,
        authorization_server,
        scopes,
        ..
    } = &backend.auth
    else {
        return not_found(&format!("backend '{backend_id}' does not use delegated auth"));
    };

    let issuer = authorization_server
        .clone()
        .or_else(|| origin_of(token_endpoint))
        .unwrap_or_else(|| token_endpoint.clone());

    let name = if backend.name.is_empty() {
        &backend.id
    } else {
        &backend.name
    };

    Json(json!({
        "resource": format!("{}/mcp/{backend_id}", state.base_url),
        "authorization_servers": [issuer],
        "scopes_supported": scopes,
        "bearer_methods_supported": ["header"],
        "resource_name": name,
    }))
    .into_response()
}

fn origin_of(endpoint: &str) -> Option<String> {
    let url = url::Url::parse(endpoint).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

fn not_found(what: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": format!("Not found: {what}")})),
    )
        .into_response()
}

/// Register a scheduling trigger; invalid cron or timezone is a 400
async fn register_schedule(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TriggerSpec>, JsonRejection>,
) -> Response {
    let spec = match payload {
        Ok(Json(spec)) => spec,
        Err(rejection) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": rejection.body_text()})),
            )
                .into_response();
        }
    };

    match state.triggers.register(spec) {
        Ok(status) => {
            info!(trigger = %status.id, state = ?status.state, "Trigger registered");
            (StatusCode::CREATED, Json(status)).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Trigger rejected");
            (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}

async fn list_schedules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.triggers.list())
}

async fn unregister_schedule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    match state.triggers.unregister(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ ScheduleError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, Json(json!({"error": e.to_string()}))).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, Json(json!({"error": e.to_string()}))).into_response(),
    }
}
