//! Error types for the MCP hub

use std::io;

use axum::http::StatusCode;
use gateway_core::ToolNameError;
use thiserror::Error;

/// Result type alias for the MCP hub
pub type Result<T> = std::result::Result<T, Error>;

/// Why an inbound caller was rejected.
///
/// Every variant maps to HTTP 401. [`AuthError::code`] gives a stable
/// diagnostic string so clients can tell the kinds apart.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credential on the request
    #[error(
        "Missing credentials: send 'Authorization: Bearer <token>' or 'X-API-Key: <key>'"
    )]
    MissingCredentials,

    /// JWT could not be decoded
    #[error("Malformed identity token: {0}")]
    Malformed(String),

    /// JWT signature did not verify
    #[error("Identity token signature is invalid")]
    InvalidSignature,

    /// JWT expired beyond the allowed leeway
    #[error("Identity token has expired")]
    Expired,

    /// Issuer not configured or claim mismatch
    #[error("Identity token issuer is not trusted: {0}")]
    IssuerMismatch(String),

    /// Audience did not match
    #[error("Identity token audience is not accepted")]
    InvalidAudience,

    /// `kid` not present in the issuer key set, even after refresh
    #[error("Identity token signing key is unknown: {0}")]
    UnknownKey(String),

    /// Key set could not be fetched
    #[error("Identity provider keys are unavailable")]
    JwksUnavailable,

    /// API key absent, inactive or expired (deliberately indistinguishable)
    #[error("Invalid API key")]
    InvalidApiKey,

    /// Identity verified but not mapped to an internal user
    #[error("User is not provisioned")]
    UserNotProvisioned,

    /// User is not a member of the claimed organization
    #[error("User is not a member of the organization")]
    NotOrgMember,
}

impl AuthError {
    /// Stable diagnostic code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::Malformed(_) => "token_malformed",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::IssuerMismatch(_) => "issuer_mismatch",
            Self::InvalidAudience => "invalid_audience",
            Self::UnknownKey(_) => "unknown_key",
            Self::JwksUnavailable => "jwks_unavailable",
            Self::InvalidApiKey => "invalid_api_key",
            Self::UserNotProvisioned => "user_not_provisioned",
            Self::NotOrgMember => "not_org_member",
        }
    }
}

/// MCP hub errors
#[derive(Error, Debug)]
pub enum Error {
    /// Caller rejected by the auth resolver
    #[error("Unauthorized: {0}")]
    AuthRejected(#[from] AuthError),

    /// Delegated credential is gone; the user must re-authorize
    #[error("Re-authorization required for backend {backend_id}")]
    ReAuthRequired {
        /// Backend needing re-authorization
        backend_id: String,
        /// Internal user id
        user_id: String,
    },

    /// Backend could not be reached (the only retryable kind)
    #[error("Backend unreachable: {backend}")]
    BackendUnreachable {
        /// Backend id
        backend: String,
        /// Internal detail, logged only
        detail: String,
    },

    /// Backend answered with something that is not valid MCP
    #[error("Backend protocol error: {backend}")]
    BackendProtocol {
        /// Backend id (or upstream service name)
        backend: String,
        /// Internal detail, logged only
        detail: String,
    },

    /// One or more children are stopped or errored
    #[error("Backends unhealthy: {}", backends.join(", "))]
    BackendUnhealthy {
        /// Every offending backend id
        backends: Vec<String>,
    },

    /// Tool not in the backend's declared catalog
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// Endpoint or backend does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Tool name did not parse
    #[error("Invalid tool name: {0}")]
    InvalidToolName(#[from] ToolNameError),

    /// Connect or call timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Pool limits reached
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Response transform failed
    #[error("Transform error: {0}")]
    Transform(String),

    /// A declared credential header has no stored value
    #[error("Missing credential for backend {backend}: {detail}")]
    MissingCredential {
        /// Backend id
        backend: String,
        /// What is missing
        detail: String,
    },

    /// Authenticated but not allowed (org mismatch, tool scope)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed inbound request
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error returned by a backend
    #[error("JSON-RPC error {code}: {message}")]
    JsonRpc {
        /// Error code
        code: i32,
        /// Error message
        message: String,
        /// Optional data
        data: Option<serde_json::Value>,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a JSON-RPC error
    pub fn json_rpc(code: i32, message: impl Into<String>) -> Self {
        Self::JsonRpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Backend unreachable with internal detail
    pub fn unreachable(backend: impl Into<String>, detail: impl ToString) -> Self {
        Self::BackendUnreachable {
            backend: backend.into(),
            detail: detail.to_string(),
        }
    }

    /// Backend protocol violation with internal detail
    pub fn backend_protocol(backend: impl Into<String>, detail: impl ToString) -> Self {
        Self::BackendProtocol {
            backend: backend.into(),
            detail: detail.to_string(),
        }
    }

    /// Whether a connect attempt that failed with this error may be retried
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnreachable { .. })
    }

    /// Convert to JSON-RPC error code
    #[must_use]
    pub fn to_rpc_code(&self) -> i32 {
        match self {
            Self::JsonRpc { code, .. } => *code,
            Self::Json(_) => rpc_codes::PARSE_ERROR,
            Self::Protocol(_) => rpc_codes::INVALID_REQUEST,
            Self::InvalidToolName(_) => rpc_codes::INVALID_PARAMS,
            Self::ToolNotFound(_) | Self::NotFound(_) => rpc_codes::NOT_FOUND,
            Self::AuthRejected(_) => rpc_codes::UNAUTHORIZED,
            Self::Forbidden(_) => rpc_codes::FORBIDDEN,
            Self::ReAuthRequired { .. } => rpc_codes::REAUTH_REQUIRED,
            Self::CapacityExceeded(_) => rpc_codes::CAPACITY_EXCEEDED,
            Self::BackendUnreachable { .. }
            | Self::BackendProtocol { .. }
            | Self::BackendUnhealthy { .. }
            | Self::Timeout(_)
            | Self::Http(_) => rpc_codes::SERVER_ERROR_START,
            _ => rpc_codes::INTERNAL_ERROR,
        }
    }

    /// HTTP status for errors surfaced outside a JSON-RPC result
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::AuthRejected(_) | Self::ReAuthRequired { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::CapacityExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::BackendUnreachable { .. } | Self::BackendProtocol { .. } | Self::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::BackendUnhealthy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::InvalidToolName(_)
            | Self::ToolNotFound(_)
            | Self::Protocol(_)
            | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::JsonRpc { .. } => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to put in a response body.
    ///
    /// 5xx-class internals collapse to a generic message; the full error is
    /// logged at the boundary.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Config(_)
            | Self::Io(_)
            | Self::Json(_)
            | Self::Internal(_)
            | Self::Transform(_)
            | Self::MissingCredential { .. } => "Internal error".to_string(),
            Self::Http(_) => "Upstream request failed".to_string(),
            other => other.to_string(),
        }
    }
}

/// JSON-RPC error codes
pub mod rpc_codes {
    /// Parse error - Invalid JSON
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid Request - Not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Server error range start
    pub const SERVER_ERROR_START: i32 = -32000;
    /// Endpoint, backend or tool not found
    pub const NOT_FOUND: i32 = -32001;
    /// Caller not authenticated
    pub const UNAUTHORIZED: i32 = -32002;
    /// Caller not allowed
    pub const FORBIDDEN: i32 = -32003;
    /// Pool limits reached
    pub const CAPACITY_EXCEEDED: i32 = -32004;
    /// Delegated credential must be re-authorized by the user
    pub const REAUTH_REQUIRED: i32 = -32010;
    /// Server error range end
    pub const SERVER_ERROR_END: i32 = -32099;
}
