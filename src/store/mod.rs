//! Credential store: read contracts for backends, endpoints and credentials
//!
//! The gateway never owns this data. [`CredentialStore`] is the seam to the
//! platform database; [`MemoryStore`] is the YAML-seeded implementation used
//! for single-node deployments and tests.

mod memory;
mod secrets;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use memory::MemoryStore;
pub use secrets::SecretResolver;

use crate::Result;

/// Decrypted secret bundle: header or field name to value
pub type SecretBundle = HashMap<String, String>;

/// Backend lifecycle status as reported by the platform
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendStatus {
    /// Accepting calls
    #[default]
    Running,
    /// Stopped by its owner
    Stopped,
    /// Crashed or failed to deploy
    Error,
}

impl BackendStatus {
    /// Stopped or errored backends fail aggregation fast
    #[must_use]
    pub fn is_unhealthy(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// How to reach a backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportDescriptor {
    /// Direct JSON-RPC POST
    StreamableHttp {
        /// Endpoint URL
        url: String,
    },
    /// SSE handshake, then POST to the announced endpoint
    Sse {
        /// SSE URL
        url: String,
    },
    /// Spawned subprocess speaking newline-delimited JSON-RPC
    Stdio {
        /// Command line (shell-quoted)
        command: String,
        /// Extra arguments
        #[serde(default)]
        args: Vec<String>,
        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory
        #[serde(default)]
        cwd: Option<String>,
    },
}

impl TransportDescriptor {
    /// Transport kind for logs and execution context
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StreamableHttp { .. } => "streamable-http",
            Self::Sse { .. } => "sse",
            Self::Stdio { .. } => "stdio",
        }
    }
}

/// How the gateway authenticates to a backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendAuth {
    /// No credential
    #[default]
    None,
    /// Encrypted static secret bundle
    StaticKey {
        /// Which secret bundle to read
        config_id: String,
        /// Headers to populate from the bundle (empty = bearer `api_key`)
        #[serde(default)]
        header_names: Vec<String>,
    },
    /// Per-user delegated OAuth token
    #[serde(rename = "oauth")]
    OAuth {
        /// Token endpoint used for refresh
        token_endpoint: String,
        /// Authorization server advertised in protected-resource metadata
        #[serde(default)]
        authorization_server: Option<String>,
        /// OAuth client id
        client_id: String,
        /// OAuth client secret (supports `{env.VAR}`)
        #[serde(default)]
        client_secret: Option<String>,
        /// Scopes advertised in protected-resource metadata
        #[serde(default)]
        scopes: Vec<String>,
    },
    /// Short-lived token signed by the gateway
    PlatformToken {
        /// `aud` claim
        audience: String,
    },
}

/// A hosted tool server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendServer {
    /// Stable id (first namespace segment)
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Transport
    pub transport: TransportDescriptor,
    /// Auth type
    #[serde(default)]
    pub auth: BackendAuth,
    /// Lifecycle status
    #[serde(default)]
    pub status: BackendStatus,
    /// Soft-deleted
    #[serde(default)]
    pub deleted: bool,
    /// Replace the catalog with search meta-tools
    #[serde(default)]
    pub tool_search: bool,
    /// Template this server was instantiated from (OAuth tokens are per template instance)
    #[serde(default)]
    pub template_id: Option<String>,
}

impl BackendServer {
    /// Key under which delegated tokens are stored
    #[must_use]
    pub fn credential_instance(&self) -> &str {
        self.template_id.as_deref().unwrap_or(&self.id)
    }
}

/// Reference from a unified endpoint to one child instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRef {
    /// Backend id
    pub backend_id: String,
    /// Instance name (second namespace segment)
    pub instance_name: String,
}

/// One URL aggregating many backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnifiedEndpoint {
    /// Endpoint id
    pub id: String,
    /// Owning organization
    pub org_id: String,
    /// Children
    #[serde(default)]
    pub children: Vec<ChildRef>,
}

impl UnifiedEndpoint {
    /// Child entry for a backend/instance pair
    #[must_use]
    pub fn child(&self, backend_id: &str, instance_name: &str) -> Option<&ChildRef> {
        self.children
            .iter()
            .find(|c| c.backend_id == backend_id && c.instance_name == instance_name)
    }
}

/// Stored API key metadata (the key itself is only kept as a digest)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Organization the key acts for
    pub org_id: String,
    /// User the key acts as
    pub user_id: String,
    /// Revocation flag
    #[serde(default = "default_true")]
    pub active: bool,
    /// Expiry
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Allowed tool patterns (empty = all)
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Denied tool patterns
    #[serde(default)]
    pub denied_tools: Vec<String>,
}

impl ApiKeyRecord {
    /// Active and not past expiry
    #[must_use]
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.active && self.expires_at.is_none_or(|exp| exp > now)
    }
}

fn default_true() -> bool {
    true
}

/// Delegated OAuth token for a (template instance, user) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthToken {
    /// Access token
    pub access_token: String,
    /// Refresh token
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry (None = does not expire)
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Successful refreshes so far
    #[serde(default)]
    pub refresh_count: u32,
    /// False once a refresh has failed
    #[serde(default = "default_true")]
    pub is_valid: bool,
    /// Last refresh error
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the last refresh error happened
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// Whether the token must be refreshed before use
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        if !self.is_valid {
            return true;
        }
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::MAX);
        self.expires_at.is_some_and(|exp| exp - now <= margin)
    }

    /// Record a failed refresh
    pub fn mark_invalid(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        self.is_valid = false;
        self.last_error = Some(error.into());
        self.last_error_at = Some(at);
    }
}

/// SHA-256 hex digest used to look up API keys
#[must_use]
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Read (and narrow write) contract to the platform's credential store
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Backend by id
    async fn backend(&self, id: &str) -> Result<Option<BackendServer>>;

    /// Unified endpoint by id
    async fn endpoint(&self, id: &str) -> Result<Option<UnifiedEndpoint>>;

    /// API key by SHA-256 digest
    async fn api_key(&self, digest: &str) -> Result<Option<ApiKeyRecord>>;

    /// Internal user id for an external identity
    async fn resolve_user(&self, issuer: &str, subject: &str) -> Result<Option<String>>;

    /// Organization membership
    async fn is_org_member(&self, user_id: &str, org_id: &str) -> Result<bool>;

    /// Decrypted secret bundle for a static-key backend
    async fn static_secret(&self, backend_id: &str, config_id: &str)
    -> Result<Option<SecretBundle>>;

    /// Delegated token for a template instance and user
    async fn oauth_token(&self, instance: &str, user_id: &str) -> Result<Option<OAuthToken>>;

    /// Persist a refreshed or invalidated token
    async fn save_oauth_token(&self, instance: &str, user_id: &str, token: OAuthToken)
    -> Result<()>;
}

/// External identity mapped to an internal user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySeed {
    /// Token issuer
    pub issuer: String,
    /// `sub` claim
    pub subject: String,
}

/// User seed entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    /// Internal user id
    pub id: String,
    /// External identities
    #[serde(default)]
    pub identities: Vec<IdentitySeed>,
    /// Organizations the user belongs to
    #[serde(default)]
    pub orgs: Vec<String>,
}

/// API key seed entry (plaintext `key` or precomputed `key_sha256`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySeed {
    /// Plaintext key (supports `{env.VAR}`)
    #[serde(default)]
    pub key: Option<String>,
    /// Precomputed digest
    #[serde(default)]
    pub key_sha256: Option<String>,
    /// Record
    #[serde(flatten)]
    pub record: ApiKeyRecord,
}

/// OAuth token seed entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokenSeed {
    /// Template instance
    pub instance: String,
    /// Internal user id
    pub user_id: String,
    /// Token
    #[serde(flatten)]
    pub token: OAuthToken,
}

/// Static secret bundle seed entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretSeed {
    /// Backend id
    pub backend_id: String,
    /// Config id
    pub config_id: String,
    /// Values (support `{env.VAR}`)
    #[serde(default)]
    pub values: HashMap<String, String>,
}

/// Everything the in-memory store is seeded with
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSeed {
    /// Backends
    pub backends: Vec<BackendServer>,
    /// Unified endpoints
    pub endpoints: Vec<UnifiedEndpoint>,
    /// API keys
    pub api_keys: Vec<ApiKeySeed>,
    /// Users
    pub users: Vec<UserSeed>,
    /// Delegated tokens
    pub oauth_tokens: Vec<OAuthTokenSeed>,
    /// Static secret bundles
    pub secrets: Vec<SecretSeed>,
}
