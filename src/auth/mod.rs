//! Inbound authentication: who is calling, for which organization.
//!
//! Resolution is an explicit state machine:
//!
//! ```text
//! NoCredential ─┬─> BearerIdentity ─┬─> Verified ─> OrgMembershipChecked ─> Authorized
//!               └─> ApiKey ─────────┘
//! (any state) ─> Rejected
//! ```

mod middleware;
pub mod oidc;

use std::sync::Arc;

use axum::http::HeaderMap;
use chrono::Utc;
use tracing::debug;

pub use middleware::{AuthGate, PrincipalRateLimiter, auth_middleware, unauthorized_response};
pub use oidc::{IdentityVerifier, JwksCache, VerifiedIdentity};

use crate::config::AuthConfig;
use crate::error::AuthError;
use crate::store::{CredentialStore, hash_api_key};
use crate::{Error, Result};

/// How the caller authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    /// Verified identity token
    Identity,
    /// Organization API key
    ApiKey,
}

/// An authorized caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    /// Organization the caller acts for
    pub org_id: String,
    /// Internal user id
    pub user_id: String,
    /// Credential kind
    pub method: AuthMethod,
    /// API key name (for logs)
    pub key_name: Option<String>,
    /// Allowed tool patterns (empty = all)
    pub allowed_tools: Vec<String>,
    /// Denied tool patterns
    pub denied_tools: Vec<String>,
}

impl Principal {
    /// Check whether this caller may use a tool on a backend.
    ///
    /// Patterns match the bare tool name or `backend:tool`, exactly or as a
    /// `*`-suffixed prefix. The allowlist is applied first.
    pub fn check_tool_scope(&self, backend: &str, tool: &str) -> Result<()> {
        let qualified = format!("{backend}:{tool}");

        if !self.allowed_tools.is_empty()
            && !matches_any_pattern(&self.allowed_tools, tool, &qualified)
        {
            return Err(Error::Forbidden(format!(
                "Tool '{tool}' on backend '{backend}' is not in the allowlist for this key"
            )));
        }

        if matches_any_pattern(&self.denied_tools, tool, &qualified) {
            return Err(Error::Forbidden(format!(
                "Tool '{tool}' on backend '{backend}' is blocked for this key"
            )));
        }

        Ok(())
    }

    /// Non-failing form of [`Principal::check_tool_scope`], for catalog filtering
    #[must_use]
    pub fn can_use(&self, backend: &str, tool: &str) -> bool {
        self.check_tool_scope(backend, tool).is_ok()
    }

    /// Rate-limit bucket key
    #[must_use]
    pub fn limiter_key(&self) -> String {
        match &self.key_name {
            Some(name) => format!("{}:key:{name}", self.org_id),
            None => format!("{}:user:{}", self.org_id, self.user_id),
        }
    }
}

fn matches_any_pattern(patterns: &[String], tool: &str, qualified: &str) -> bool {
    patterns.iter().any(|pattern| {
        if let Some(prefix) = pattern.strip_suffix('*') {
            tool.starts_with(prefix) || qualified.starts_with(prefix)
        } else {
            tool == pattern || qualified == pattern
        }
    })
}

/// Two organization ids refer to the same organization
pub fn ensure_same_org(caller_org: &str, resource_org: &str) -> Result<()> {
    if caller_org == resource_org {
        Ok(())
    } else {
        Err(Error::Forbidden(
            "Resource belongs to a different organization".to_string(),
        ))
    }
}

/// Resolver state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    /// Nothing examined yet
    NoCredential,
    /// Bearer value shaped like a JWT
    BearerIdentity(String),
    /// API key from the bearer or key header
    ApiKey(String),
    /// Credential checked and mapped to an internal user
    Verified(Principal),
    /// User confirmed as a member of the claimed organization
    OrgMembershipChecked(Principal),
    /// Terminal success
    Authorized(Principal),
    /// Terminal failure
    Rejected(AuthError),
}

impl AuthState {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Authorized(_) | Self::Rejected(_))
    }
}

/// Resolves request headers to a [`Principal`]
pub struct AuthResolver {
    config: AuthConfig,
    verifier: IdentityVerifier,
    store: Arc<dyn CredentialStore>,
}

impl AuthResolver {
    /// Resolver over a store
    #[must_use]
    pub fn new(config: AuthConfig, store: Arc<dyn CredentialStore>) -> Self {
        let verifier = IdentityVerifier::new(&config);
        Self {
            config,
            verifier,
            store,
        }
    }

    /// Identity verifier (for priming static keys)
    #[must_use]
    pub fn verifier(&self) -> &IdentityVerifier {
        &self.verifier
    }

    /// Drive the state machine to a terminal state.
    ///
    /// Store failures are infrastructure errors and propagate as such; every
    /// credential problem ends in [`Error::AuthRejected`].
    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Principal> {
        let mut state = AuthState::NoCredential;
        while !state.is_terminal() {
            state = self.step(state, headers).await?;
        }
        match state {
            AuthState::Authorized(principal) => Ok(principal),
            AuthState::Rejected(err) => Err(err.into()),
            _ => Err(Error::Internal("auth resolver stopped early".to_string())),
        }
    }

    /// One transition
    pub async fn step(&self, state: AuthState, headers: &HeaderMap) -> Result<AuthState> {
        let next = match state {
            AuthState::NoCredential => self.extract(headers),
            AuthState::BearerIdentity(token) => match self.verifier.verify(&token).await {
                Ok(identity) => self.map_identity(identity).await?,
                Err(e) => AuthState::Rejected(e),
            },
            AuthState::ApiKey(key) => self.lookup_api_key(&key).await?,
            AuthState::Verified(principal) => {
                if self
                    .store
                    .is_org_member(&principal.user_id, &principal.org_id)
                    .await?
                {
                    AuthState::OrgMembershipChecked(principal)
                } else {
                    AuthState::Rejected(AuthError::NotOrgMember)
                }
            }
            AuthState::OrgMembershipChecked(principal) => AuthState::Authorized(principal),
            terminal @ (AuthState::Authorized(_) | AuthState::Rejected(_)) => terminal,
        };
        if let AuthState::Rejected(ref reason) = next {
            debug!(code = reason.code(), "Credential rejected");
        }
        Ok(next)
    }

    /// Classify the presented credential
    fn extract(&self, headers: &HeaderMap) -> AuthState {
        let bearer = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| {
                v.strip_prefix("Bearer ")
                    .or_else(|| v.strip_prefix("bearer "))
            })
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(value) = bearer {
            if value.starts_with(&self.config.api_key_prefix) {
                return AuthState::ApiKey(value.to_string());
            }
            if value.split('.').count() == 3 {
                return AuthState::BearerIdentity(value.to_string());
            }
            return AuthState::Rejected(AuthError::Malformed(
                "bearer value is neither a JWT nor an API key".to_string(),
            ));
        }

        let api_key = headers
            .get(self.config.api_key_header.as_str())
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match api_key {
            Some(key) => AuthState::ApiKey(key.to_string()),
            None => AuthState::Rejected(AuthError::MissingCredentials),
        }
    }

    async fn map_identity(&self, identity: VerifiedIdentity) -> Result<AuthState> {
        let user = self
            .store
            .resolve_user(&identity.issuer, &identity.subject)
            .await?;
        Ok(match user {
            Some(user_id) => AuthState::Verified(Principal {
                org_id: identity.org_id,
                user_id,
                method: AuthMethod::Identity,
                key_name: None,
                allowed_tools: Vec::new(),
                denied_tools: Vec::new(),
            }),
            None => AuthState::Rejected(AuthError::UserNotProvisioned),
        })
    }

    async fn lookup_api_key(&self, key: &str) -> Result<AuthState> {
        let record = self.store.api_key(&hash_api_key(key)).await?;
        Ok(match record {
            Some(record) if record.is_usable(Utc::now()) => AuthState::Verified(Principal {
                org_id: record.org_id,
                user_id: record.user_id,
                method: AuthMethod::ApiKey,
                key_name: Some(record.name),
                allowed_tools: record.allowed_tools,
                denied_tools: record.denied_tools,
            }),
            _ => AuthState::Rejected(AuthError::InvalidApiKey),
        })
    }
}
