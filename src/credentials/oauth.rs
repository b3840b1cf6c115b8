//! Delegated OAuth tokens: silent refresh with single-flight per user

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::store::{CredentialStore, OAuthToken, SecretResolver};
use crate::{Error, Result};

/// Token endpoint coordinates for one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientInfo {
    /// Token endpoint
    pub token_endpoint: String,
    /// Client id
    pub client_id: String,
    /// Client secret, possibly an `{env.VAR}` reference
    pub client_secret: Option<String>,
}

/// Result of a successful refresh grant
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    /// New access token
    pub access_token: String,
    /// Rotated refresh token, if the provider issued one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Performs the `refresh_token` grant against a provider
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    /// Exchange a refresh token for a new grant
    async fn refresh(&self, client: &OAuthClientInfo, refresh_token: &str) -> Result<TokenGrant>;
}

/// Form-encoded refresh grant over HTTP
pub struct HttpTokenExchanger {
    http: reqwest::Client,
    secrets: SecretResolver,
}

impl HttpTokenExchanger {
    /// Exchanger with a per-request timeout
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            secrets: SecretResolver::new()?,
        })
    }
}

#[async_trait]
impl TokenExchanger for HttpTokenExchanger {
    async fn refresh(&self, client: &OAuthClientInfo, refresh_token: &str) -> Result<TokenGrant> {
        let client_secret = client
            .client_secret
            .as_deref()
            .map(|s| self.secrets.resolve(s))
            .transpose()?;

        let mut params = HashMap::new();
        params.insert("grant_type", "refresh_token");
        params.insert("refresh_token", refresh_token);
        params.insert("client_id", client.client_id.as_str());
        if let Some(secret) = client_secret.as_deref() {
            params.insert("client_secret", secret);
        }

        let response = self
            .http
            .post(&client.token_endpoint)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::backend_protocol(
                &client.token_endpoint,
                format!("Token refresh rejected: HTTP {status} - {body}"),
            ));
        }

        Ok(response.json().await?)
    }
}

/// Cloneable outcome shared by every waiter of one refresh
#[derive(Debug, Clone)]
enum RefreshFailure {
    /// The user has to authorize again
    ReAuth,
    /// Store failure while refreshing
    Store(String),
}

type RefreshFuture = Shared<BoxFuture<'static, std::result::Result<String, RefreshFailure>>>;

/// Hands out access tokens, refreshing them when stale
pub struct OAuthRefresher {
    store: Arc<dyn CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
    margin: Duration,
    inflight: DashMap<(String, String), RefreshFuture>,
}

impl OAuthRefresher {
    /// Refresher over a store and exchanger
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        exchanger: Arc<dyn TokenExchanger>,
        margin: Duration,
    ) -> Self {
        Self {
            store,
            exchanger,
            margin,
            inflight: DashMap::new(),
        }
    }

    /// A usable access token for `(instance, user)`.
    ///
    /// Fails with [`Error::ReAuthRequired`] when no token exists or refresh is
    /// impossible; the stored token is marked invalid in the latter case.
    pub async fn access_token(
        &self,
        backend_id: &str,
        instance: &str,
        client: &OAuthClientInfo,
        user_id: &str,
    ) -> Result<String> {
        let reauth = || Error::ReAuthRequired {
            backend_id: backend_id.to_string(),
            user_id: user_id.to_string(),
        };

        let token = self
            .store
            .oauth_token(instance, user_id)
            .await?
            .ok_or_else(reauth)?;
        if !token.needs_refresh(Utc::now(), self.margin) {
            return Ok(token.access_token);
        }

        let key = (instance.to_string(), user_id.to_string());
        let fut = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| {
                debug!(instance, user_id, "Starting token refresh");
                refresh(
                    Arc::clone(&self.store),
                    Arc::clone(&self.exchanger),
                    self.margin,
                    client.clone(),
                    key.clone(),
                )
                .boxed()
                .shared()
            })
            .clone();

        let outcome = fut.clone().await;
        self.inflight.remove_if(&key, |_, current| current.ptr_eq(&fut));

        outcome.map_err(|failure| match failure {
            RefreshFailure::ReAuth => reauth(),
            RefreshFailure::Store(detail) => Error::Internal(detail),
        })
    }
}

async fn refresh(
    store: Arc<dyn CredentialStore>,
    exchanger: Arc<dyn TokenExchanger>,
    margin: Duration,
    client: OAuthClientInfo,
    (instance, user_id): (String, String),
) -> std::result::Result<String, RefreshFailure> {
    let store_err = |e: Error| RefreshFailure::Store(e.to_string());

    // Another refresh may have landed since the caller read the token
    let Some(mut token) = store
        .oauth_token(&instance, &user_id)
        .await
        .map_err(store_err)?
    else {
        return Err(RefreshFailure::ReAuth);
    };
    let now = Utc::now();
    if !token.needs_refresh(now, margin) {
        return Ok(token.access_token);
    }

    let result = match token.refresh_token.as_deref() {
        Some(refresh_token) => exchanger.refresh(&client, refresh_token).await,
        None => Err(Error::MissingCredential {
            backend: instance.clone(),
            detail: "no refresh token stored".to_string(),
        }),
    };

    match result {
        Ok(grant) => {
            let refreshed = OAuthToken {
                access_token: grant.access_token,
                refresh_token: grant.refresh_token.or(token.refresh_token),
                expires_at: grant.expires_in.map(|secs| {
                    now + chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
                }),
                refresh_count: token.refresh_count.saturating_add(1),
                is_valid: true,
                last_error: None,
                last_error_at: None,
            };
            let access = refreshed.access_token.clone();
            store
                .save_oauth_token(&instance, &user_id, refreshed)
                .await
                .map_err(store_err)?;
            info!(instance = %instance, user_id = %user_id, "OAuth token refreshed");
            Ok(access)
        }
        Err(e) => {
            warn!(instance = %instance, user_id = %user_id, error = ?e, "OAuth token refresh failed, re-authorization required");
            token.mark_invalid(e.to_string(), now);
            store
                .save_oauth_token(&instance, &user_id, token)
                .await
                .map_err(store_err)?;
            Err(RefreshFailure::ReAuth)
        }
    }
}
