//! Identity token verification: JWKS caching and JWT validation.
//!
//! 1. Read `iss` from the unverified payload and find the trusted issuer.
//! 2. Look up the header `kid` in the issuer's key set (cached; one forced
//!    refresh on an unknown `kid`).
//! 3. Verify signature, `exp`/`nbf` with leeway, and `iss`.
//! 4. Check audience manually so both string and array forms work.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::Engine;
use dashmap::DashMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{DecodingKey, Validation};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AuthConfig, IssuerConfig};
use crate::error::AuthError;

/// Claims the gateway relies on after verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// `iss`
    pub issuer: String,
    /// `sub`
    pub subject: String,
    /// Organization claim
    pub org_id: String,
}

#[derive(Debug, Deserialize)]
struct UnverifiedClaims {
    iss: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    aud: Value,
    #[serde(flatten)]
    extra: HashMap<String, Value>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
    /// Primed sets never go stale
    pinned: bool,
}

/// JWKS cache, one entry per issuer
pub struct JwksCache {
    inner: DashMap<String, CachedJwks>,
    http: reqwest::Client,
    ttl: Duration,
}

impl JwksCache {
    /// Cache with the given freshness window. With `https_only` a key set
    /// URL over plain HTTP is never fetched.
    #[must_use]
    pub fn new(ttl: Duration, https_only: bool) -> Self {
        Self {
            inner: DashMap::new(),
            http: reqwest::Client::builder()
                .https_only(https_only)
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            ttl,
        }
    }

    /// Install a key set for an issuer without fetching (static keys, tests)
    pub fn prime(&self, issuer: &str, keys: JwkSet) {
        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys,
                fetched_at: Instant::now(),
                pinned: true,
            },
        );
    }

    /// Cached key set, or a fresh fetch when stale or forced
    async fn get_or_fetch(
        &self,
        issuer: &str,
        jwks_uri: &str,
        force_refresh: bool,
    ) -> Result<JwkSet, AuthError> {
        if let Some(cached) = self.inner.get(issuer) {
            let fresh = cached.fetched_at.elapsed() < self.ttl;
            if cached.pinned || (fresh && !force_refresh) {
                return Ok(cached.keys.clone());
            }
        }

        debug!(issuer, jwks_uri, "Fetching JWKS");
        let keys: JwkSet = async {
            self.http
                .get(jwks_uri)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await
        }
        .await
        .map_err(|e| {
            warn!(issuer, error = %e, "JWKS fetch failed");
            AuthError::JwksUnavailable
        })?;

        self.inner.insert(
            issuer.to_string(),
            CachedJwks {
                keys: keys.clone(),
                fetched_at: Instant::now(),
                pinned: false,
            },
        );
        Ok(keys)
    }
}

/// Verifies identity tokens from the configured issuers
pub struct IdentityVerifier {
    issuers: Vec<IssuerConfig>,
    leeway_secs: u64,
    jwks: JwksCache,
}

impl IdentityVerifier {
    /// Verifier for the issuers in `config`
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        for issuer in &config.issuers {
            if !issuer.issuer.starts_with("https://") {
                warn!(issuer = %issuer.issuer, "Identity issuer is not HTTPS");
            }
        }
        Self {
            issuers: config.issuers.clone(),
            leeway_secs: config.leeway_secs,
            jwks: JwksCache::new(config.jwks_cache_ttl, config.jwks_https_only),
        }
    }

    /// Key cache (for priming static keys)
    #[must_use]
    pub fn jwks(&self) -> &JwksCache {
        &self.jwks
    }

    /// Verify a JWT and extract issuer, subject and organization
    ///
    /// # Errors
    ///
    /// One [`AuthError`] kind per failure: malformed token, untrusted issuer,
    /// unknown key, bad signature, expiry, audience.
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let header = jsonwebtoken::decode_header(token).map_err(map_jwt_error)?;
        let issuer_claim = extract_unverified_issuer(token)?;

        let issuer = self
            .issuers
            .iter()
            .find(|i| i.issuer == issuer_claim)
            .ok_or_else(|| AuthError::IssuerMismatch(issuer_claim.clone()))?;

        let kid = header
            .kid
            .clone()
            .ok_or_else(|| AuthError::Malformed("header has no 'kid'".to_string()))?;
        let jwks_uri = issuer
            .jwks_uri
            .clone()
            .unwrap_or_else(|| default_jwks_uri(&issuer.issuer));
        let key = self.find_decoding_key(&kid, &issuer.issuer, &jwks_uri).await?;

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.leeway_secs;
        validation.set_issuer(&[&issuer.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation.validate_aud = false;

        let claims = jsonwebtoken::decode::<TokenClaims>(token, &key, &validation)
            .map_err(map_jwt_error)?
            .claims;

        if !issuer.audiences.is_empty() && !audience_matches(&claims.aud, &issuer.audiences) {
            return Err(AuthError::InvalidAudience);
        }

        let org_id = claims
            .extra
            .get(&issuer.org_claim)
            .and_then(Value::as_str)
            .ok_or_else(|| AuthError::Malformed(format!("missing '{}' claim", issuer.org_claim)))?
            .to_string();

        Ok(VerifiedIdentity {
            issuer: claims.iss,
            subject: claims.sub,
            org_id,
        })
    }

    /// Find a decoding key by `kid`, refreshing the key set once if absent
    async fn find_decoding_key(
        &self,
        kid: &str,
        issuer: &str,
        jwks_uri: &str,
    ) -> Result<DecodingKey, AuthError> {
        let jwks = self.jwks.get_or_fetch(issuer, jwks_uri, false).await?;
        if let Some(key) = find_key_in_jwks(&jwks, kid) {
            return Ok(key);
        }

        debug!(kid, "Key not in cached JWKS, refreshing");
        let jwks = self.jwks.get_or_fetch(issuer, jwks_uri, true).await?;
        find_key_in_jwks(&jwks, kid).ok_or_else(|| AuthError::UnknownKey(kid.to_string()))
    }
}

/// Read `iss` before we know which issuer's keys to use
fn extract_unverified_issuer(token: &str) -> Result<String, AuthError> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| AuthError::Malformed("not a JWT".to_string()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| AuthError::Malformed("payload is not base64url".to_string()))?;
    serde_json::from_slice::<UnverifiedClaims>(&bytes)
        .map_err(|_| AuthError::Malformed("payload is not JSON".to_string()))?
        .iss
        .ok_or_else(|| AuthError::Malformed("missing 'iss' claim".to_string()))
}

fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    jwks.keys
        .iter()
        .find(|jwk| jwk.common.key_id.as_deref() == Some(kid))
        .and_then(|jwk| DecodingKey::from_jwk(jwk).ok())
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AuthError {
    match err.kind() {
        ErrorKind::InvalidSignature
        | ErrorKind::InvalidAlgorithm
        | ErrorKind::InvalidKeyFormat
        | ErrorKind::InvalidEcdsaKey
        | ErrorKind::InvalidRsaKey(_) => AuthError::InvalidSignature,
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::InvalidIssuer => AuthError::IssuerMismatch("issuer claim rejected".to_string()),
        ErrorKind::InvalidAudience => AuthError::InvalidAudience,
        ErrorKind::ImmatureSignature => AuthError::Malformed("token not yet valid".to_string()),
        ErrorKind::MissingRequiredClaim(claim) => AuthError::Malformed(format!("missing '{claim}' claim")),
        _ => AuthError::Malformed(err.to_string()),
    }
}

fn audience_matches(aud_claim: &Value, expected: &[String]) -> bool {
    match aud_claim {
        Value::String(s) => expected.iter().any(|e| e == s),
        Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    }
}

/// Derive the default JWKS URI from the issuer URL
fn default_jwks_uri(issuer: &str) -> String {
    let base = issuer.trim_end_matches('/');
    format!("{base}/.well-known/jwks.json")
}
