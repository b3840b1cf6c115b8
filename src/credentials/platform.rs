//! Short-lived tokens signed by the gateway itself

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

use crate::config::OAuthConfig;
use crate::{Error, Result};

/// Claims of a platform token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformClaims {
    /// Gateway issuer
    pub iss: String,
    /// Internal user id
    pub sub: String,
    /// Organization id
    pub org: String,
    /// Backend audience
    pub aud: String,
    /// Issued at
    pub iat: i64,
    /// Expiry
    pub exp: i64,
    /// Unique token id
    pub jti: String,
}

/// HS256 signer for platform tokens
pub struct PlatformSigner {
    key: EncodingKey,
    issuer: String,
    ttl: Duration,
}

impl PlatformSigner {
    /// Signer from config, `None` when no platform secret is set
    #[must_use]
    pub fn from_config(config: &OAuthConfig) -> Option<Self> {
        let secret = config.platform_secret.as_deref().filter(|s| !s.is_empty())?;
        Some(Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
            issuer: config.platform_issuer.clone(),
            ttl: config.platform_token_ttl,
        })
    }

    /// Sign a token for `user` in `org`, addressed to `audience`
    pub fn sign(&self, user_id: &str, org_id: &str, audience: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        let claims = PlatformClaims {
            iss: self.issuer.clone(),
            sub: user_id.to_string(),
            org: org_id.to_string(),
            aud: audience.to_string(),
            iat: now,
            exp: now.saturating_add(ttl),
            jti: uuid::Uuid::new_v4().to_string(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| Error::Internal(format!("Failed to sign platform token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{DecodingKey, Validation};

    #[test]
    fn signed_token_verifies_with_shared_secret() {
        let config = OAuthConfig {
            platform_secret: Some("platform-secret-for-tests".into()),
            ..OAuthConfig::default()
        };
        let signer = PlatformSigner::from_config(&config).unwrap();
        let token = signer.sign("u1", "org-a", "backend-gh").unwrap();

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&["backend-gh"]);
        validation.set_issuer(&["mcp-hub"]);
        let data = jsonwebtoken::decode::<PlatformClaims>(
            &token,
            &DecodingKey::from_secret(b"platform-secret-for-tests"),
            &validation,
        )
        .unwrap();

        assert_eq!(data.claims.sub, "u1");
        assert_eq!(data.claims.org, "org-a");
        assert_eq!(data.claims.exp - data.claims.iat, 300);
    }

    #[test]
    fn no_secret_means_no_signer() {
        assert!(PlatformSigner::from_config(&OAuthConfig::default()).is_none());
    }
}
