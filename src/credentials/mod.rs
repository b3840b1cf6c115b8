//! Credential injection: the headers a backend call carries for a caller

mod oauth;
mod platform;

pub use oauth::{HttpTokenExchanger, OAuthClientInfo, OAuthRefresher, TokenExchanger, TokenGrant};
pub use platform::{PlatformClaims, PlatformSigner};

use std::sync::Arc;

use tracing::debug;

use crate::auth::Principal;
use crate::store::{BackendAuth, BackendServer, CredentialStore};
use crate::transport::OutboundHeaders;
use crate::{Error, Result};

/// Bundle field used when a static-key backend declares no header names
const DEFAULT_SECRET_FIELD: &str = "api_key";

/// Builds outbound auth headers per backend auth type
pub struct CredentialInjector {
    store: Arc<dyn CredentialStore>,
    refresher: OAuthRefresher,
    platform: Option<PlatformSigner>,
}

impl CredentialInjector {
    /// Injector over a store
    #[must_use]
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: OAuthRefresher,
        platform: Option<PlatformSigner>,
    ) -> Self {
        Self {
            store,
            refresher,
            platform,
        }
    }

    /// Headers for calling `backend` as `principal`
    pub async fn headers_for(
        &self,
        backend: &BackendServer,
        principal: &Principal,
    ) -> Result<OutboundHeaders> {
        let mut headers = OutboundHeaders::new();
        match &backend.auth {
            BackendAuth::None => {}
            BackendAuth::StaticKey {
                config_id,
                header_names,
            } => {
                let bundle = self
                    .store
                    .static_secret(&backend.id, config_id)
                    .await?
                    .ok_or_else(|| Error::MissingCredential {
                        backend: backend.id.clone(),
                        detail: format!("no secret bundle for config '{config_id}'"),
                    })?;

                if header_names.is_empty() {
                    let key = bundle.get(DEFAULT_SECRET_FIELD).ok_or_else(|| {
                        Error::MissingCredential {
                            backend: backend.id.clone(),
                            detail: format!("secret bundle has no '{DEFAULT_SECRET_FIELD}'"),
                        }
                    })?;
                    headers.insert("Authorization", format!("Bearer {key}"));
                } else {
                    for name in header_names {
                        let value = bundle.get(name).ok_or_else(|| Error::MissingCredential {
                            backend: backend.id.clone(),
                            detail: format!("header '{name}' has no stored value"),
                        })?;
                        headers.insert(name.clone(), value.clone());
                    }
                }
            }
            BackendAuth::OAuth {
                token_endpoint,
                client_id,
                client_secret,
                ..
            } => {
                let client = OAuthClientInfo {
                    token_endpoint: token_endpoint.clone(),
                    client_id: client_id.clone(),
                    client_secret: client_secret.clone(),
                };
                let token = self
                    .refresher
                    .access_token(
                        &backend.id,
                        backend.credential_instance(),
                        &client,
                        &principal.user_id,
                    )
                    .await?;
                headers.insert("Authorization", format!("Bearer {token}"));
            }
            BackendAuth::PlatformToken { audience } => {
                let signer = self.platform.as_ref().ok_or_else(|| Error::MissingCredential {
                    backend: backend.id.clone(),
                    detail: "platform signing secret is not configured".to_string(),
                })?;
                let token = signer.sign(&principal.user_id, &principal.org_id, audience)?;
                headers.insert("Authorization", format!("Bearer {token}"));
            }
        }
        debug!(backend = %backend.id, headers = ?headers, "Injected credentials");
        Ok(headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMethod;
    use crate::config::OAuthConfig;
    use crate::store::{MemoryStore, SecretSeed, StoreSeed, TransportDescriptor};
    use std::collections::HashMap;
    use std::time::Duration;

    struct NoExchange;

    #[async_trait::async_trait]
    impl TokenExchanger for NoExchange {
        async fn refresh(&self, _: &OAuthClientInfo, _: &str) -> Result<TokenGrant> {
            Err(Error::Internal("unused".into()))
        }
    }

    fn backend(auth: BackendAuth) -> BackendServer {
        BackendServer {
            id: "srv".into(),
            name: "Server".into(),
            transport: TransportDescriptor::StreamableHttp {
                url: "http://localhost:1/mcp".into(),
            },
            auth,
            status: crate::store::BackendStatus::Running,
            deleted: false,
            tool_search: false,
            template_id: None,
        }
    }

    fn principal() -> Principal {
        Principal {
            org_id: "org-a".into(),
            user_id: "u1".into(),
            method: AuthMethod::Identity,
            key_name: None,
            allowed_tools: vec![],
            denied_tools: vec![],
        }
    }

    fn injector(values: &[(&str, &str)], platform_secret: Option<&str>) -> CredentialInjector {
        let seed = StoreSeed {
            secrets: vec![SecretSeed {
                backend_id: "srv".into(),
                config_id: "cfg".into(),
                values: values
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect::<HashMap<_, _>>(),
            }],
            ..StoreSeed::default()
        };
        let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::from_seed(seed).unwrap());
        let refresher = OAuthRefresher::new(store.clone(), Arc::new(NoExchange), Duration::from_secs(300));
        let platform = PlatformSigner::from_config(&OAuthConfig {
            platform_secret: platform_secret.map(Into::into),
            ..OAuthConfig::default()
        });
        CredentialInjector::new(store, refresher, platform)
    }

    #[tokio::test]
    async fn static_key_defaults_to_bearer() {
        let headers = injector(&[("api_key", "sk-1")], None)
            .headers_for(
                &backend(BackendAuth::StaticKey {
                    config_id: "cfg".into(),
                    header_names: vec![],
                }),
                &principal(),
            )
            .await
            .unwrap();
        assert_eq!(headers.get("Authorization"), Some("Bearer sk-1"));
    }

    #[tokio::test]
    async fn declared_headers_come_from_bundle() {
        let headers = injector(&[("X-Api-Token", "t"), ("X-Tenant", "acme")], None)
            .headers_for(
                &backend(BackendAuth::StaticKey {
                    config_id: "cfg".into(),
                    header_names: vec!["X-Api-Token".into(), "X-Tenant".into()],
                }),
                &principal(),
            )
            .await
            .unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("X-Tenant"), Some("acme"));
        assert!(headers.get("Authorization").is_none());
    }

    #[tokio::test]
    async fn missing_declared_header_is_an_error() {
        let err = injector(&[("X-Api-Token", "t")], None)
            .headers_for(
                &backend(BackendAuth::StaticKey {
                    config_id: "cfg".into(),
                    header_names: vec!["X-Api-Token".into(), "X-Tenant".into()],
                }),
                &principal(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCredential { ref detail, .. } if detail.contains("X-Tenant")));
    }

    #[tokio::test]
    async fn none_adds_nothing() {
        let headers = injector(&[], None)
            .headers_for(&backend(BackendAuth::None), &principal())
            .await
            .unwrap();
        assert!(headers.is_empty());
    }

    #[tokio::test]
    async fn platform_token_needs_secret() {
        let auth = BackendAuth::PlatformToken {
            audience: "srv".into(),
        };
        let headers = injector(&[], Some("s3cret-platform"))
            .headers_for(&backend(auth.clone()), &principal())
            .await
            .unwrap();
        assert!(headers.get("Authorization").is_some_and(|v| v.starts_with("Bearer ey")));

        let err = injector(&[], None)
            .headers_for(&backend(auth), &principal())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingCredential { .. }));
    }

    #[tokio::test]
    async fn oauth_without_token_requires_reauth() {
        let err = injector(&[], None)
            .headers_for(
                &backend(BackendAuth::OAuth {
                    token_endpoint: "https://auth.example.com/token".into(),
                    authorization_server: None,
                    client_id: "hub".into(),
                    client_secret: None,
                    scopes: vec![],
                }),
                &principal(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReAuthRequired { .. }));
    }
}
