//! In-memory credential store seeded from configuration

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::{
    ApiKeyRecord, BackendServer, BackendStatus, CredentialStore, OAuthToken, SecretBundle,
    SecretResolver, StoreSeed, UnifiedEndpoint, hash_api_key,
};
use crate::Result;

/// YAML-seeded store. Secrets are resolved on read.
pub struct MemoryStore {
    backends: RwLock<HashMap<String, BackendServer>>,
    endpoints: HashMap<String, UnifiedEndpoint>,
    api_keys: HashMap<String, ApiKeyRecord>,
    identities: HashMap<(String, String), String>,
    memberships: HashSet<(String, String)>,
    secrets: HashMap<(String, String), SecretBundle>,
    oauth_tokens: DashMap<(String, String), OAuthToken>,
    resolver: SecretResolver,
}

impl MemoryStore {
    /// Build from seed data
    ///
    /// # Errors
    ///
    /// Returns an error if a plaintext API key references an unset variable.
    pub fn from_seed(seed: StoreSeed) -> Result<Self> {
        let resolver = SecretResolver::new()?;

        let mut api_keys = HashMap::new();
        for entry in seed.api_keys {
            let digest = match (entry.key_sha256, entry.key) {
                (Some(digest), _) => digest.to_ascii_lowercase(),
                (None, Some(key)) => hash_api_key(&resolver.resolve(&key)?),
                (None, None) => {
                    return Err(crate::Error::Config(format!(
                        "API key '{}' has neither key nor key_sha256",
                        entry.record.name
                    )));
                }
            };
            api_keys.insert(digest, entry.record);
        }

        let mut identities = HashMap::new();
        let mut memberships = HashSet::new();
        for user in seed.users {
            for identity in user.identities {
                identities.insert((identity.issuer, identity.subject), user.id.clone());
            }
            for org in user.orgs {
                memberships.insert((user.id.clone(), org));
            }
        }

        let store = Self {
            backends: RwLock::new(
                seed.backends
                    .into_iter()
                    .map(|b| (b.id.clone(), b))
                    .collect(),
            ),
            endpoints: seed
                .endpoints
                .into_iter()
                .map(|e| (e.id.clone(), e))
                .collect(),
            api_keys,
            identities,
            memberships,
            secrets: seed
                .secrets
                .into_iter()
                .map(|s| ((s.backend_id, s.config_id), s.values))
                .collect(),
            oauth_tokens: seed
                .oauth_tokens
                .into_iter()
                .map(|t| ((t.instance, t.user_id), t.token))
                .collect(),
            resolver,
        };
        debug!(
            backends = store.backends.read().len(),
            endpoints = store.endpoints.len(),
            api_keys = store.api_keys.len(),
            "Credential store seeded"
        );
        Ok(store)
    }

    /// Update a backend's status (platform-side lifecycle change)
    pub fn set_status(&self, backend_id: &str, status: BackendStatus) {
        if let Some(backend) = self.backends.write().get_mut(backend_id) {
            backend.status = status;
        }
    }

    /// Soft-delete a backend
    pub fn mark_deleted(&self, backend_id: &str) {
        if let Some(backend) = self.backends.write().get_mut(backend_id) {
            backend.deleted = true;
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn backend(&self, id: &str) -> Result<Option<BackendServer>> {
        Ok(self.backends.read().get(id).cloned())
    }

    async fn endpoint(&self, id: &str) -> Result<Option<UnifiedEndpoint>> {
        Ok(self.endpoints.get(id).cloned())
    }

    async fn api_key(&self, digest: &str) -> Result<Option<ApiKeyRecord>> {
        Ok(self.api_keys.get(digest).cloned())
    }

    async fn resolve_user(&self, issuer: &str, subject: &str) -> Result<Option<String>> {
        Ok(self
            .identities
            .get(&(issuer.to_string(), subject.to_string()))
            .cloned())
    }

    async fn is_org_member(&self, user_id: &str, org_id: &str) -> Result<bool> {
        Ok(self
            .memberships
            .contains(&(user_id.to_string(), org_id.to_string())))
    }

    async fn static_secret(
        &self,
        backend_id: &str,
        config_id: &str,
    ) -> Result<Option<SecretBundle>> {
        let Some(raw) = self
            .secrets
            .get(&(backend_id.to_string(), config_id.to_string()))
        else {
            return Ok(None);
        };
        raw.iter()
            .map(|(k, v)| Ok((k.clone(), self.resolver.resolve(v)?)))
            .collect::<Result<SecretBundle>>()
            .map(Some)
    }

    async fn oauth_token(&self, instance: &str, user_id: &str) -> Result<Option<OAuthToken>> {
        Ok(self
            .oauth_tokens
            .get(&(instance.to_string(), user_id.to_string()))
            .map(|t| t.clone()))
    }

    async fn save_oauth_token(
        &self,
        instance: &str,
        user_id: &str,
        token: OAuthToken,
    ) -> Result<()> {
        self.oauth_tokens
            .insert((instance.to_string(), user_id.to_string()), token);
        Ok(())
    }
}
