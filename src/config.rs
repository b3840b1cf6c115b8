//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use gateway_core::NamespacedToolName;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::store::{StoreSeed, TransportDescriptor};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Variables are set into the process environment for `{env.VAR}` resolution.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Inbound authentication
    pub auth: AuthConfig,
    /// Backend connection management
    pub connection: ConnectionConfig,
    /// Delegated and platform credentials
    pub oauth: OAuthConfig,
    /// Aggregated catalog caching
    pub catalog: CatalogConfig,
    /// Response transform pipeline
    pub transform: TransformConfig,
    /// Dynamic tool search
    pub tool_search: ToolSearchConfig,
    /// Scheduling triggers
    pub scheduler: SchedulerConfig,
    /// Seed data for the in-memory credential store
    pub store: StoreSeed,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Externally visible base URL (used in re-auth metadata links)
    pub public_url: Option<String>,
    /// Upper bound for a single tool execution
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39500,
            public_url: None,
            call_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
        }
    }
}

impl ServerConfig {
    /// Base URL without trailing slash
    #[must_use]
    pub fn base_url(&self) -> String {
        match &self.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Authentication configuration for gateway access
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Prefix that marks a bearer value as an API key rather than a JWT
    pub api_key_prefix: String,
    /// Header carrying an API key
    pub api_key_header: String,
    /// Trusted identity token issuers
    pub issuers: Vec<IssuerConfig>,
    /// Allowed clock skew for `exp`/`nbf`
    pub leeway_secs: u64,
    /// How long a fetched key set stays fresh
    #[serde(with = "humantime_serde")]
    pub jwks_cache_ttl: Duration,
    /// Refuse to fetch key sets over plain HTTP
    pub jwks_https_only: bool,
    /// Requests per minute per principal (0 = unlimited)
    pub rate_limit: u32,
    /// Paths (or prefixes ending in `/`) that bypass authentication
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,
}

fn default_public_paths() -> Vec<String> {
    vec!["/health".to_string(), "/.well-known/".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key_prefix: "mcp_".to_string(),
            api_key_header: "x-api-key".to_string(),
            issuers: Vec::new(),
            leeway_secs: 60,
            jwks_cache_ttl: Duration::from_secs(3600),
            jwks_https_only: true,
            rate_limit: 0,
            public_paths: default_public_paths(),
        }
    }
}

/// A trusted identity provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuerConfig {
    /// Expected `iss` claim
    pub issuer: String,
    /// Key set URI (defaults to `{issuer}/.well-known/jwks.json`)
    #[serde(default)]
    pub jwks_uri: Option<String>,
    /// Accepted audiences (empty = audience not checked)
    #[serde(default)]
    pub audiences: Vec<String>,
    /// Claim carrying the organization id
    #[serde(default = "default_org_claim")]
    pub org_claim: String,
}

fn default_org_claim() -> String {
    "org_id".to_string()
}

/// Connection manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Bound on a single connect attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Connect attempts when the backend is unreachable
    pub connect_attempts: usize,
    /// Fixed delay between connect attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Pooled connections per session
    pub max_per_session: usize,
    /// Pooled connections per backend, across sessions
    pub max_per_backend: usize,
    /// Concurrent callers sharing one pooled connection
    pub max_callers_per_connection: usize,
    /// Idle time before a pooled connection is swept
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Sweep period
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            connect_attempts: 3,
            retry_delay: Duration::from_millis(500),
            max_per_session: 16,
            max_per_backend: 64,
            max_callers_per_connection: 4,
            idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Delegated credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    /// Refresh tokens expiring within this margin
    #[serde(with = "humantime_serde")]
    pub refresh_margin: Duration,
    /// Timeout for token endpoint requests
    #[serde(with = "humantime_serde")]
    pub http_timeout: Duration,
    /// HS256 secret for platform tokens (supports `${VAR}`)
    pub platform_secret: Option<String>,
    /// `iss` of platform tokens
    pub platform_issuer: String,
    /// Platform token lifetime
    #[serde(with = "humantime_serde")]
    pub platform_token_ttl: Duration,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(300),
            http_timeout: Duration::from_secs(10),
            platform_secret: None,
            platform_issuer: "mcp-hub".to_string(),
            platform_token_ttl: Duration::from_secs(300),
        }
    }
}

/// Catalog cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Time an aggregated catalog stays cached
    #[serde(with = "humantime_serde")]
    pub cache_ttl: Duration,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(300),
        }
    }
}

/// Response transform configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransformConfig {
    /// PII masking stage
    pub pii: PiiConfig,
    /// Compact re-encoding stage
    pub encoding: EncodingConfig,
}

/// PII masking stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PiiConfig {
    /// Enable masking
    pub enabled: bool,
    /// Redaction service URL
    pub endpoint: Option<String>,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Language hint sent to the service
    pub language: String,
}

impl Default for PiiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            timeout: Duration::from_secs(5),
            language: "en".to_string(),
        }
    }
}

/// Compact re-encoding stage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// Enable re-encoding
    pub enabled: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Dynamic tool search configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSearchConfig {
    /// `search_tools` limit when the caller gives none
    pub default_limit: usize,
    /// Hard cap on `search_tools` limit
    pub max_limit: usize,
    /// Ranking model (keyword ranking when unset)
    pub ranker: RankerConfig,
}

impl Default for ToolSearchConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            max_limit: 50,
            ranker: RankerConfig::default(),
        }
    }
}

/// Ranking model endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RankerConfig {
    /// Rerank API URL
    pub endpoint: Option<String>,
    /// Model name
    pub model: String,
    /// Bearer key for the API (supports `${VAR}`)
    pub api_key: Option<String>,
    /// Request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RankerConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            model: "rerank-v1".to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

/// Scheduling trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Run the trigger loop
    pub enabled: bool,
    /// How often due triggers are checked
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("MCP_HUB_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Env files must be loaded before ${VAR} expansion
        config.load_env_files();
        config.expand_env_vars()?;

        Ok(config)
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let conn = &self.connection;
        if conn.connect_attempts == 0 {
            return Err(Error::Config("connection.connect_attempts must be >= 1".into()));
        }
        if conn.max_per_session == 0 || conn.max_per_backend == 0 {
            return Err(Error::Config("connection pool limits must be >= 1".into()));
        }
        if conn.max_callers_per_connection == 0 {
            return Err(Error::Config(
                "connection.max_callers_per_connection must be >= 1".into(),
            ));
        }
        if self.tool_search.default_limit == 0
            || self.tool_search.default_limit > self.tool_search.max_limit
        {
            return Err(Error::Config(
                "tool_search.default_limit must be in 1..=max_limit".into(),
            ));
        }
        if self.transform.pii.enabled && self.transform.pii.endpoint.is_none() {
            return Err(Error::Config(
                "transform.pii.endpoint is required when PII masking is enabled".into(),
            ));
        }
        for issuer in &self.auth.issuers {
            url::Url::parse(&issuer.issuer).map_err(|e| {
                Error::Config(format!("Invalid issuer URL '{}': {e}", issuer.issuer))
            })?;
        }
        for backend in &self.store.backends {
            if let TransportDescriptor::StreamableHttp { url } | TransportDescriptor::Sse { url } =
                &backend.transport
            {
                url::Url::parse(url).map_err(|e| {
                    Error::Config(format!("Backend '{}' has invalid URL: {e}", backend.id))
                })?;
            }
        }
        let backend_ids: std::collections::HashSet<&str> =
            self.store.backends.iter().map(|b| b.id.as_str()).collect();
        for endpoint in &self.store.endpoints {
            for child in &endpoint.children {
                if !backend_ids.contains(child.backend_id.as_str()) {
                    return Err(Error::Config(format!(
                        "Endpoint '{}' references unknown backend '{}'",
                        endpoint.id, child.backend_id
                    )));
                }
                // Backend and instance must survive a namespace round trip
                NamespacedToolName::new(&child.backend_id, &child.instance_name, "tool").map_err(|e| {
                    Error::Config(format!(
                        "Endpoint '{}' child '{}/{}' cannot namespace tools: {e}",
                        endpoint.id, child.backend_id, child.instance_name
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!(path = %expanded, "Loaded env file"),
                    Err(e) => tracing::warn!(path = %expanded, error = %e, "Failed to load env file"),
                }
            } else {
                tracing::debug!(path = %expanded, "Env file not found (skipped)");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in config values
    fn expand_env_vars(&mut self) -> Result<()> {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}")
            .map_err(|e| Error::Internal(e.to_string()))?;
        let expand = |value: &mut String| *value = Self::expand_string(&re, value);
        let expand_opt = |value: &mut Option<String>| {
            if let Some(v) = value.as_mut() {
                *v = Self::expand_string(&re, v);
            }
        };

        expand_opt(&mut self.server.public_url);
        expand_opt(&mut self.oauth.platform_secret);
        expand_opt(&mut self.transform.pii.endpoint);
        expand_opt(&mut self.tool_search.ranker.endpoint);
        expand_opt(&mut self.tool_search.ranker.api_key);

        for backend in &mut self.store.backends {
            match &mut backend.transport {
                TransportDescriptor::StreamableHttp { url } | TransportDescriptor::Sse { url } => {
                    expand(url);
                }
                TransportDescriptor::Stdio { env, .. } => env.values_mut().for_each(expand),
            }
        }
        Ok(())
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    fn parse(s: &str) -> Result<Duration, std::num::ParseIntError> {
        // "ms" before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>().map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            hours.parse::<u64>().map(|h| Duration::from_secs(h * 3600))
        } else {
            s.parse::<u64>().map(Duration::from_secs)
        }
    }
}
