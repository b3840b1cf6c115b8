//! MCP Hub Library
//!
//! A multi-tenant gateway that puts many Model Context Protocol tool servers
//! behind one URL per unified endpoint.
//!
//! # Features
//!
//! - **Namespaced routing**: tools are exposed as `{backend}__{instance}__{tool}`
//!   and dispatched to the owning backend
//! - **Pooled connections**: Streamable HTTP, SSE and stdio backends, with
//!   session-scoped pooling, bounded retry and idle sweeping
//! - **Credentials**: identity tokens and API keys inbound; static secrets,
//!   delegated OAuth tokens (with single-flight refresh) and platform tokens
//!   outbound
//! - **Response shaping**: PII masking and compact re-encoding of tool results
//! - **Tool search**: `search_tools`/`describe_tools`/`execute_tool` in place
//!   of large catalogs
//! - **Scheduling triggers**: cron registration with timezone-aware next runs

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod cli;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod routing;
pub mod scheduler;
pub mod search;
pub mod store;
pub mod transform;
pub mod transport;

pub use error::{Error, Result};
pub use gateway_core::{NamespacedToolName, ToolNameError};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(e.to_string()))?,
    }

    Ok(())
}
