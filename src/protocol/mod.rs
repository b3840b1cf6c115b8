//! MCP protocol types

mod messages;
mod types;

pub use messages::*;
pub use types::*;

/// Newest protocol version spoken by the hub
pub const PROTOCOL_VERSION: &str = "2025-06-18";

/// Versions the hub accepts from clients and backends, newest first
pub const SUPPORTED_VERSIONS: &[&str] = &["2025-06-18", "2025-03-26", "2024-11-05"];

/// Version assumed when a client does not send one
pub const FALLBACK_VERSION: &str = "2024-11-05";

/// Pick the version to answer an `initialize` with.
///
/// A supported client version is echoed back; anything else gets the newest
/// version the hub speaks.
#[must_use]
pub fn negotiate_version(requested: Option<&str>) -> &'static str {
    let requested = requested.unwrap_or(FALLBACK_VERSION);
    SUPPORTED_VERSIONS
        .iter()
        .copied()
        .find(|v| *v == requested)
        .unwrap_or(PROTOCOL_VERSION)
}
