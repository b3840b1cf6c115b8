//! HTTP surface: unified MCP endpoints, re-auth metadata, schedules, health

mod router;
mod rpc;
mod server;

pub use router::{AppState, SESSION_HEADER, create_router, reauth_response, resource_metadata_url};
pub use rpc::{InboundMessage, parse_request};
pub use server::Gateway;
