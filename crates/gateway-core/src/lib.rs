//! Core routing primitives shared by the MCP hub gateway.
//!
//! Every tool exposed through a unified endpoint is addressed by a
//! [`NamespacedToolName`]: `{backendId}__{instanceName}__{toolName}`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod tool_name;

pub use tool_name::{NamespacedToolName, SEPARATOR, ToolNameError};
