//! # mcp-mux
//!
//! Spawns, negotiates with, monitors, and tears down MCP (Model Context
//! Protocol) servers: child processes speaking JSON-RPC over stdio.
//!
//! ```text
//! config.rs                YAML server list with env-var interpolation
//! mcp_client/client.rs     McpManager: admission, dispatch, health, shutdown
//! mcp_client/lifecycle.rs  Supervisor: one child process and its state
//! mcp_client/transport.rs  line-delimited JSON-RPC over the child's pipes
//! mcp_client/registry.rs   aggregated `server.tool` registry
//! ```

pub mod config;
pub mod mcp_client;

pub use mcp_client::{McpError, McpManager, ServerConfig, ToolDescriptor};
