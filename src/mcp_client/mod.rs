//! MCP Client: JSON-RPC over stdio for MCP server management.
//!
//! This module handles:
//! - Spawning and supervising MCP server child processes
//! - JSON-RPC 2.0 communication over process stdio
//! - Tool discovery and aggregation across all servers
//! - Tool call routing and execution
//! - Health checks, graceful and forced shutdown

pub mod client;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use client::McpManager;
pub use errors::McpError;
pub use lifecycle::{Supervisor, SupervisorState};
pub use registry::ToolRegistry;
pub use types::{
    HealthReport, McpToolDefinition, ServerConfig, ServerHealth, StatsSnapshot, ToolDescriptor,
};
