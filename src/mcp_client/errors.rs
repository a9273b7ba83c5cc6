//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be spawned, or exited during the
    /// startup grace window.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{name}' initialization failed: {reason}")]
    InitFailed {
        name: String,
        reason: String,
    },

    /// A request could not be encoded for the wire.
    #[error("transport error for server '{server}': {reason}")]
    TransportError {
        server: String,
        reason: String,
    },

    /// The pipes to the server failed at the OS level (broken pipe, closed
    /// handle, stdout EOF). The server has been demoted to not-running.
    #[error("channel to server '{server}' is broken: {reason}")]
    BrokenChannel {
        server: String,
        reason: String,
    },

    /// No response arrived within the server's configured timeout.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// The server produced lines but none of them answered the request.
    #[error("no response to '{method}' from server '{server}' within {lines} lines")]
    NoResponse {
        server: String,
        method: String,
        lines: usize,
    },

    /// Server returned a JSON-RPC error object for a tool call.
    #[error("tool '{tool}' on server '{server}' failed: {message}")]
    ToolExecution {
        server: String,
        tool: String,
        code: Option<i64>,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No server is registered under this name.
    #[error("unknown server: '{name}'")]
    UnknownServer {
        name: String,
    },

    /// The server is registered but its process is not running.
    #[error("server '{name}' is not running")]
    ServerUnavailable {
        name: String,
    },

    /// Tool not found in the aggregated registry.
    #[error("unknown tool: '{name}'")]
    UnknownTool {
        name: String,
    },

    /// Arguments do not satisfy the tool's declared schema.
    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments {
        tool: String,
        reason: String,
    },

    /// Configuration error (bad config file, duplicate server names).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// Whether this failure was raised before any I/O reached a server.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownServer { .. }
                | Self::ServerUnavailable { .. }
                | Self::UnknownTool { .. }
                | Self::InvalidArguments { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caller_error_classification() {
        assert!(McpError::UnknownServer { name: "x".into() }.is_caller_error());
        assert!(McpError::ServerUnavailable { name: "x".into() }.is_caller_error());
        assert!(!McpError::Timeout {
            server: "x".into(),
            method: "tools/call".into(),
            timeout_ms: 10,
        }
        .is_caller_error());
    }

    #[test]
    fn test_tool_execution_message_carries_child_text() {
        let err = McpError::ToolExecution {
            server: "echo".into(),
            tool: "ping".into(),
            code: Some(-32000),
            message: "boom".into(),
            data: None,
        };
        assert_eq!(err.to_string(), "tool 'ping' on server 'echo' failed: boom");
    }
}
