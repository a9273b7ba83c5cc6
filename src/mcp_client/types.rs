//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the value types
//! the manager hands back to callers (tool descriptors, health reports).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Constants ───────────────────────────────────────────────────────────────

/// MCP protocol revision announced in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client identity announced in the `initialize` request.
pub const CLIENT_NAME: &str = "mcp-mux";

/// Default per-request timeout for a server.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object. Servers are lax about its shape, so every
/// field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRpcError {
    #[serde(default)]
    pub code: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// Pull the error object out of a response, if it carries one.
    pub fn from_response(response: &serde_json::Value) -> Option<Self> {
        let raw = response.get("error")?;
        Some(serde_json::from_value(raw.clone()).unwrap_or_else(|_| Self {
            message: Some(raw.to_string()),
            ..Self::default()
        }))
    }

    /// Error message, or a generic placeholder when the server sent none.
    pub fn message_or_default(&self) -> String {
        self.message
            .clone()
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Parameters of the `initialize` request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: serde_json::Value,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: serde_json::json!({}),
            client_info: ClientInfo {
                name: CLIENT_NAME.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}

/// Client identity sent during the handshake.
#[derive(Debug, Clone, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// One entry of a `tools/list` result, as sent by the server.
#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
}

// ─── Server Configuration ────────────────────────────────────────────────────

/// How to launch one MCP server. Identity key is `name`.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    /// Overrides merged over the parent environment.
    pub env: HashMap<String, String>,
    /// Bound on every request to this server.
    pub timeout: Duration,
}

impl ServerConfig {
    /// Config with no args, no env overrides, and the default timeout.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// ─── Caller-facing Types ─────────────────────────────────────────────────────

/// A tool exposed by a live server.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// Parameter schema, passed through untouched.
    pub parameters: serde_json::Value,
    /// Name of the server that owns this tool.
    pub server: String,
}

impl ToolDescriptor {
    /// Registry key: `"{server}.{name}"`.
    pub fn key(&self) -> String {
        format!("{}.{}", self.server, self.name)
    }
}

/// Point-in-time copy of the manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub servers_created: u64,
    pub servers_failed: u64,
    pub servers_removed: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
}

/// Health of one supervised server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerHealth {
    pub running: bool,
    pub process_alive: bool,
    pub tools: usize,
    pub pid: Option<u32>,
}

/// Result of [`McpManager::health_check`](super::McpManager::health_check).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub servers: BTreeMap<String, ServerHealth>,
    pub total_tools: usize,
    pub statistics: StatsSnapshot,
}

// ─── Tests ───────────────────────────────────────────────────────────────────
