//! Tool registry. Aggregates tool definitions across all MCP servers.
//!
//! Provides:
//! - Tool lookup by fully-qualified name (`server.tool`)
//! - Per-server registration and pruning
//! - Validation that a tool call carries the schema's required fields

use std::collections::HashMap;

use super::errors::McpError;
use super::types::{McpToolDefinition, ToolDescriptor};

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// Aggregated tool registry across all MCP servers.
///
/// Tools are keyed `"server_name.tool_name"` (e.g., `"filesystem.list_dir"`),
/// so two servers exposing the same tool name never collide.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolDescriptor>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all tools of `server_name` with `tools`.
    ///
    /// Returns the number of tools now registered for the server.
    pub fn register_server_tools(
        &mut self,
        server_name: &str,
        tools: Vec<McpToolDefinition>,
    ) -> usize {
        self.unregister_server(server_name);

        let mut registered = 0;
        for def in tools {
            let descriptor = ToolDescriptor {
                name: def.name,
                description: def.description,
                parameters: def.input_schema,
                server: server_name.to_string(),
            };
            let key = descriptor.key();
            tracing::debug!(tool = %key, "registered tool");
            if self.tools.insert(key, descriptor).is_none() {
                registered += 1;
            }
        }
        registered
    }

    /// Remove all tools belonging to a server. Returns how many were removed.
    pub fn unregister_server(&mut self, server_name: &str) -> usize {
        let before = self.tools.len();
        self.tools.retain(|_, tool| tool.server != server_name);
        before - self.tools.len()
    }

    /// Drop every tool.
    pub fn clear(&mut self) {
        self.tools.clear();
    }

    /// Look up a tool by its fully-qualified name.
    pub fn get_tool(&self, name: &str) -> Option<&ToolDescriptor> {
        self.tools.get(name)
    }

    /// All registered tools, ordered by fully-qualified name.
    pub fn all_tools(&self) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| (&a.server, &a.name).cmp(&(&b.server, &b.name)));
        tools
    }

    /// Tools owned by one server, ordered by name.
    pub fn tools_for_server(&self, server_name: &str) -> Vec<ToolDescriptor> {
        let mut tools: Vec<ToolDescriptor> = self
            .tools
            .values()
            .filter(|tool| tool.server == server_name)
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Count tools belonging to a specific server.
    pub fn count_for_server(&self, server_name: &str) -> usize {
        self.tools
            .values()
            .filter(|tool| tool.server == server_name)
            .count()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Validate a tool call: tool exists and required fields are present.
    ///
    /// Full JSON Schema validation is left to the server itself.
    pub fn validate_tool_call(
        &self,
        tool_name: &str,
        arguments: &serde_json::Value,
    ) -> Result<&ToolDescriptor, McpError> {
        let tool = self.get_tool(tool_name).ok_or(McpError::UnknownTool {
            name: tool_name.to_string(),
        })?;

        let required = tool
            .parameters
            .get("required")
            .and_then(serde_json::Value::as_array);
        if let Some(required) = required {
            let args_obj = arguments.as_object();
            for field_name in required.iter().filter_map(serde_json::Value::as_str) {
                let has_field = args_obj.is_some_and(|obj| obj.contains_key(field_name));
                if !has_field {
                    return Err(McpError::InvalidArguments {
                        tool: tool_name.to_string(),
                        reason: format!("missing required field: '{field_name}'"),
                    });
                }
            }
        }

        Ok(tool)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
