//! MCP Manager: high-level interface for server admission and tool execution.
//!
//! Orchestrates server lifecycle, tool discovery, and tool call dispatch.
//! One `McpManager` is shared (`Arc<McpManager>`) by every caller; the
//! supervisor map and the tool registry sit behind a single async mutex that
//! is never held across child-process I/O.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use tokio::sync::Mutex;

use super::errors::McpError;
use super::lifecycle::Supervisor;
use super::registry::ToolRegistry;
use super::types::{
    HealthReport, JsonRpcError, McpToolDefinition, ServerConfig, ServerHealth, StatsSnapshot,
    ToolDescriptor,
};

// ─── Stats ───────────────────────────────────────────────────────────────────

/// Monotonic counters, updated without taking the registry lock.
#[derive(Debug, Default)]
struct ManagerStats {
    servers_created: AtomicU64,
    servers_failed: AtomicU64,
    servers_removed: AtomicU64,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl ManagerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            servers_created: self.servers_created.load(Ordering::Relaxed),
            servers_failed: self.servers_failed.load(Ordering::Relaxed),
            servers_removed: self.servers_removed.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

/// Everything guarded by the registry lock.
#[derive(Default)]
struct Registry {
    servers: HashMap<String, Arc<Supervisor>>,
    tools: ToolRegistry,
}

// ─── McpManager ──────────────────────────────────────────────────────────────

/// Manages multiple MCP servers and routes tool calls to them.
pub struct McpManager {
    inner: Mutex<Registry>,
    /// Request ids for every server, unique for the manager's lifetime.
    next_request_id: AtomicU64,
    stats: ManagerStats,
}

impl Default for McpManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            next_request_id: AtomicU64::new(1),
            stats: ManagerStats::default(),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn get_server(&self, name: &str) -> Option<Arc<Supervisor>> {
        self.inner.lock().await.servers.get(name).cloned()
    }

    async fn snapshot(&self) -> Vec<(String, Arc<Supervisor>)> {
        let inner = self.inner.lock().await;
        let mut servers: Vec<_> = inner
            .servers
            .iter()
            .map(|(name, sup)| (name.clone(), Arc::clone(sup)))
            .collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        servers
    }

    /// Empty both maps in one critical section, handing back the supervisors.
    async fn drain(&self) -> Vec<(String, Arc<Supervisor>)> {
        let mut inner = self.inner.lock().await;
        if !inner.tools.is_empty() {
            tracing::debug!(tools = inner.tools.len(), "clearing tool registry");
            inner.tools.clear();
        }
        let mut servers: Vec<_> = inner.servers.drain().collect();
        servers.sort_by(|a, b| a.0.cmp(&b.0));
        servers
    }

    // ─── Admission ───────────────────────────────────────────────────────

    /// Spawn, initialize, and discover a server. All-or-nothing.
    ///
    /// A live server with the same name is removed first. On failure no
    /// trace of the name is left in either map.
    pub async fn add_server(&self, config: ServerConfig) -> Result<(), McpError> {
        let name = config.name.clone();

        if self.get_server(&name).await.is_some() {
            tracing::info!(server = %name, "replacing existing MCP server");
            if let Err(e) = self.remove_server(&name).await {
                tracing::debug!(server = %name, error = %e, "previous server already gone");
            }
        }

        let supervisor = Arc::new(Supervisor::new(config));

        if let Err(e) = supervisor.start().await {
            ManagerStats::bump(&self.stats.servers_failed);
            return Err(e);
        }

        if let Err(e) = supervisor.initialize(self.next_id()).await {
            tracing::error!(server = %name, error = %e, "MCP server failed to initialize");
            supervisor.stop().await;
            ManagerStats::bump(&self.stats.servers_failed);
            return Err(e);
        }

        let tools = self.discover_tools(&supervisor).await;

        let (tool_count, replaced) = {
            let mut inner = self.inner.lock().await;
            let count = inner.tools.register_server_tools(&name, tools);
            (count, inner.servers.insert(name.clone(), supervisor))
        };

        // Another add for the same name won the race; its tools are already gone.
        if let Some(old) = replaced {
            old.stop().await;
            ManagerStats::bump(&self.stats.servers_removed);
        }

        ManagerStats::bump(&self.stats.servers_created);
        tracing::info!(server = %name, tools = tool_count, "added MCP server");
        Ok(())
    }

    /// Admit a batch of servers concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK).
    pub async fn add_servers(&self, configs: Vec<ServerConfig>) -> Vec<(String, McpError)> {
        let attempts = configs.into_iter().map(|config| async move {
            let name = config.name.clone();
            self.add_server(config).await.err().map(|e| (name, e))
        });

        let failures: Vec<(String, McpError)> =
            join_all(attempts).await.into_iter().flatten().collect();

        if !failures.is_empty() {
            tracing::warn!(failed = failures.len(), "some MCP servers failed to start");
        }
        failures
    }

    /// Non-fatal: any failure leaves the server admitted with zero tools.
    async fn discover_tools(&self, supervisor: &Supervisor) -> Vec<McpToolDefinition> {
        match supervisor.list_tools(self.next_id()).await {
            Ok(Some(tools)) => tools,
            Ok(None) => {
                tracing::warn!(server = %supervisor.name(), "tools/list returned no tools array");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(server = %supervisor.name(), error = %e, "tool discovery failed");
                Vec::new()
            }
        }
    }

    /// Stop a server and drop every tool it owns.
    pub async fn remove_server(&self, name: &str) -> Result<(), McpError> {
        let (supervisor, tools_removed) = {
            let mut inner = self.inner.lock().await;
            let supervisor = inner
                .servers
                .remove(name)
                .ok_or_else(|| McpError::UnknownServer {
                    name: name.to_string(),
                })?;
            (supervisor, inner.tools.unregister_server(name))
        };

        supervisor.stop().await;
        ManagerStats::bump(&self.stats.servers_removed);
        tracing::info!(server = %name, tools = tools_removed, "removed MCP server");
        Ok(())
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Execute a tool on a named server.
    ///
    /// Returns the result's `content` when present, else the whole result.
    pub async fn execute_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let supervisor = self
            .get_server(server_name)
            .await
            .ok_or_else(|| McpError::UnknownServer {
                name: server_name.to_string(),
            })?;

        if !supervisor.is_running() {
            return Err(McpError::ServerUnavailable {
                name: server_name.to_string(),
            });
        }

        let id = self.next_id();
        ManagerStats::bump(&self.stats.total_requests);
        tracing::debug!(server = %server_name, tool = %tool_name, id, "calling tool");

        let start = Instant::now();
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });

        let outcome = match supervisor.request(id, "tools/call", Some(params)).await {
            Ok(response) => extract_tool_result(server_name, tool_name, response),
            Err(e) => Err(e),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Ok(_) => {
                tracing::debug!(server = %server_name, tool = %tool_name, elapsed_ms, "tool call succeeded");
            }
            Err(e) => {
                ManagerStats::bump(&self.stats.failed_requests);
                tracing::warn!(
                    server = %server_name,
                    tool = %tool_name,
                    elapsed_ms,
                    error = %e,
                    "tool call failed"
                );
            }
        }
        outcome
    }

    /// Execute a tool by its fully-qualified `server.tool` name.
    ///
    /// Checks the tool exists and its required arguments are present before
    /// anything is sent.
    pub async fn call_tool(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let (server, tool) = {
            let inner = self.inner.lock().await;
            let descriptor = inner.tools.validate_tool_call(qualified_name, &arguments)?;
            (descriptor.server.clone(), descriptor.name.clone())
        };
        self.execute_tool(&server, &tool, arguments).await
    }

    // ─── Status ──────────────────────────────────────────────────────────

    /// Every tool of every admitted server, ordered by key.
    pub async fn get_available_tools(&self) -> Vec<ToolDescriptor> {
        self.inner.lock().await.tools.all_tools()
    }

    /// Tools owned by one server.
    pub async fn get_tools_by_server(&self, name: &str) -> Vec<ToolDescriptor> {
        self.inner.lock().await.tools.tools_for_server(name)
    }

    /// Names of all admitted servers, sorted.
    pub async fn server_names(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut names: Vec<String> = inner.servers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get the number of registered tools.
    pub async fn tool_count(&self) -> usize {
        self.inner.lock().await.tools.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Check every server's OS process and report.
    ///
    /// A server believed running whose process has exited is corrected to
    /// not-running here.
    pub async fn health_check(&self) -> HealthReport {
        let mut servers = BTreeMap::new();
        for (name, supervisor) in self.snapshot().await {
            let process_alive = supervisor.is_process_alive().await;
            servers.insert(
                name,
                ServerHealth {
                    running: supervisor.is_running(),
                    process_alive,
                    tools: 0,
                    pid: supervisor.pid(),
                },
            );
        }

        let inner = self.inner.lock().await;
        for (name, health) in servers.iter_mut() {
            health.tools = inner.tools.count_for_server(name);
        }

        HealthReport {
            servers,
            total_tools: inner.tools.len(),
            statistics: self.stats.snapshot(),
        }
    }

    /// Remove every server that is no longer running. Returns their names.
    pub async fn reap_dead_servers(&self) -> Vec<String> {
        let mut dead = Vec::new();
        for (name, supervisor) in self.snapshot().await {
            supervisor.is_process_alive().await;
            if !supervisor.is_running() {
                dead.push((name, supervisor));
            }
        }

        // Only remove the instance we checked, not a replacement added since.
        let mut removed = Vec::with_capacity(dead.len());
        {
            let mut inner = self.inner.lock().await;
            for (name, checked) in dead {
                let same = inner
                    .servers
                    .get(&name)
                    .is_some_and(|current| Arc::ptr_eq(current, &checked));
                if same {
                    inner.servers.remove(&name);
                    inner.tools.unregister_server(&name);
                    removed.push((name, checked));
                }
            }
        }

        let mut names = Vec::with_capacity(removed.len());
        for (name, supervisor) in removed {
            supervisor.stop().await;
            ManagerStats::bump(&self.stats.servers_removed);
            tracing::info!(server = %name, "removed dead MCP server");
            names.push(name);
        }
        names
    }

    // ─── Shutdown ────────────────────────────────────────────────────────

    /// Stop every server gracefully, one after another.
    pub async fn shutdown(&self) {
        let servers = self.drain().await;
        if servers.is_empty() {
            tracing::debug!("no MCP servers to shut down");
            return;
        }

        tracing::info!(count = servers.len(), "shutting down MCP servers");
        for (_, supervisor) in &servers {
            supervisor.stop().await;
        }
        tracing::info!("all MCP servers shut down");
    }

    /// Kill every server immediately. Safe to call repeatedly.
    pub async fn force_shutdown(&self) {
        let servers = self.drain().await;
        if servers.is_empty() {
            tracing::debug!("no MCP servers to force-stop");
            return;
        }

        tracing::warn!(count = servers.len(), "force-stopping MCP servers");
        join_all(servers.iter().map(|(_, supervisor)| supervisor.force_stop())).await;
    }
}

/// Turn a `tools/call` response into the caller's value.
fn extract_tool_result(
    server: &str,
    tool: &str,
    mut response: serde_json::Value,
) -> Result<serde_json::Value, McpError> {
    if let Some(err) = JsonRpcError::from_response(&response) {
        return Err(McpError::ToolExecution {
            server: server.to_string(),
            tool: tool.to_string(),
            code: err.code,
            message: err.message_or_default(),
            data: err.data,
        });
    }

    let Some(mut result) = response.get_mut("result").map(serde_json::Value::take) else {
        return Ok(serde_json::json!({}));
    };
    let content = result
        .as_object_mut()
        .and_then(|obj| obj.remove("content"));
    Ok(content.unwrap_or(result))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
