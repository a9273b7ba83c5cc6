//! Server process lifecycle management.
//!
//! A [`Supervisor`] owns one MCP server child process: spawning it in its
//! own process group, probing whether it is still alive, and tearing it down
//! (gracefully or not). Pipes live in the [`StdioTransport`]; the child
//! handle lives here. Both are released on every exit path.

use std::sync::Mutex as StdMutex;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::StdioTransport;
use super::types::{
    InitializeParams, JsonRpcError, JsonRpcNotification, JsonRpcRequest, McpToolDefinition,
    ServerConfig,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// How long a freshly spawned server must survive before it counts as started.
const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Timeout for graceful shutdown before force-killing.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on waiting for the exit status after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// The process exited without being asked to. Cleared by `stop()`.
    Crashed,
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// One MCP server process, its pipes, and its running state.
pub struct Supervisor {
    config: ServerConfig,
    state: StdMutex<SupervisorState>,
    /// Pid of the attached child, kept after it exits until handles are released.
    pid: StdMutex<Option<u32>>,
    /// The child handle. Held only briefly; never across a request.
    process: Mutex<Option<Child>>,
    /// Request I/O. One logical request in flight per server.
    channel: Mutex<Option<StdioTransport>>,
}

impl Supervisor {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            state: StdMutex::new(SupervisorState::Stopped),
            pid: StdMutex::new(None),
            process: Mutex::new(None),
            channel: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached running flag. See [`Supervisor::is_process_alive`] for the OS view.
    pub fn is_running(&self) -> bool {
        self.state() == SupervisorState::Running
    }

    fn set_state(&self, next: SupervisorState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// OS process id of the attached child, even if it has already exited.
    ///
    /// Cleared once the child is reaped by `stop()`, `force_stop()`, or a
    /// failed start.
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
    }

    // ─── Start ───────────────────────────────────────────────────────────

    /// Spawn the server process and confirm it survives the startup grace.
    pub async fn start(&self) -> Result<(), McpError> {
        if self.process.lock().await.is_some() {
            tracing::debug!(server = %self.name(), "process already attached, stopping it first");
            self.stop().await;
        }

        self.set_state(SupervisorState::Starting);

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        // Parent environment is inherited; config entries override it.
        cmd.envs(&self.config.env);

        // Wire stdio for JSON-RPC. std opens every other descriptor
        // close-on-exec, so the child sees only these three.
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        // Own process group, so the server and anything it forks die together.
        #[cfg(unix)]
        cmd.process_group(0);

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.set_state(SupervisorState::Stopped);
                tracing::error!(
                    server = %self.name(),
                    command = %self.config.command,
                    error = %e,
                    "failed to spawn MCP server"
                );
                return Err(McpError::SpawnFailed {
                    name: self.name().to_string(),
                    reason: format!("{e}"),
                });
            }
        };

        let pipes = (child.stdin.take(), child.stdout.take(), child.stderr.take());
        let (Some(stdin), Some(stdout), stderr) = pipes else {
            kill_process_group(self.name(), &mut child);
            reap(self.name(), child).await;
            self.set_state(SupervisorState::Stopped);
            return Err(McpError::SpawnFailed {
                name: self.name().to_string(),
                reason: "failed to capture stdio pipes".into(),
            });
        };

        let pid = child.id();
        *self.channel.lock().await = Some(StdioTransport::new(self.name(), stdin, stdout, stderr));
        *self.process.lock().await = Some(child);
        self.set_pid(pid);

        tokio::time::sleep(STARTUP_GRACE).await;

        let exit = {
            let mut guard = self.process.lock().await;
            match guard.as_mut().map(Child::try_wait) {
                Some(Ok(None)) => None,
                Some(Ok(Some(status))) => Some(format!("exited during startup ({status})")),
                Some(Err(e)) => Some(format!("failed to poll process: {e}")),
                None => Some("process handle lost during startup".to_string()),
            }
        };

        if let Some(reason) = exit {
            tracing::error!(server = %self.name(), reason = %reason, "MCP server failed to start");
            self.cleanup().await;
            return Err(McpError::SpawnFailed {
                name: self.name().to_string(),
                reason,
            });
        }

        self.set_state(SupervisorState::Running);
        tracing::info!(server = %self.name(), pid = ?pid, "started MCP server");
        Ok(())
    }

    // ─── Stop ────────────────────────────────────────────────────────────

    /// Terminate the server: SIGTERM, bounded wait, then SIGKILL the group.
    ///
    /// Pipes are closed and the exit status reaped on every path. Never fails.
    pub async fn stop(&self) {
        let was_running = self.is_running();
        if was_running {
            self.set_state(SupervisorState::Stopping);
        }

        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            if was_running {
                terminate_gracefully(self.name(), &mut child).await;
            }
            reap(self.name(), child).await;
        }

        self.close_channel().await;
        self.set_pid(None);
        self.set_state(SupervisorState::Stopped);

        if was_running {
            tracing::info!(server = %self.name(), "stopped MCP server");
        }
    }

    /// Kill the server immediately, with no grace period. Idempotent.
    pub async fn force_stop(&self) {
        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            kill_process_group(self.name(), &mut child);
            reap(self.name(), child).await;
            tracing::info!(server = %self.name(), "force-killed MCP server");
        }

        self.close_channel().await;
        self.set_pid(None);
        self.set_state(SupervisorState::Stopped);
    }

    /// Release everything without signalling politely first.
    async fn cleanup(&self) {
        let child = self.process.lock().await.take();
        if let Some(child) = child {
            reap(self.name(), child).await;
        }
        self.close_channel().await;
        self.set_pid(None);
        self.set_state(SupervisorState::Stopped);
    }

    async fn close_channel(&self) {
        if self.channel.lock().await.take().is_some() {
            tracing::debug!(server = %self.name(), "closed server pipes");
        }
    }

    // ─── Liveness ────────────────────────────────────────────────────────

    /// Ask the OS whether the process is still alive.
    ///
    /// A server believed to be running whose process has exited is moved
    /// to [`SupervisorState::Crashed`].
    pub async fn is_process_alive(&self) -> bool {
        let alive = {
            let mut guard = self.process.lock().await;
            match guard.as_mut() {
                Some(child) => matches!(child.try_wait(), Ok(None)),
                None => false,
            }
        };

        if !alive && self.is_running() {
            self.set_state(SupervisorState::Crashed);
            tracing::warn!(server = %self.name(), "detected dead process for MCP server");
        }
        alive
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send one request and wait for its response, bounded by the server's timeout.
    ///
    /// Calls to the same server queue on the channel lock. An OS-level pipe
    /// failure marks the server not-running and releases its resources.
    pub async fn request(
        &self,
        id: u64,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let mut guard = self.channel.lock().await;
        let Some(transport) = guard.as_mut() else {
            return Err(McpError::ServerUnavailable {
                name: self.name().to_string(),
            });
        };

        let request = JsonRpcRequest::new(id, method, params);
        let outcome = transport.request(&request, self.config.timeout).await;

        if let Err(McpError::BrokenChannel { reason, .. }) = &outcome {
            tracing::warn!(
                server = %self.name(),
                reason = %reason,
                "broken pipe/connection to MCP server, marking as stopped"
            );
            guard.take();
            drop(guard);
            self.cleanup().await;
        }

        outcome
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut guard = self.channel.lock().await;
        let Some(transport) = guard.as_mut() else {
            return Err(McpError::ServerUnavailable {
                name: self.name().to_string(),
            });
        };

        let outcome = transport
            .send_notification(&JsonRpcNotification::new(method, params), self.config.timeout)
            .await;

        if outcome.is_err() {
            guard.take();
            drop(guard);
            self.cleanup().await;
        }
        outcome
    }

    // ─── MCP Handshake ───────────────────────────────────────────────────

    /// Perform the MCP initialization handshake.
    ///
    /// Any failure, including an `error` in the response, is reported as
    /// [`McpError::InitFailed`].
    pub async fn initialize(&self, id: u64) -> Result<(), McpError> {
        tracing::info!(server = %self.name(), "initializing MCP server");

        let params = serde_json::to_value(InitializeParams::default()).map_err(|e| {
            McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("failed to encode initialize params: {e}"),
            }
        })?;

        let response = self
            .request(id, "initialize", Some(params))
            .await
            .map_err(|e| McpError::InitFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        if let Some(err) = JsonRpcError::from_response(&response) {
            return Err(McpError::InitFailed {
                name: self.name().to_string(),
                reason: format!("server returned error: {}", err.message_or_default()),
            });
        }

        tracing::debug!(
            server = %self.name(),
            server_info = ?response.pointer("/result/serverInfo"),
            "initialize response received"
        );

        self.notify("notifications/initialized", None)
            .await
            .map_err(|e| McpError::InitFailed {
                name: self.name().to_string(),
                reason: e.to_string(),
            })?;

        tracing::info!(server = %self.name(), "successfully initialized MCP server");
        Ok(())
    }

    /// Ask the server for its tools. `Ok(None)` means it answered without
    /// a usable `result.tools` array.
    pub async fn list_tools(&self, id: u64) -> Result<Option<Vec<McpToolDefinition>>, McpError> {
        let response = self
            .request(id, "tools/list", Some(serde_json::json!({})))
            .await?;

        let Some(entries) = response
            .pointer("/result/tools")
            .and_then(serde_json::Value::as_array)
        else {
            return Ok(None);
        };

        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<McpToolDefinition>(entry.clone()) {
                Ok(def) if !def.name.is_empty() => tools.push(def),
                Ok(_) => {
                    tracing::warn!(server = %self.name(), entry = %entry, "skipping tool without a name");
                }
                Err(e) => {
                    tracing::warn!(server = %self.name(), error = %e, "failed to process tool entry");
                }
            }
        }
        Ok(Some(tools))
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        // Dropped without stop(): take the whole group down.
        if let Some(child) = self.process.get_mut().as_mut() {
            kill_process_group(&self.config.name, child);
        }
    }
}

// ─── Process Helpers ─────────────────────────────────────────────────────────

/// SIGTERM the process group and wait up to [`SHUTDOWN_GRACE`]; SIGKILL on timeout.
async fn terminate_gracefully(name: &str, child: &mut Child) {
    signal_terminate(name, child);

    match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server = name, %status, "server exited after SIGTERM");
        }
        Ok(Err(e)) => {
            tracing::warn!(server = name, error = %e, "wait failed after SIGTERM");
            kill_process_group(name, child);
        }
        Err(_) => {
            tracing::warn!(
                server = name,
                "MCP server didn't terminate gracefully, force killing"
            );
            kill_process_group(name, child);
        }
    }
}

#[cfg(unix)]
fn signal_terminate(name: &str, child: &mut Child) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pid, Signal::SIGTERM) {
        tracing::debug!(server = name, error = %e, "killpg SIGTERM failed, signalling process");
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            tracing::warn!(server = name, error = %e, "SIGTERM failed");
        }
    }
}

#[cfg(not(unix))]
fn signal_terminate(name: &str, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(server = name, error = %e, "failed to terminate process");
    }
}

/// SIGKILL the whole process group, falling back to the direct child.
fn kill_process_group(name: &str, child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => return,
                Err(e) => {
                    tracing::debug!(server = name, error = %e, "killpg SIGKILL failed, killing process");
                }
            }
        }
    }

    if let Err(e) = child.start_kill() {
        tracing::debug!(server = name, error = %e, "kill failed (process likely already exited)");
    }
}

/// Collect the exit status so no zombie is left behind, killing first if needed.
async fn reap(name: &str, mut child: Child) {
    match child.try_wait() {
        Ok(Some(_)) => return,
        Ok(None) => kill_process_group(name, &mut child),
        Err(e) => {
            tracing::warn!(server = name, error = %e, "failed to poll process during cleanup");
            kill_process_group(name, &mut child);
        }
    }

    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(server = name, %status, "reaped server process");
        }
        Ok(Err(e)) => {
            tracing::warn!(server = name, error = %e, "error during process cleanup");
        }
        Err(_) => {
            tracing::warn!(server = name, "process did not exit after SIGKILL");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::test_support::{
        echo_config, pid_alive, stub_config, wait_until_dead, SILENT_SERVER,
    };

    #[tokio::test]
    async fn test_start_and_stop() {
        let supervisor = Supervisor::new(echo_config("echo"));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);

        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        let pid = supervisor.pid().expect("live pid");
        assert!(supervisor.is_process_alive().await);

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(supervisor.pid().is_none());
        assert!(wait_until_dead(pid).await);
    }

    #[tokio::test]
    async fn test_stop_when_never_started_is_noop() {
        let supervisor = Supervisor::new(echo_config("idle"));
        supervisor.stop().await;
        supervisor.force_stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_missing_executable_fails_to_spawn() {
        let config = ServerConfig::new("ghost", "/nonexistent/definitely-not-an-mcp-server");
        let supervisor = Supervisor::new(config);
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_early_exit_fails_to_spawn() {
        let supervisor = Supervisor::new(stub_config("quitter", "exit 3"));
        let err = supervisor.start().await.unwrap_err();
        match err {
            McpError::SpawnFailed { reason, .. } => assert!(reason.contains("exited")),
            other => panic!("expected SpawnFailed, got {other:?}"),
        }
        assert!(supervisor.pid().is_none());
        assert!(supervisor.channel.lock().await.is_none());
    }

    #[tokio::test]
    async fn test_force_stop_is_idempotent() {
        let supervisor = Supervisor::new(stub_config("silent", SILENT_SERVER));
        supervisor.start().await.unwrap();
        let pid = supervisor.pid().unwrap();

        supervisor.force_stop().await;
        supervisor.force_stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
        assert!(wait_until_dead(pid).await);
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_server_is_killed_after_grace() {
        let script = "trap '' TERM; while :; do sleep 1; done";
        let supervisor = Supervisor::new(stub_config("stubborn", script));
        supervisor.start().await.unwrap();
        let pid = supervisor.pid().unwrap();

        let started = std::time::Instant::now();
        supervisor.stop().await;
        assert!(started.elapsed() >= SHUTDOWN_GRACE);
        assert!(started.elapsed() < SHUTDOWN_GRACE + REAP_TIMEOUT + Duration::from_secs(2));
        assert!(wait_until_dead(pid).await);
    }

    #[tokio::test]
    async fn test_crash_detected_by_liveness_check() {
        let supervisor = Supervisor::new(stub_config("fragile", "sleep 1"));
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!supervisor.is_process_alive().await);
        assert_eq!(supervisor.state(), SupervisorState::Crashed);

        supervisor.stop().await;
        assert_eq!(supervisor.state(), SupervisorState::Stopped);
    }

    #[tokio::test]
    async fn test_env_overrides_reach_child() {
        let config = echo_config("envy").with_env("STUB_TOOL_NAME", "from_env");
        let supervisor = Supervisor::new(config);
        supervisor.start().await.unwrap();
        supervisor.initialize(1).await.unwrap();

        let tools = supervisor.list_tools(2).await.unwrap().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "from_env");
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_initialize_error_is_init_failed() {
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"error":{"code":-32600,"message":"unsupported"}}\n' "$id"
done"#;
        let supervisor = Supervisor::new(stub_config("grumpy", script));
        supervisor.start().await.unwrap();
        let err = supervisor.initialize(1).await.unwrap_err();
        match err {
            McpError::InitFailed { reason, .. } => assert!(reason.contains("unsupported")),
            other => panic!("expected InitFailed, got {other:?}"),
        }
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_broken_pipe_marks_not_running() {
        // Answers initialize, then exits on the next request.
        let script = r#"IFS= read -r line
id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
printf '{"jsonrpc":"2.0","id":%s,"result":{}}\n' "$id"
IFS= read -r line
IFS= read -r line
exit 0"#;
        let supervisor = Supervisor::new(stub_config("flaky", script));
        supervisor.start().await.unwrap();
        supervisor.initialize(1).await.unwrap();

        let err = supervisor.request(2, "tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::BrokenChannel { .. }));
        assert!(!supervisor.is_running());
        assert!(supervisor.pid().is_none());

        let err = supervisor.request(3, "tools/list", None).await.unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable { .. }));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_kills_grandchildren() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = r#"sleep 60 </dev/null >/dev/null 2>&1 &
echo $! > "$PID_FILE"
cat >/dev/null"#;
        let config = stub_config("parent", script)
            .with_env("PID_FILE", pid_file.to_string_lossy());
        let supervisor = Supervisor::new(config);
        supervisor.start().await.unwrap();

        let grandchild: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid_alive(grandchild));

        supervisor.stop().await;
        assert!(wait_until_dead(grandchild).await);
    }
}
