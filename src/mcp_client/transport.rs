//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with MCP server child processes:
//! - Writing JSON-RPC requests to stdin
//! - Reading JSON-RPC responses from stdout on a dedicated reader task
//! - Draining stderr into the log so the child never blocks on a full pipe
//! - Line-delimited JSON protocol (one JSON object per line)

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Lines inspected per response before giving up on a request.
pub const MAX_RESPONSE_LINES: usize = 50;

/// Stdout lines buffered between the reader task and the request path.
const LINE_BUFFER: usize = 256;

// ─── Frame Classification ────────────────────────────────────────────────────

/// What a single stdout line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Blank line or not JSON at all (server log output, banners).
    Noise,
    /// An object carrying a `method` field.
    Notification(String),
    /// Anything else: a response candidate.
    Message(serde_json::Value),
}

/// Classify one line read from a server's stdout.
pub fn classify_line(line: &str) -> Frame {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Frame::Noise;
    }

    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => match value.get("method") {
            Some(method) => Frame::Notification(
                method.as_str().map_or_else(|| method.to_string(), str::to_string),
            ),
            None => Frame::Message(value),
        },
        Err(_) => Frame::Noise,
    }
}

/// Whether `message` answers the request we are waiting for.
///
/// With an id, the `id` must match exactly. Without one, the first object
/// carrying a `result` is taken.
pub fn is_answer(message: &serde_json::Value, expected_id: Option<u64>) -> bool {
    match expected_id {
        Some(id) => message.get("id").and_then(serde_json::Value::as_u64) == Some(id),
        None => message.get("result").is_some(),
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
///
/// Owns all three pipe handles. Dropping the transport closes stdin and
/// aborts the stdout/stderr tasks, which releases the other two.
pub struct StdioTransport {
    server_name: String,
    writer: ChildStdin,
    lines: mpsc::Receiver<String>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
}

impl StdioTransport {
    /// Create a transport from a child's pipes and start its reader tasks.
    pub fn new(
        server_name: &str,
        stdin: ChildStdin,
        stdout: ChildStdout,
        stderr: Option<ChildStderr>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        let reader_task = tokio::spawn(read_stdout(server_name.to_string(), stdout, tx));
        let stderr_task =
            stderr.map(|pipe| tokio::spawn(drain_stderr(server_name.to_string(), pipe)));

        Self {
            server_name: server_name.to_string(),
            writer: stdin,
            lines: rx,
            reader_task,
            stderr_task,
        }
    }

    /// Write one request line and flush it.
    pub async fn send_request(&mut self, request: &JsonRpcRequest) -> Result<(), McpError> {
        // Anything queued now belongs to an earlier, abandoned request.
        let stale = self.discard_pending();
        if stale > 0 {
            tracing::debug!(server = %self.server_name, stale, "discarded stale stdout lines");
        }
        tracing::debug!(
            server = %self.server_name,
            id = request.id,
            method = %request.method,
            "sending request"
        );
        self.write_frame(request).await
    }

    /// Write one notification line and flush it. No response is awaited.
    ///
    /// A write that cannot finish within `timeout` leaves a partial frame on
    /// the pipe and is reported as [`McpError::BrokenChannel`].
    pub async fn send_notification(
        &mut self,
        notification: &JsonRpcNotification,
        timeout: Duration,
    ) -> Result<(), McpError> {
        tracing::debug!(
            server = %self.server_name,
            method = %notification.method,
            "sending notification"
        );
        let outcome = tokio::time::timeout(timeout, self.write_frame(notification)).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => Err(self.write_stalled(&notification.method, timeout)),
        }
    }

    /// Wait for the response to a request.
    ///
    /// Gives up with [`McpError::Timeout`] once `timeout` elapses and with
    /// [`McpError::NoResponse`] after [`MAX_RESPONSE_LINES`] lines.
    pub async fn read_response(
        &mut self,
        method: &str,
        expected_id: Option<u64>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        match tokio::time::timeout(timeout, self.next_answer(method, expected_id)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(self.timed_out(method, timeout)),
        }
    }

    /// Send a request and wait for its response, both within `timeout`.
    ///
    /// Expiry while the request is still being written means the child has
    /// stopped reading stdin and the stream holds a partial frame, so it is
    /// reported as [`McpError::BrokenChannel`]. Expiry while waiting for the
    /// answer is a plain [`McpError::Timeout`].
    pub async fn request(
        &mut self,
        request: &JsonRpcRequest,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let mut written = false;
        let exchange = async {
            self.send_request(request).await?;
            written = true;
            self.next_answer(&request.method, Some(request.id)).await
        };

        let outcome = tokio::time::timeout(timeout, exchange).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) if written => Err(self.timed_out(&request.method, timeout)),
            Err(_) => Err(self.write_stalled(&request.method, timeout)),
        }
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> McpError {
        tracing::warn!(
            server = %self.server_name,
            method,
            timeout_ms = timeout.as_millis() as u64,
            "request timed out"
        );
        McpError::Timeout {
            server: self.server_name.clone(),
            method: method.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    fn write_stalled(&self, method: &str, timeout: Duration) -> McpError {
        tracing::warn!(
            server = %self.server_name,
            method,
            timeout_ms = timeout.as_millis() as u64,
            "server stopped reading stdin, write did not complete"
        );
        McpError::BrokenChannel {
            server: self.server_name.clone(),
            reason: format!(
                "write of '{method}' did not complete within {}ms",
                timeout.as_millis()
            ),
        }
    }

    async fn next_answer(
        &mut self,
        method: &str,
        expected_id: Option<u64>,
    ) -> Result<serde_json::Value, McpError> {
        for _ in 0..MAX_RESPONSE_LINES {
            let Some(line) = self.lines.recv().await else {
                return Err(McpError::BrokenChannel {
                    server: self.server_name.clone(),
                    reason: "server stdout closed (process may have exited)".into(),
                });
            };

            match classify_line(&line) {
                Frame::Noise => continue,
                Frame::Notification(kind) => {
                    tracing::debug!(server = %self.server_name, method = %kind, "skipping notification");
                }
                Frame::Message(message) if is_answer(&message, expected_id) => {
                    tracing::debug!(server = %self.server_name, response = %message, "received response");
                    return Ok(message);
                }
                Frame::Message(message) => {
                    tracing::debug!(
                        server = %self.server_name,
                        id = ?message.get("id"),
                        "skipping response for another request"
                    );
                }
            }
        }

        Err(McpError::NoResponse {
            server: self.server_name.clone(),
            method: method.to_string(),
            lines: MAX_RESPONSE_LINES,
        })
    }

    async fn write_frame<T: Serialize>(&mut self, frame: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(frame).map_err(|e| McpError::TransportError {
            server: self.server_name.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::BrokenChannel {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        self.writer
            .flush()
            .await
            .map_err(|e| McpError::BrokenChannel {
                server: self.server_name.clone(),
                reason: format!("failed to flush stdin: {e}"),
            })
    }

    fn discard_pending(&mut self) -> usize {
        let mut discarded = 0;
        while self.lines.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

// ─── Reader Tasks ────────────────────────────────────────────────────────────

/// Forward stdout lines until EOF, a read error, or the transport goes away.
async fn read_stdout(server: String, stdout: ChildStdout, tx: mpsc::Sender<String>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) => {
                tracing::debug!(server = %server, "server stdout reached EOF");
                break;
            }
            Err(e) => {
                tracing::warn!(server = %server, error = %e, "error reading server stdout");
                break;
            }
        }
    }
}

async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, stderr = %line, "server stderr");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
