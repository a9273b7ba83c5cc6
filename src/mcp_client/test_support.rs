//! POSIX `sh` stub servers for process-level tests.
//!
//! Requests are matched on the exact prefix our serializer emits
//! (`{"jsonrpc":"2.0","id":N,...`), so the stubs need nothing beyond `sh` and
//! `sed`.

use std::time::Duration;

use super::types::ServerConfig;

/// Reads and ignores everything; never answers.
pub(crate) const SILENT_SERVER: &str = "cat >/dev/null";

/// Body of a request loop. `{TOOLS}` is the JSON tool array contents and
/// `{CALL}` the shell run for `tools/call`, with `$id` in scope.
const SERVER_TEMPLATE: &str = r#"while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9][0-9]*\),.*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"stub","version":"0.0.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[%s]}}\n' "$id" '{TOOLS}' ;;
    *'"method":"tools/call"'*)
      {CALL} ;;
  esac
done"#;

/// A `ping` tool whose name can be overridden with `STUB_TOOL_NAME`.
const ECHO_TOOLS: &str = r#"{"name":"'"${STUB_TOOL_NAME:-ping}"'","description":"Replies with pong","inputSchema":{"type":"object","properties":{}}}"#;

const PONG_CALL: &str = r#"printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id""#;

/// Build a stub server script from a tool list and a `tools/call` handler.
pub(crate) fn server_script(tools: &str, call: &str) -> String {
    SERVER_TEMPLATE
        .replace("{TOOLS}", tools)
        .replace("{CALL}", call)
}

/// Standard echo server: one tool (`ping`), answers calls with `pong`.
pub(crate) fn echo_script() -> String {
    server_script(ECHO_TOOLS, PONG_CALL)
}

/// Run `script` under `sh -c` with a short request timeout.
pub(crate) fn stub_config(name: &str, script: &str) -> ServerConfig {
    ServerConfig::new(name, "sh")
        .with_args(["-c", script])
        .with_timeout(Duration::from_secs(2))
}

pub(crate) fn echo_config(name: &str) -> ServerConfig {
    stub_config(name, &echo_script())
}

/// Whether `pid` names a live (non-zombie) process.
#[cfg(target_os = "linux")]
pub(crate) fn pid_alive(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Field 3 follows the parenthesised command name.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.split_whitespace().next())
        .is_some_and(|state| state != "Z" && state != "X")
}

#[cfg(all(unix, not(target_os = "linux")))]
pub(crate) fn pid_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

/// Poll until `pid` is gone, for up to three seconds.
pub(crate) async fn wait_until_dead(pid: u32) -> bool {
    for _ in 0..30 {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

/// Script prefix that writes the shell's pid and the pipes on its fds 0-2
/// to `$PIPE_FILE`, one per line.
#[cfg(target_os = "linux")]
pub(crate) const RECORD_PIPES: &str = r#"echo "$$" > "$PIPE_FILE"
readlink /proc/$$/fd/0 /proc/$$/fd/1 /proc/$$/fd/2 >> "$PIPE_FILE"
"#;

/// Read back what [`RECORD_PIPES`] wrote: `(pid, ["pipe:[inode]", ...])`.
#[cfg(target_os = "linux")]
pub(crate) fn read_pipe_record(path: &std::path::Path) -> (u32, Vec<String>) {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    let pid = lines.next().unwrap().trim().parse().unwrap();
    (pid, lines.map(str::to_string).collect())
}

/// Pipe endpoints currently open in this test process.
#[cfg(target_os = "linux")]
pub(crate) fn open_pipes() -> std::collections::HashSet<String> {
    let Ok(entries) = std::fs::read_dir("/proc/self/fd") else {
        return Default::default();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| std::fs::read_link(entry.path()).ok())
        .map(|link| link.to_string_lossy().into_owned())
        .filter(|link| link.starts_with("pipe:"))
        .collect()
}

/// Whether `pid` is an unreaped child.
#[cfg(target_os = "linux")]
pub(crate) fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next().map(|s| s == "Z"))
        })
        .unwrap_or(false)
}
