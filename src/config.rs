//! Server list configuration loading.
//!
//! Reads `config.yaml` (by default under the platform config directory) and
//! resolves environment variables. The file is the single source of truth for
//! which MCP servers are launched and how.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mcp_client::{McpError, ServerConfig};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "MCP_MUX_CONFIG";

const DEFAULT_TIMEOUT_SECS: u64 = 10;

const DEFAULT_CONFIG: &str = r#"# mcp-mux configuration
#
# Each server is launched as a child process speaking JSON-RPC over stdio.
# Values may reference environment variables as ${VAR} or ${VAR:-default}.
mcp:
  enabled: true
  servers:
    - name: filesystem
      command: npx
      args:
        - "-y"
        - "@modelcontextprotocol/server-filesystem"
        - "${MCP_FS_ROOT:-~}"
      timeout: 10
"#;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mcp: McpConfig,
}

/// The `mcp:` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct McpConfig {
    /// When `false`, no servers are started.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            servers: Vec::new(),
        }
    }
}

/// One server as written in the file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl ServerEntry {
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
            timeout: Duration::from_secs(self.timeout),
        }
    }
}

impl AppConfig {
    /// Launch configs for every server, or none when MCP is disabled.
    pub fn server_configs(&self) -> Vec<ServerConfig> {
        if !self.mcp.enabled {
            return Vec::new();
        }
        self.mcp
            .servers
            .iter()
            .map(ServerEntry::to_server_config)
            .collect()
    }

    /// Find one server's entry by name.
    pub fn server(&self, name: &str) -> Option<&ServerEntry> {
        self.mcp.servers.iter().find(|entry| entry.name == name)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Default config location: `<config dir>/mcp-mux/config.yaml`.
///
/// Falls back to `~/.mcp-mux/config.yaml` when no platform config directory
/// can be resolved.
pub fn default_config_path() -> PathBuf {
    if let Some(dir) = dirs::config_dir() {
        return dir.join("mcp-mux").join("config.yaml");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-mux")
        .join("config.yaml")
}

/// Load and parse a configuration file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<AppConfig, McpError> {
    let raw = std::fs::read_to_string(path).map_err(|e| McpError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    let config = parse_config(&raw)?;
    tracing::debug!(
        path = %path.display(),
        servers = config.mcp.servers.len(),
        "loaded configuration"
    );
    Ok(config)
}

/// Parse configuration text. Server names must be unique and timeouts
/// non-zero.
pub fn parse_config(raw: &str) -> Result<AppConfig, McpError> {
    let interpolated = interpolate_env_vars(raw);
    let config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    let mut seen = HashSet::new();
    for entry in &config.mcp.servers {
        if entry.name.is_empty() {
            return Err(McpError::ConfigError {
                reason: "server entry with an empty name".into(),
            });
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(McpError::ConfigError {
                reason: format!("duplicate server name '{}'", entry.name),
            });
        }
        if entry.timeout == 0 {
            return Err(McpError::ConfigError {
                reason: format!("server '{}': timeout must be at least 1 second", entry.name),
            });
        }
    }

    Ok(config)
}

/// Write a starter config to `path`, creating parent directories.
///
/// Returns `Ok(false)` without touching anything if the file already exists.
pub fn write_default_config(path: &Path) -> Result<bool, McpError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| McpError::ConfigError {
            reason: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    std::fs::write(path, DEFAULT_CONFIG).map_err(|e| McpError::ConfigError {
        reason: format!("failed to write {}: {e}", path.display()),
    })?;
    tracing::info!(path = %path.display(), "wrote default configuration");
    Ok(true)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_expr = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '}' {
                    closed = true;
                    break;
                }
                var_expr.push(c);
            }
            if closed {
                result.push_str(&resolve_var_expr(&var_expr));
            } else {
                result.push_str("${");
                result.push_str(&var_expr);
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve `VAR` or `VAR:-default`. An unset variable without a default is
/// left as written.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_else(|_| format!("${{{expr}}}"))
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
