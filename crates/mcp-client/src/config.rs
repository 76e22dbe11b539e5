//! Configuration types for MCP servers
//!
//! Supports project-level (`.mcp.json`) and user-level (`~/.config/mcp-rs/mcp.json`)
//! configuration files with merge support.

use crate::error::MCPError;
use crate::retry::RetryPolicy;
use crate::sandbox::ResourceLimits;
use crate::types::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root MCP configuration
///
/// # Example
///
/// ```json
/// {
///   "mcpServers": [
///     {
///       "name": "filesystem",
///       "transport": "stdio",
///       "command": "npx",
///       "args": ["-y", "@modelcontextprotocol/server-filesystem", "/workspace"]
///     },
///     {
///       "name": "search",
///       "transport": "sse",
///       "url": "https://mcp.example.com/sse",
///       "headers": {"Authorization": "Bearer ${SEARCH_TOKEN}"}
///     }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MCPConfig {
    /// MCP server definitions
    #[serde(default)]
    pub mcp_servers: Vec<ServerConfig>,
}

/// Configuration of a single MCP server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Unique server name
    pub name: String,

    /// Transport and its specific settings
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Request and connect timeout in milliseconds
    #[serde(rename = "timeout", default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Disabled servers are skipped by batch connect
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Apply environment sanitization, process-group isolation and resource limits
    #[serde(default = "default_true")]
    pub sandboxed: bool,

    /// Maximum outgoing requests per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_rpm: Option<u32>,

    /// Reconnect after an unexpected close
    #[serde(default = "default_true")]
    pub reconnect_on_error: bool,

    /// Upper bound on reconnection attempts
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Backoff used between reconnection attempts
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Resource ceilings for sandboxed subprocesses
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_limits: Option<ResourceLimitsConfig>,
}

/// Transport-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Stdio transport (for local subprocess MCP servers)
    Stdio {
        /// Command to execute
        command: String,

        /// Command arguments
        #[serde(default)]
        args: Vec<String>,

        /// Environment variables
        #[serde(default)]
        env: HashMap<String, String>,

        /// Working directory (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },

    /// SSE (Server-Sent Events) transport
    Sse {
        /// Server URL
        url: String,

        /// HTTP headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },

    /// WebSocket transport
    Websocket {
        /// Server URL
        url: String,

        /// Handshake headers
        #[serde(default)]
        headers: HashMap<String, String>,
    },
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Stdio { .. } => TransportKind::Stdio,
            TransportConfig::Sse { .. } => TransportKind::Sse,
            TransportConfig::Websocket { .. } => TransportKind::Websocket,
        }
    }
}

/// Reconnection backoff, same shape as [`RetryPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_reconnect_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_reconnect_max_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_reconnect_initial_ms(),
            multiplier: default_reconnect_multiplier(),
            max_delay_ms: default_reconnect_max_ms(),
            jitter: true,
        }
    }
}

/// Resource ceilings as written in configuration files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_mb: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_cpu_percent: Option<f32>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl From<&ResourceLimitsConfig> for ResourceLimits {
    fn from(config: &ResourceLimitsConfig) -> Self {
        ResourceLimits {
            max_memory_bytes: config.max_memory_mb.map(|mb| mb * 1024 * 1024),
            max_cpu_percent: config.max_cpu_percent,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }
}

// Default functions for serde
fn default_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_multiplier() -> f64 {
    2.0
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

impl ServerConfig {
    /// Stdio server with defaults for everything but the command line
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    /// SSE server with defaults
    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Sse {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    /// WebSocket server with defaults
    pub fn websocket(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self::with_transport(
            name,
            TransportConfig::Websocket {
                url: url.into(),
                headers: HashMap::new(),
            },
        )
    }

    pub fn with_transport(name: impl Into<String>, transport: TransportConfig) -> Self {
        Self {
            name: name.into(),
            transport,
            timeout_ms: default_timeout_ms(),
            enabled: true,
            sandboxed: true,
            rate_limit_rpm: None,
            reconnect_on_error: true,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect: ReconnectConfig::default(),
            resource_limits: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.transport.kind()
    }

    /// Retry policy driving the `reconnecting` state
    pub fn reconnect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_reconnect_attempts,
            Duration::from_millis(self.reconnect.initial_delay_ms),
            Duration::from_millis(self.reconnect.max_delay_ms),
            self.reconnect.multiplier,
        )
        .with_jitter(self.reconnect.jitter)
    }

    /// Effective resource limits, only for sandboxed servers
    pub fn effective_resource_limits(&self) -> Option<ResourceLimits> {
        if !self.sandboxed {
            return None;
        }
        self.resource_limits.as_ref().map(ResourceLimits::from)
    }
}

impl MCPConfig {
    /// Load configuration from a file
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use mcp_client::config::MCPConfig;
    /// let config = MCPConfig::from_file(".mcp.json")?;
    /// # Ok::<(), mcp_client::error::MCPError>(())
    /// ```
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, MCPError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| MCPError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let mut config: MCPConfig = serde_json::from_str(&content)
            .map_err(|e| MCPError::ConfigError(format!("Failed to parse config file: {}", e)))?;

        // Resolve environment variables
        config.resolve_env_vars()?;

        Ok(config)
    }

    /// Load merged configuration (user + project)
    ///
    /// Loads the user-level config from `~/.config/mcp-rs/mcp.json` and merges it
    /// with the project-level config from `.mcp.json`. Project-level settings
    /// take precedence.
    pub fn load_merged() -> Result<Self, MCPError> {
        let mut config = Self::load_user_config().unwrap_or_default();

        if let Ok(project_config) = Self::load_project_config() {
            config.merge(project_config);
        }

        Ok(config)
    }

    /// Load user-level config from `~/.config/mcp-rs/mcp.json`
    pub fn load_user_config() -> Result<Self, MCPError> {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map_err(|_| MCPError::ConfigError("HOME or USERPROFILE not set".to_string()))?;

        let path = PathBuf::from(home)
            .join(".config")
            .join("mcp-rs")
            .join("mcp.json");

        Self::from_file(path)
    }

    /// Load project-level config from `.mcp.json`
    pub fn load_project_config() -> Result<Self, MCPError> {
        Self::from_file(".mcp.json")
    }

    /// Merge another config into this one
    ///
    /// Servers in `other` replace same-named servers here; new ones are appended.
    pub fn merge(&mut self, other: MCPConfig) {
        for server in other.mcp_servers {
            match self.mcp_servers.iter_mut().find(|s| s.name == server.name) {
                Some(existing) => *existing = server,
                None => self.mcp_servers.push(server),
            }
        }
    }

    /// Look up a server by name
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.mcp_servers.iter().find(|s| s.name == name)
    }

    /// Validate every server and the list as a whole
    pub fn validate(&self) -> Result<(), MCPError> {
        crate::security::validate_server_configs(&self.mcp_servers)
    }

    /// Resolve environment variables in configuration
    ///
    /// Supports `${VAR}` and `$VAR` syntax for environment variable expansion.
    pub fn resolve_env_vars(&mut self) -> Result<(), MCPError> {
        for server_config in &mut self.mcp_servers {
            match &mut server_config.transport {
                TransportConfig::Stdio {
                    command,
                    args,
                    env,
                    cwd,
                } => {
                    *command = resolve_env_string(command)?;

                    for arg in args.iter_mut() {
                        *arg = resolve_env_string(arg)?;
                    }

                    for value in env.values_mut() {
                        *value = resolve_env_string(value)?;
                    }

                    if let Some(path) = cwd {
                        let path_str = path.to_string_lossy().to_string();
                        let resolved = resolve_env_string(&path_str)?;
                        *path = PathBuf::from(resolved);
                    }
                }
                TransportConfig::Sse { url, headers }
                | TransportConfig::Websocket { url, headers } => {
                    *url = resolve_env_string(url)?;

                    for value in headers.values_mut() {
                        *value = resolve_env_string(value)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to_file(&self, path: impl AsRef<std::path::Path>) -> Result<(), MCPError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MCPError::ConfigError(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), json)
            .map_err(|e| MCPError::ConfigError(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}

/// Resolve environment variable references in strings
///
/// Supports `${VAR}` and `$VAR` syntax.
///
/// # Example
///
/// ```
/// # use mcp_client::config::resolve_env_string;
/// unsafe { std::env::set_var("DOC_TEST_VAR", "test_value") };
/// let result = resolve_env_string("prefix_${DOC_TEST_VAR}_suffix")?;
/// assert_eq!(result, "prefix_test_value_suffix");
/// # Ok::<(), mcp_client::error::MCPError>(())
/// ```
pub fn resolve_env_string(s: &str) -> Result<String, MCPError> {
    let mut result = s.to_string();

    // Pattern for ${VAR} syntax
    let re_braces = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .map_err(|e| MCPError::InvalidPattern(e.to_string()))?;

    for cap in re_braces.captures_iter(s) {
        let var_name = &cap[1];
        let value =
            std::env::var(var_name).map_err(|_| MCPError::EnvVarNotFound(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    // Pattern for $VAR syntax (without braces)
    let re_simple = regex::Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)")
        .map_err(|e| MCPError::InvalidPattern(e.to_string()))?;

    for cap in re_simple.captures_iter(&result.clone()) {
        let var_name = &cap[1];
        let value =
            std::env::var(var_name).map_err(|_| MCPError::EnvVarNotFound(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
