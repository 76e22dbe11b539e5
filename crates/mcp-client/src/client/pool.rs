//! Connection pool coordinating multiple MCP servers

use super::connection::{ServerConnection, StatusListener};
use crate::Result;
use crate::config::{MCPConfig, ServerConfig};
use crate::error::MCPError;
use crate::transport::{DefaultTransportFactory, TransportFactory};
use crate::types::{MCPToolDefinition, MCPToolResult, ServerMetrics, ServerStatus, TransportKind};
use futures::StreamExt;
use futures::stream;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Per-server outcome of a batch operation, keyed by server name
pub type BatchOutcome = BTreeMap<String, Result<()>>;

/// Information about an MCP tool including its source server
#[derive(Debug, Clone)]
pub struct MCPToolInfo {
    pub server_name: String,
    pub definition: MCPToolDefinition,
}

/// Snapshot of one registered server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub name: String,
    pub transport: TransportKind,
    pub status: ServerStatus,
    pub enabled: bool,
    pub tool_count: usize,
    pub resource_count: usize,
    pub prompt_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    pub metrics: ServerMetrics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Pool-wide settings
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Connects allowed in flight during [`ConnectionPool::connect_all`]
    pub max_concurrent_connections: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 5,
        }
    }
}

/// Owns every server connection of the process
///
/// The pool handles:
/// - Registration with validation and duplicate detection
/// - Bounded concurrent connects that never fail fast
/// - Tool discovery and call routing across connected servers
/// - A single status listener fed by every managed connection
pub struct ConnectionPool {
    connections: RwLock<HashMap<Arc<str>, ServerConnection>>,
    options: PoolOptions,
    factory: Arc<dyn TransportFactory>,
    status_listener: Arc<parking_lot::RwLock<Option<StatusListener>>>,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::with_options(PoolOptions::default())
    }

    pub fn with_options(options: PoolOptions) -> Self {
        Self::with_factory(options, Arc::new(DefaultTransportFactory))
    }

    /// Build a pool whose transports come from `factory`
    pub fn with_factory(options: PoolOptions, factory: Arc<dyn TransportFactory>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            options,
            factory,
            status_listener: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    /// Validate the whole server list, then register every entry
    pub async fn from_config(config: &MCPConfig, options: PoolOptions) -> Result<Self> {
        config.validate()?;

        let pool = Self::with_options(options);
        for server in &config.mcp_servers {
            pool.add_server(server.clone()).await?;
        }
        info!("Registered {} MCP servers", config.mcp_servers.len());
        Ok(pool)
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Install the listener receiving every status transition of every connection
    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(&str, ServerStatus) + Send + Sync + 'static,
    {
        *self.status_listener.write() = Some(Arc::new(listener));
    }

    /// Register a server; fails on an invalid config or a taken name
    pub async fn add_server(&self, config: ServerConfig) -> Result<ServerConnection> {
        crate::security::validate_server_config(&config)?;

        let mut connections = self.connections.write().await;
        if connections.contains_key(config.name.as_str()) {
            return Err(MCPError::DuplicateServer(config.name.clone()));
        }

        let transport = self
            .factory
            .create(&config)
            .map_err(|e| e.for_server(config.name.as_str()))?;
        let connection = ServerConnection::with_transport(config, transport);

        let slot = Arc::clone(&self.status_listener);
        connection.set_status_listener(Some(Arc::new(move |name: &str, status: ServerStatus| {
            let listener = slot.read().clone();
            if let Some(listener) = listener {
                listener(name, status);
            }
        })));

        info!(
            "Added MCP server '{}' ({})",
            connection.name(),
            connection.transport_kind()
        );
        connections.insert(connection.shared_name(), connection.clone());
        Ok(connection)
    }

    /// Disconnect and drop a server; `Ok(false)` when it was not registered
    pub async fn remove_server(&self, name: &str) -> Result<bool> {
        let removed = self.connections.write().await.remove(name);
        let Some(connection) = removed else {
            return Ok(false);
        };

        if let Err(e) = connection.disconnect().await {
            warn!("Error while disconnecting removed server '{}': {}", name, e);
        }
        connection.set_status_listener(None);
        info!("Removed MCP server '{}'", name);
        Ok(true)
    }

    /// Handle to a registered connection
    pub async fn connection(&self, name: &str) -> Option<ServerConnection> {
        self.connections.read().await.get(name).cloned()
    }

    async fn require(&self, name: &str) -> Result<ServerConnection> {
        self.connection(name)
            .await
            .ok_or_else(|| MCPError::ServerNotFound(name.to_string()))
    }

    pub async fn connect(&self, name: &str) -> Result<()> {
        self.require(name).await?.connect().await
    }

    pub async fn disconnect(&self, name: &str) -> Result<()> {
        self.require(name).await?.disconnect().await
    }

    /// Connect every enabled server, bounded by `max_concurrent_connections`
    ///
    /// A failing server never stops the others; each outcome is reported
    /// under its server name.
    pub async fn connect_all(&self) -> BatchOutcome {
        let targets: Vec<ServerConnection> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.config().enabled)
            .cloned()
            .collect();
        let total = targets.len();
        let limit = self.options.max_concurrent_connections.max(1);

        let outcome: BatchOutcome = stream::iter(targets)
            .map(|connection| async move {
                let result = connection.connect().await;
                if let Err(e) = &result {
                    warn!(
                        "Failed to connect to MCP server {}: {}. Continuing without it.",
                        connection.name(),
                        e
                    );
                }
                (connection.name().to_string(), result)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        let connected = outcome.values().filter(|r| r.is_ok()).count();
        if total > 0 && connected == 0 {
            warn!("No MCP servers connected");
        } else {
            info!("Connected to {}/{} MCP servers", connected, total);
        }
        outcome
    }

    /// Disconnect every registered server
    pub async fn disconnect_all(&self) -> BatchOutcome {
        let targets: Vec<ServerConnection> =
            self.connections.read().await.values().cloned().collect();

        let results = futures::future::join_all(targets.into_iter().map(|connection| async move {
            let result = connection.disconnect().await;
            (connection.name().to_string(), result)
        }))
        .await;

        info!("All MCP servers disconnected");
        results.into_iter().collect()
    }

    /// Names of connected servers, sorted
    pub async fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Names of all registered servers, sorted
    pub async fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .connections
            .read()
            .await
            .keys()
            .map(ToString::to_string)
            .collect();
        names.sort();
        names
    }

    /// Status snapshot of every registered server, sorted by name
    pub async fn server_infos(&self) -> Vec<ServerInfo> {
        let connections: Vec<ServerConnection> =
            self.connections.read().await.values().cloned().collect();

        let mut infos: Vec<ServerInfo> = connections
            .iter()
            .map(|c| ServerInfo {
                name: c.name().to_string(),
                transport: c.transport_kind(),
                status: c.status(),
                enabled: c.config().enabled,
                tool_count: c.tools().len(),
                resource_count: c.resources().len(),
                prompt_count: c.prompts().len(),
                server_version: c.server_info().map(|i| i.version),
                metrics: c.metrics(),
                last_error: c.last_error(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Cached tools of every connected server
    pub async fn discover_tools(&self) -> Vec<MCPToolInfo> {
        let mut connections: Vec<ServerConnection> = self
            .connections
            .read()
            .await
            .values()
            .filter(|c| c.is_connected())
            .cloned()
            .collect();
        connections.sort_by(|a, b| a.name().cmp(b.name()));

        connections
            .iter()
            .flat_map(|c| {
                let server_name = c.name().to_string();
                c.tools().into_iter().map(move |definition| MCPToolInfo {
                    server_name: server_name.clone(),
                    definition,
                })
            })
            .collect()
    }

    /// Call a tool on the named server
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Value,
    ) -> Result<MCPToolResult> {
        self.require(server_name)
            .await?
            .call_tool(tool_name, arguments)
            .await
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}
