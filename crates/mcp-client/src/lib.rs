//! Model Context Protocol (MCP) client runtime
//!
//! This crate connects to external MCP servers and keeps them usable:
//! - stdio, SSE and WebSocket transports behind one [`transport::Transport`] trait
//! - JSON-RPC request correlation with timeouts and cancellation
//! - a connection pool with bounded concurrent connects and reconnection
//! - sandboxing of spawned servers (env sanitization, allowlist, resource limits)
//! - retry, circuit breaking and health tracking for callers
//!
//! # Example
//!
//! ```no_run
//! use mcp_client::{ConnectionPool, MCPConfig, PoolOptions};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = MCPConfig::load_merged()?;
//! config.resolve_env_vars()?;
//!
//! let pool = ConnectionPool::from_config(&config, PoolOptions::default()).await?;
//! for (server, outcome) in pool.connect_all().await {
//!     if let Err(e) = outcome {
//!         eprintln!("{server}: {e}");
//!     }
//! }
//!
//! let tools = pool.discover_tools().await;
//! println!("Discovered {} tools", tools.len());
//!
//! let result = pool
//!     .call_tool("filesystem", "read_file", json!({"path": "/workspace/README.md"}))
//!     .await?;
//! println!("{}", result.text());
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod protocol;
pub mod retry;
pub mod sandbox;
pub mod schema;
pub mod security;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use client::{ConnectionPool, MCPToolInfo, PoolOptions, ServerConnection, ServerInfo};
pub use config::{MCPConfig, ServerConfig, TransportConfig};
pub use error::MCPError;
pub use health::{HealthChecker, HealthSample, PingResult};
pub use retry::RetryPolicy;
pub use transport::{Transport, TransportFactory};
pub use types::{MCPToolDefinition, MCPToolResult, ServerMetrics, ServerStatus, TransportKind};

/// Result type for MCP operations
pub type Result<T> = std::result::Result<T, MCPError>;
