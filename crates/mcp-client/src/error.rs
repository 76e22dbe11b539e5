//! Error types for MCP operations

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during MCP operations
#[derive(Error, Debug)]
pub enum MCPError {
    /// Connect-phase failure: spawn, handshake, or connect timeout
    #[error("MCP connection failed: {0}")]
    ConnectionFailed(String),

    /// Post-connect I/O failure on a transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Not connected to MCP server
    #[error("Not connected to MCP server")]
    NotConnected,

    /// Config, schema, or security rejection
    #[error("Validation failed: {0}")]
    Validation(String),

    /// MCP server not found
    #[error("MCP server not found: {0}")]
    ServerNotFound(String),

    /// A server with the same name is already registered
    #[error("MCP server already registered: {0}")]
    DuplicateServer(String),

    /// Malformed JSON-RPC payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// Request deadline expired before a response arrived
    #[error("Request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The server answered with a JSON-RPC error object
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// MCP request failed
    #[error("MCP request failed: {0}")]
    RequestFailed(String),

    /// Operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Call rejected because the circuit breaker is open
    #[error("Circuit breaker is open")]
    CircuitOpen,

    /// Sandboxed process exceeded a resource ceiling
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Environment variable error
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    /// Invalid pattern error
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Internal error
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Error attributed to a named server
    #[error("[{server}] {source}")]
    Server {
        server: String,
        #[source]
        source: Box<MCPError>,
    },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl MCPError {
    /// Attach the server name to this error, unless it already carries one
    pub fn for_server(self, server: impl Into<String>) -> Self {
        match self {
            err @ MCPError::Server { .. } => err,
            err => MCPError::Server {
                server: server.into(),
                source: Box::new(err),
            },
        }
    }

    /// The error with any server attribution stripped
    pub fn root(&self) -> &MCPError {
        match self {
            MCPError::Server { source, .. } => source.root(),
            err => err,
        }
    }

    /// Whether retrying the failed operation may succeed
    ///
    /// Validation and protocol-level errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.root(),
            MCPError::ConnectionFailed(_)
                | MCPError::Transport(_)
                | MCPError::NotConnected
                | MCPError::Timeout { .. }
                | MCPError::RequestFailed(_)
                | MCPError::IoError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_server_wraps_once() {
        let err = MCPError::NotConnected.for_server("a").for_server("b");
        assert_eq!(err.to_string(), "[a] Not connected to MCP server");
        assert!(matches!(err.root(), MCPError::NotConnected));
    }

    #[test]
    fn test_is_retryable() {
        assert!(MCPError::ConnectionFailed("x".into()).is_retryable());
        assert!(MCPError::Transport("x".into()).for_server("s").is_retryable());
        assert!(
            MCPError::Timeout {
                method: "tools/list".into(),
                timeout: Duration::from_secs(1)
            }
            .is_retryable()
        );

        assert!(!MCPError::Validation("x".into()).is_retryable());
        assert!(!MCPError::CircuitOpen.is_retryable());
        assert!(!MCPError::Cancelled.is_retryable());
        assert!(!MCPError::ResourceLimit("x".into()).is_retryable());
    }
}
