//! Transports moving JSON-RPC messages between the client and a server

use async_trait::async_trait;
use std::sync::Arc;

use crate::Result;
use crate::config::{ServerConfig, TransportConfig};
use crate::error::MCPError;
use crate::protocol::JsonRpcMessage;
use crate::types::TransportKind;

mod dispatch;
pub mod sse;
pub mod stdio;
pub mod websocket;

pub(crate) use dispatch::{EventDispatcher, EventSink};
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use websocket::WebSocketTransport;

/// Called for every inbound message, in receive order
pub type MessageHandler = Arc<dyn Fn(JsonRpcMessage) + Send + Sync>;

/// Called for failures after a successful connect
pub type ErrorHandler = Arc<dyn Fn(MCPError) + Send + Sync>;

/// Called once when the remote side goes away
pub type CloseHandler = Arc<dyn Fn(Option<String>) + Send + Sync>;

/// Callbacks registered on a transport
#[derive(Clone, Default)]
pub struct TransportHandlers {
    pub on_message: Option<MessageHandler>,
    pub on_error: Option<ErrorHandler>,
    pub on_close: Option<CloseHandler>,
}

/// Transport trait - abstracts over subprocess, SSE and WebSocket connections
///
/// All methods use `&self` so transports can be shared through `Arc`.
///
/// Guarantees:
/// - no message reaches `on_message` before `connect()` has resolved;
/// - no callback fires after `disconnect()` has resolved;
/// - an explicit `disconnect()` does not fire `on_close`.
///
/// A transport may be connected again after it closed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection; fails with [`MCPError::ConnectionFailed`]
    async fn connect(&self) -> Result<()>;

    /// Close the connection, gracefully then forcibly; idempotent
    async fn disconnect(&self) -> Result<()>;

    /// Send one message; fails with [`MCPError::Transport`] when not connected
    async fn send(&self, message: &JsonRpcMessage) -> Result<()>;

    /// Replace the registered callbacks
    fn set_handlers(&self, handlers: TransportHandlers);

    fn is_connected(&self) -> bool;

    fn kind(&self) -> TransportKind;

    /// Captured out-of-band diagnostics, such as a subprocess' stderr
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Type alias for Arc-wrapped transport
pub type ArcTransport = Arc<dyn Transport>;

/// Builds transports for server configurations
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Result<ArcTransport>;
}

/// Factory producing the built-in transports
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Result<ArcTransport> {
        create_transport(config)
    }
}

/// Validate `config` and build the matching transport
pub fn create_transport(config: &ServerConfig) -> Result<ArcTransport> {
    crate::security::validate_server_config(config)?;

    let transport: ArcTransport = match &config.transport {
        TransportConfig::Stdio { .. } => Arc::new(StdioTransport::new(config)?),
        TransportConfig::Sse { .. } => Arc::new(SseTransport::new(config)?),
        TransportConfig::Websocket { .. } => Arc::new(WebSocketTransport::new(config)?),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_transport_by_kind() {
        let stdio = create_transport(&ServerConfig::stdio("fs", "npx", vec![])).unwrap();
        assert_eq!(stdio.kind(), TransportKind::Stdio);
        assert!(!stdio.is_connected());

        let sse = create_transport(&ServerConfig::sse("remote", "https://mcp.example.com/sse"))
            .unwrap();
        assert_eq!(sse.kind(), TransportKind::Sse);

        let ws =
            create_transport(&ServerConfig::websocket("ws", "wss://mcp.example.com/ws")).unwrap();
        assert_eq!(ws.kind(), TransportKind::Websocket);
    }

    #[test]
    fn test_create_transport_validates_first() {
        let err = create_transport(&ServerConfig::stdio("shell", "rm", vec!["-rf".into()]))
            .err()
            .unwrap();
        assert!(matches!(err.root(), MCPError::Validation(_)));

        let err = create_transport(&ServerConfig::sse("local", "http://127.0.0.1:8080/sse"))
            .err()
            .unwrap();
        assert!(matches!(err.root(), MCPError::Validation(_)));
    }
}
