//! Server connections and the pool that owns them

pub mod connection;
pub mod pool;

pub use connection::{NotificationListener, PROTOCOL_VERSION, ServerConnection, StatusListener};
pub use pool::{BatchOutcome, ConnectionPool, MCPToolInfo, PoolOptions, ServerInfo};
