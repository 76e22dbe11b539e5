//! Shared utilities for mcp-rs
//!
//! Logging setup and its configuration, used by the binaries of the
//! workspace. The client library itself only emits `tracing` events.

pub mod config;
pub mod logging;

pub use config::{LogFormat, LoggingConfig};
pub use logging::{init_tracing, init_tracing_with};
