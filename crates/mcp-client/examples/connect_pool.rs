//! Connection pool example for mcp-client
//!
//! This example demonstrates:
//! - Loading and validating MCP configuration
//! - Connecting every enabled server with bounded concurrency
//! - Watching status transitions
//! - Health checks, retries and a circuit breaker around tool calls
//!
//! Run with: cargo run -p mcp-client --example connect_pool

use mcp_client::{
    CircuitBreaker, CircuitBreakerConfig, ConnectionPool, HealthChecker, MCPConfig, PoolOptions,
    RetryPolicy, ServerConfig,
};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    mcp_utils::init_tracing();

    println!("=== MCP Connection Pool Example ===\n");

    // 1. Configuration: project/user files, or a single filesystem server
    let mut config = MCPConfig::load_merged()?;
    if config.mcp_servers.is_empty() {
        config.mcp_servers.push(ServerConfig::stdio(
            "filesystem",
            "npx",
            vec![
                "-y".to_string(),
                "@modelcontextprotocol/server-filesystem".to_string(),
                ".".to_string(),
            ],
        ));
    }
    config.resolve_env_vars()?;
    println!("1. Loaded {} server config(s)\n", config.mcp_servers.len());

    // 2. Pool with a status listener
    let pool = ConnectionPool::from_config(&config, PoolOptions::default()).await?;
    pool.on_status_change(|server, status| println!("   [{server}] -> {status}"));

    println!("2. Connecting...");
    for (server, outcome) in pool.connect_all().await {
        match outcome {
            Ok(()) => println!("   ✓ {server}"),
            Err(e) => println!("   ✗ {server}: {e}"),
        }
    }
    println!();

    // 3. Health
    println!("3. Health check...");
    let checker = HealthChecker::new();
    for (server, ping) in checker.check_pool(&pool, Duration::from_secs(5)).await {
        match ping.latency_ms {
            Some(ms) => println!("   ✓ {server}: {ms:.1} ms"),
            None => println!("   ✗ {server}: {}", ping.error.unwrap_or_default()),
        }
    }
    println!();

    // 4. Tools
    let tools = pool.discover_tools().await;
    println!("4. Found {} tool(s)", tools.len());
    for tool in tools.iter().take(5) {
        println!("   - {} (from {})", tool.definition.name, tool.server_name);
    }
    println!();

    // 5. A guarded call
    if pool.connected_servers().await.contains(&"filesystem".to_string()) {
        println!("5. Calling list_directory with retry and circuit breaker...");
        let breaker = CircuitBreaker::new("filesystem", CircuitBreakerConfig::default());
        let policy = RetryPolicy::default();

        let result = policy
            .execute("list_directory", || {
                breaker.execute(|| {
                    pool.call_tool("filesystem", "list_directory", json!({"path": "."}))
                })
            })
            .await;
        match result {
            Ok(result) => println!("{}", result.text()),
            Err(e) => println!("   ✗ {e}"),
        }
        println!("   breaker: {:?}\n", breaker.stats());
    }

    // 6. Shutdown
    pool.disconnect_all().await;
    println!("Done");
    Ok(())
}
