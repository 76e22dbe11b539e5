//! Command-line interface for mcp-rs

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Cell, ContentArrangement, Table};
use mcp_client::{ConnectionPool, MCPConfig, PoolOptions};
use mcp_utils::{LogFormat, LoggingConfig};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "mcp-cli")]
#[command(about = "Inspect and exercise configured MCP servers", long_about = None)]
struct Cli {
    /// Config file; defaults to the merged user and project configs
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (pretty or json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    /// Log level used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration without connecting
    Validate,
    /// Connect to every enabled server and report its status
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
        /// Connects allowed in flight at once
        #[arg(long, default_value_t = 5)]
        concurrency: usize,
    },
    /// List tools discovered on connected servers
    Tools {
        /// Only list tools of this server
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Call a tool and print its result
    Call {
        server: String,
        tool: String,
        /// Tool arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
        /// Seconds allowed for connecting to the server
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    mcp_utils::init_tracing_with(
        &LoggingConfig::default()
            .with_level(cli.log_level.clone())
            .with_format(cli.log_format),
    );

    let config = load_config(cli.config.as_ref())?;
    info!("Loaded {} MCP server configs", config.mcp_servers.len());

    match cli.command {
        Commands::Validate => {
            println!(
                "Configuration is valid: {} servers ({} enabled)",
                config.mcp_servers.len(),
                config.mcp_servers.iter().filter(|s| s.enabled).count()
            );
            Ok(())
        }
        Commands::Status { json, concurrency } => {
            let pool = connect(&config, concurrency).await?;
            let infos = pool.server_infos().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&infos)?);
            } else {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec![
                        "Server", "Transport", "Status", "Tools", "Resources", "Prompts", "Error",
                    ]);
                for info in &infos {
                    table.add_row(vec![
                        Cell::new(&info.name),
                        Cell::new(info.transport),
                        Cell::new(info.status),
                        Cell::new(info.tool_count),
                        Cell::new(info.resource_count),
                        Cell::new(info.prompt_count),
                        Cell::new(info.last_error.as_deref().unwrap_or("")),
                    ]);
                }
                println!("{table}");
            }

            pool.disconnect_all().await;
            Ok(())
        }
        Commands::Tools { server, json } => {
            let pool = connect(&config, PoolOptions::default().max_concurrent_connections).await?;
            let mut tools = pool.discover_tools().await;
            if let Some(server) = &server {
                tools.retain(|t| &t.server_name == server);
            }

            if json {
                let listing: Vec<Value> = tools
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "server": t.server_name,
                            "name": t.definition.name,
                            "description": t.definition.description,
                            "inputSchema": t.definition.input_schema,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                let mut table = Table::new();
                table
                    .load_preset(UTF8_FULL)
                    .set_content_arrangement(ContentArrangement::Dynamic)
                    .set_header(vec!["Server", "Tool", "Description"]);
                for tool in &tools {
                    table.add_row(vec![
                        tool.server_name.as_str(),
                        tool.definition.name.as_str(),
                        tool.definition.description.as_deref().unwrap_or(""),
                    ]);
                }
                println!("{table}");
            }

            pool.disconnect_all().await;
            Ok(())
        }
        Commands::Call {
            server,
            tool,
            args,
            timeout,
        } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be a JSON object")?;
            if !arguments.is_object() {
                bail!("--args must be a JSON object, got {arguments}");
            }

            let server_config = config
                .server(&server)
                .with_context(|| format!("no server named '{server}' in the configuration"))?
                .clone();

            let pool = ConnectionPool::new();
            let connection = pool.add_server(server_config).await?;
            tokio::time::timeout(Duration::from_secs(timeout), connection.connect())
                .await
                .with_context(|| format!("connecting to '{server}' timed out"))??;

            let result = pool.call_tool(&server, &tool, arguments).await;
            pool.disconnect_all().await;

            let result = result.with_context(|| format!("calling '{tool}' on '{server}'"))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if result.is_error == Some(true) {
                bail!("tool '{tool}' reported an error");
            }
            Ok(())
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<MCPConfig> {
    let mut config = match path {
        Some(path) => MCPConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => MCPConfig::load_merged().context("failed to load MCP configuration")?,
    };
    config
        .resolve_env_vars()
        .context("failed to expand environment variables")?;
    config.validate().context("invalid MCP configuration")?;
    Ok(config)
}

async fn connect(config: &MCPConfig, concurrency: usize) -> anyhow::Result<ConnectionPool> {
    let pool = ConnectionPool::from_config(
        config,
        PoolOptions {
            max_concurrent_connections: concurrency,
        },
    )
    .await?;

    let outcome = pool.connect_all().await;
    let failed: Vec<&String> = outcome
        .iter()
        .filter(|(_, result)| result.is_err())
        .map(|(name, _)| name)
        .collect();
    if !failed.is_empty() {
        eprintln!("warning: failed to connect to {} server(s): {:?}", failed.len(), failed);
    }

    if !outcome.is_empty() && pool.connected_servers().await.is_empty() {
        eprintln!("warning: no servers connected");
    }
    Ok(pool)
}
