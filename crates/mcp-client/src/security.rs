//! Configuration and security validation
//!
//! Everything here runs before a process is spawned or a socket is opened.

use crate::Result;
use crate::config::{ServerConfig, TransportConfig};
use crate::error::MCPError;
use crate::types::TransportKind;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;
use url::{Host, Url};

/// Executables a stdio server may be launched with
pub const ALLOWED_COMMANDS: &[&str] = &[
    "node", "npx", "python", "python3", "uv", "uvx", "deno", "bun", "bunx", "pipx",
];

/// Names that cannot be used for a server
pub const RESERVED_NAMES: &[&str] = &["default", "all", "none"];

const SENSITIVE_SUFFIXES: &[&str] = &[
    "_TOKEN",
    "_SECRET",
    "_CREDENTIAL",
    "_CREDENTIALS",
    "_API_KEY",
    "_PASSWORD",
    "_PASSWD",
];

const SENSITIVE_SUBSTRINGS: &[&str] = &[
    "SECRET",
    "PASSWORD",
    "PRIVATE_KEY",
    "AWS_ACCESS_KEY",
    "AWS_SESSION",
    "SESSION_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "AZURE_CLIENT_SECRET",
];

const WINDOWS_EXTENSIONS: &[&str] = &[".exe", ".cmd", ".bat"];

/// Whether an environment variable name looks like it carries a credential
pub fn is_sensitive_env_var(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SENSITIVE_SUFFIXES.iter().any(|s| upper.ends_with(s))
        || SENSITIVE_SUBSTRINGS.iter().any(|s| upper.contains(s))
}

/// Drop credential-like variables, pass everything else through unchanged
pub fn sanitize_env<I, K, V>(vars: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    vars.into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .filter(|(k, _)| {
            let sensitive = is_sensitive_env_var(k);
            if sensitive {
                debug!(var = %k, "Stripping sensitive environment variable");
            }
            !sensitive
        })
        .collect()
}

/// Base executable name: first whitespace token, directories and Windows extension stripped
pub fn base_command(command: &str) -> &str {
    let first = command.split_whitespace().next().unwrap_or("");
    let file = first.rsplit(['/', '\\']).next().unwrap_or(first);
    let lower = file.to_ascii_lowercase();
    WINDOWS_EXTENSIONS
        .iter()
        .find(|ext| lower.ends_with(*ext))
        .map_or(file, |ext| &file[..file.len() - ext.len()])
}

/// Reject commands whose base executable is not on the allowlist
pub fn validate_command(command: &str) -> Result<()> {
    let base = base_command(command);
    if base.is_empty() {
        return Err(MCPError::Validation("command must not be empty".to_string()));
    }
    if ALLOWED_COMMANDS.contains(&base) {
        Ok(())
    } else {
        Err(MCPError::Validation(format!(
            "command '{}' is not allowed (allowed: {})",
            base,
            ALLOWED_COMMANDS.join(", ")
        )))
    }
}

fn is_forbidden_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
}

fn is_forbidden_ipv6(ip: Ipv6Addr) -> bool {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_ipv4(v4);
    }
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        || (first & 0xfe00) == 0xfc00 // unique local fc00::/7
        || (first & 0xffc0) == 0xfe80 // link local fe80::/10
}

/// Loopback, private, link-local, unique-local or unspecified
pub fn is_forbidden_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_ipv4(v4),
        IpAddr::V6(v6) => is_forbidden_ipv6(v6),
    }
}

/// Parse and check a network server URL for the given transport
pub fn validate_url(raw: &str, kind: TransportKind) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| MCPError::Validation(format!("invalid url '{}': {}", raw, e)))?;

    let allowed: &[&str] = match kind {
        TransportKind::Sse => &["http", "https"],
        TransportKind::Websocket => &["ws", "wss"],
        TransportKind::Stdio => {
            return Err(MCPError::Validation(
                "stdio transport does not take a url".to_string(),
            ));
        }
    };
    if !allowed.contains(&url.scheme()) {
        return Err(MCPError::Validation(format!(
            "scheme '{}' is not allowed for {} (expected {})",
            url.scheme(),
            kind,
            allowed.join(" or ")
        )));
    }

    match url.host() {
        None => {
            return Err(MCPError::Validation(format!("url '{}' has no host", raw)));
        }
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            if domain == "localhost" || domain.ends_with(".localhost") {
                return Err(MCPError::Validation(format!(
                    "url '{}' targets a local host",
                    raw
                )));
            }
        }
        Some(Host::Ipv4(ip)) => {
            if is_forbidden_ipv4(ip) {
                return Err(MCPError::Validation(format!(
                    "url '{}' targets a private or loopback address",
                    raw
                )));
            }
        }
        Some(Host::Ipv6(ip)) => {
            if is_forbidden_ipv6(ip) {
                return Err(MCPError::Validation(format!(
                    "url '{}' targets a private or loopback address",
                    raw
                )));
            }
        }
    }

    Ok(url)
}

/// Resolve the URL host and reject it if any address is private or loopback
pub async fn check_resolved_host(url: &Url) -> Result<()> {
    let Some(Host::Domain(domain)) = url.host() else {
        // Literal addresses were already checked by validate_url
        return Ok(());
    };
    let port = url.port_or_known_default().unwrap_or(443);

    let addrs = tokio::net::lookup_host((domain, port))
        .await
        .map_err(|e| MCPError::ConnectionFailed(format!("failed to resolve '{}': {}", domain, e)))?;

    for addr in addrs {
        if is_forbidden_ip(addr.ip()) {
            return Err(MCPError::Validation(format!(
                "host '{}' resolves to forbidden address {}",
                domain,
                addr.ip()
            )));
        }
    }
    Ok(())
}

/// Names are non-empty, not reserved, and limited to `[A-Za-z0-9_.-]`
pub fn validate_server_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MCPError::Validation("server name must not be empty".to_string()));
    }
    if RESERVED_NAMES.contains(&name.to_ascii_lowercase().as_str()) {
        return Err(MCPError::Validation(format!(
            "server name '{}' is reserved",
            name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(MCPError::Validation(format!(
            "server name '{}' contains invalid characters",
            name
        )));
    }
    Ok(())
}

/// Structural and security checks for one server
pub fn validate_server_config(config: &ServerConfig) -> Result<()> {
    validate_server_name(&config.name)?;

    if config.timeout_ms == 0 {
        return Err(MCPError::Validation(format!(
            "server '{}': timeout must be positive",
            config.name
        )));
    }
    if config.rate_limit_rpm == Some(0) {
        return Err(MCPError::Validation(format!(
            "server '{}': rateLimitRpm must be positive",
            config.name
        )));
    }

    let checked = match &config.transport {
        TransportConfig::Stdio { command, .. } => validate_command(command),
        TransportConfig::Sse { url, .. } | TransportConfig::Websocket { url, .. } => {
            validate_url(url, config.transport_kind()).map(|_| ())
        }
    };
    checked.map_err(|e| e.for_server(&config.name))
}

/// Validate a whole server list; any failure rejects the list
pub fn validate_server_configs(configs: &[ServerConfig]) -> Result<()> {
    let mut seen = HashSet::new();
    for config in configs {
        if !seen.insert(config.name.as_str()) {
            return Err(MCPError::Validation(format!(
                "duplicate server name '{}'",
                config.name
            )));
        }
        validate_server_config(config)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_env() {
        let env = sanitize_env([
            ("GITHUB_TOKEN", "ghp_x"),
            ("DB_CREDENTIAL", "pw"),
            ("AWS_SESSION_TOKEN", "t"),
            ("my_password", "hunter2"),
            ("OPENAI_API_KEY", "sk"),
            ("NODE_ENV", "production"),
            ("PATH", "/usr/bin"),
        ]);

        assert!(!env.contains_key("GITHUB_TOKEN"));
        assert!(!env.contains_key("DB_CREDENTIAL"));
        assert!(!env.contains_key("AWS_SESSION_TOKEN"));
        assert!(!env.contains_key("my_password"));
        assert!(!env.contains_key("OPENAI_API_KEY"));
        assert_eq!(env.get("NODE_ENV").map(String::as_str), Some("production"));
        assert_eq!(env.get("PATH").map(String::as_str), Some("/usr/bin"));
    }

    #[test]
    fn test_command_allowlist() {
        assert!(validate_command("npx").is_ok());
        assert!(validate_command("python3").is_ok());
        assert!(validate_command("/usr/local/bin/node server.js").is_ok());
        assert!(validate_command(r"C:\Program Files\nodejs\npx.cmd").is_ok());

        assert!(matches!(validate_command("rm"), Err(MCPError::Validation(_))));
        assert!(validate_command("/bin/sh -c 'npx'").is_err());
        assert!(validate_command("").is_err());
        assert!(validate_command("nodejs-evil").is_err());
    }

    #[test]
    fn test_url_validation() {
        assert!(validate_url("https://mcp.example.com/sse", TransportKind::Sse).is_ok());
        assert!(validate_url("wss://mcp.example.com/ws", TransportKind::Websocket).is_ok());

        for bad in [
            "http://127.0.0.1:1234/mcp",
            "http://192.168.1.5/mcp",
            "http://10.0.0.1/mcp",
            "http://172.20.1.1/mcp",
            "http://169.254.169.254/latest",
            "http://0.0.0.0/mcp",
            "http://localhost:8080/mcp",
            "http://api.localhost/mcp",
            "http://[::1]/mcp",
            "http://[fd00::1]/mcp",
            "http://[fe80::1]/mcp",
            "http://[::ffff:127.0.0.1]/mcp",
            "ftp://mcp.example.com/",
            "not a url",
        ] {
            assert!(
                matches!(
                    validate_url(bad, TransportKind::Sse),
                    Err(MCPError::Validation(_))
                ),
                "{bad} should be rejected"
            );
        }

        // Scheme must match the transport
        assert!(validate_url("https://mcp.example.com/ws", TransportKind::Websocket).is_err());
        assert!(validate_url("ws://mcp.example.com/sse", TransportKind::Sse).is_err());
        assert!(validate_url("http://172.32.0.1/mcp", TransportKind::Sse).is_ok());
    }

    #[test]
    fn test_server_names() {
        assert!(validate_server_name("github").is_ok());
        assert!(validate_server_name("my-server_1.0").is_ok());
        assert!(validate_server_name("").is_err());
        assert!(validate_server_name("default").is_err());
        assert!(validate_server_name("ALL").is_err());
        assert!(validate_server_name("has space").is_err());
    }

    #[test]
    fn test_validate_server_configs() {
        let ok = vec![
            ServerConfig::stdio("fs", "npx", vec!["-y".into()]),
            ServerConfig::sse("remote", "https://mcp.example.com/sse"),
        ];
        assert!(validate_server_configs(&ok).is_ok());

        let duplicate = vec![
            ServerConfig::stdio("fs", "npx", vec![]),
            ServerConfig::stdio("fs", "node", vec![]),
        ];
        assert!(validate_server_configs(&duplicate).is_err());

        let reserved = vec![ServerConfig::stdio("none", "npx", vec![])];
        assert!(validate_server_configs(&reserved).is_err());

        let bad_command = vec![
            ServerConfig::stdio("fs", "npx", vec![]),
            ServerConfig::stdio("shell", "bash", vec![]),
        ];
        let err = validate_server_configs(&bad_command).unwrap_err();
        assert!(err.to_string().starts_with("[shell]"));
        assert!(matches!(err.root(), MCPError::Validation(_)));
    }

    #[tokio::test]
    async fn test_resolved_literal_host_is_skipped() {
        let url = Url::parse("https://93.184.216.34/sse").unwrap();
        tokio_test::assert_ok!(check_resolved_host(&url).await);
    }
}
