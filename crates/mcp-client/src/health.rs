//! Health tracking for pooled servers
//!
//! Keeps a bounded history of samples per server and derives uptime and
//! latency figures from it.

use crate::client::{ConnectionPool, ServerConnection};
use crate::types::ServerStatus;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Samples kept per server unless configured otherwise
pub const DEFAULT_HISTORY_SIZE: usize = 100;

/// One health observation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSample {
    pub status: ServerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthSample {
    pub fn new(status: ServerStatus) -> Self {
        Self {
            status,
            latency_ms: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Outcome of a single ping; never an error
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bounded per-server health history
#[derive(Debug)]
pub struct HealthChecker {
    capacity: usize,
    history: RwLock<HashMap<String, VecDeque<HealthSample>>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Append a sample, dropping the oldest once the history is full
    pub fn record_check(&self, server: &str, sample: HealthSample) {
        let mut history = self.history.write();
        let samples = history.entry(server.to_string()).or_default();
        while samples.len() >= self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Share of samples taken while connected, in percent; 0 without samples
    pub fn uptime_percentage(&self, server: &str) -> f64 {
        let history = self.history.read();
        let Some(samples) = history.get(server).filter(|s| !s.is_empty()) else {
            return 0.0;
        };
        let up = samples
            .iter()
            .filter(|s| s.status == ServerStatus::Connected)
            .count();
        up as f64 / samples.len() as f64 * 100.0
    }

    /// Mean latency over samples that carry one
    pub fn average_latency(&self, server: &str) -> Option<f64> {
        let history = self.history.read();
        let latencies: Vec<f64> = history
            .get(server)?
            .iter()
            .filter_map(|s| s.latency_ms)
            .collect();
        if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
        }
    }

    /// Samples oldest first
    pub fn history(&self, server: &str) -> Vec<HealthSample> {
        self.history
            .read()
            .get(server)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn latest(&self, server: &str) -> Option<HealthSample> {
        self.history.read().get(server)?.back().cloned()
    }

    /// Forget one server's history
    pub fn clear(&self, server: &str) {
        self.history.write().remove(server);
    }

    pub fn clear_all(&self) {
        self.history.write().clear();
    }

    /// Race an MCP `ping` against `timeout`
    pub async fn ping(connection: &ServerConnection, timeout: Duration) -> PingResult {
        let started = Instant::now();
        match tokio::time::timeout(timeout, connection.ping()).await {
            Ok(Ok(())) => PingResult {
                success: true,
                latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
                error: None,
            },
            Ok(Err(e)) => PingResult {
                success: false,
                latency_ms: None,
                error: Some(e.to_string()),
            },
            Err(_) => PingResult {
                success: false,
                latency_ms: None,
                error: Some(format!("ping timed out after {:?}", timeout)),
            },
        }
    }

    /// Ping every registered server and record a sample for each
    ///
    /// A failed ping on a connection that still reports `connected` is
    /// recorded as `error`.
    pub async fn check_pool(
        &self,
        pool: &ConnectionPool,
        timeout: Duration,
    ) -> HashMap<String, PingResult> {
        let mut connections = Vec::new();
        for name in pool.server_names().await {
            if let Some(connection) = pool.connection(&name).await {
                connections.push(connection);
            }
        }

        let results = futures::future::join_all(connections.iter().map(|connection| async move {
            let result = if connection.is_connected() {
                Self::ping(connection, timeout).await
            } else {
                PingResult {
                    success: false,
                    latency_ms: None,
                    error: Some(format!("server is {}", connection.status())),
                }
            };
            (connection, result)
        }))
        .await;

        let mut report = HashMap::new();
        for (connection, result) in results {
            let status = match (result.success, connection.status()) {
                (true, _) => ServerStatus::Connected,
                (false, ServerStatus::Connected) => ServerStatus::Error,
                (false, other) => other,
            };

            let mut sample = HealthSample::new(status);
            if let Some(latency) = result.latency_ms {
                sample = sample.with_latency(latency);
            }
            if let Some(error) = &result.error {
                if status == ServerStatus::Error {
                    warn!("Health check failed for '{}': {}", connection.name(), error);
                } else {
                    debug!("Health check skipped '{}': {}", connection.name(), error);
                }
                sample = sample.with_error(error.clone());
            }
            self.record_check(connection.name(), sample);
            report.insert(connection.name().to_string(), result);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::PoolOptions;
    use crate::config::ServerConfig;
    use crate::testing::MockFactory;
    use std::sync::Arc;

    #[test]
    fn test_history_is_capped() {
        let checker = HealthChecker::new();
        for i in 0..150 {
            checker.record_check(
                "fs",
                HealthSample::new(ServerStatus::Connected).with_latency(f64::from(i)),
            );
        }

        let history = checker.history("fs");
        assert_eq!(history.len(), DEFAULT_HISTORY_SIZE);
        assert_eq!(history[0].latency_ms, Some(50.0));
        assert_eq!(checker.latest("fs").unwrap().latency_ms, Some(149.0));
    }

    #[test]
    fn test_uptime_and_latency() {
        let checker = HealthChecker::new();
        assert_eq!(checker.uptime_percentage("fs"), 0.0);
        assert_eq!(checker.average_latency("fs"), None);

        checker.record_check("fs", HealthSample::new(ServerStatus::Connected).with_latency(10.0));
        checker.record_check("fs", HealthSample::new(ServerStatus::Connected).with_latency(30.0));
        checker.record_check("fs", HealthSample::new(ServerStatus::Error).with_error("timeout"));
        checker.record_check("fs", HealthSample::new(ServerStatus::Reconnecting));

        assert!((checker.uptime_percentage("fs") - 50.0).abs() < f64::EPSILON);
        assert_eq!(checker.average_latency("fs"), Some(20.0));

        checker.record_check("git", HealthSample::new(ServerStatus::Disconnected));
        assert_eq!(checker.average_latency("git"), None);

        checker.clear("fs");
        assert!(checker.history("fs").is_empty());
        assert!(checker.latest("git").is_some());
        checker.clear_all();
        assert!(checker.latest("git").is_none());
    }

    #[tokio::test]
    async fn test_check_pool_records_samples() {
        let factory = Arc::new(MockFactory::new().failing("down"));
        let pool = ConnectionPool::with_factory(PoolOptions::default(), factory.clone());
        for name in ["up", "down"] {
            pool.add_server(ServerConfig::stdio(name, "npx", vec![]))
                .await
                .unwrap();
        }
        pool.connect_all().await;

        let checker = HealthChecker::new();
        let report = checker.check_pool(&pool, Duration::from_secs(1)).await;

        assert!(report["up"].success);
        assert!(report["up"].latency_ms.is_some());
        assert!(!report["down"].success);
        assert_eq!(report["down"].error.as_deref(), Some("server is error"));

        assert_eq!(checker.latest("up").unwrap().status, ServerStatus::Connected);
        assert_eq!(checker.latest("down").unwrap().status, ServerStatus::Error);
        assert!((checker.uptime_percentage("up") - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_ping_times_out_without_failing() {
        let factory = Arc::new(MockFactory::new());
        let pool = ConnectionPool::with_factory(PoolOptions::default(), factory.clone());
        let connection = pool
            .add_server(ServerConfig::stdio("slow", "npx", vec![]))
            .await
            .unwrap();
        connection.connect().await.unwrap();

        let ping = HealthChecker::ping(&connection, Duration::from_secs(1)).await;
        assert!(ping.success);

        factory.transport("slow").unwrap().hold("ping");
        let ping = HealthChecker::ping(&connection, Duration::from_millis(50)).await;
        assert!(!ping.success);
        assert!(ping.latency_ms.is_none());
        assert!(ping.error.unwrap().contains("timed out"));
    }
}
