//! Subprocess sandboxing: bounded diagnostic capture, resource policing and signals

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default ceiling for captured stderr
pub const DEFAULT_OUTPUT_LIMIT: usize = 64 * 1024;

/// Rolling buffer of output lines bounded by total byte size
///
/// Oldest lines are evicted first; `is_truncated` reports whether anything
/// was ever dropped.
#[derive(Debug, Clone)]
pub struct OutputCollector {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl Default for OutputCollector {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_LIMIT)
    }
}

impl OutputCollector {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    pub fn push_line(&mut self, line: &str) {
        let line = if line.len() > self.max_bytes {
            self.truncated = true;
            let mut start = line.len() - self.max_bytes;
            while !line.is_char_boundary(start) {
                start += 1;
            }
            &line[start..]
        } else {
            line
        };

        self.bytes += line.len();
        self.lines.push_back(line.to_string());

        while self.bytes > self.max_bytes {
            match self.lines.pop_front() {
                Some(evicted) => {
                    self.bytes -= evicted.len();
                    self.truncated = true;
                }
                None => break,
            }
        }
    }

    /// Everything captured, newline separated
    pub fn contents(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }

    /// The last `n` lines
    pub fn tail(&self, n: usize) -> String {
        let skip = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(skip)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.bytes = 0;
        self.truncated = false;
    }
}

/// Ceilings enforced on a sandboxed child
///
/// CPU is policed as a usage rate, not as accumulated CPU time: each poll
/// compares the share of one core used since the previous poll against
/// `max_cpu_percent`. A long-lived server that stays under the rate is never
/// killed, however much CPU time it has consumed in total.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Resident memory ceiling
    pub max_memory_bytes: Option<u64>,
    /// Ceiling on CPU usage per poll interval, in percent of one core
    pub max_cpu_percent: Option<f32>,
    pub poll_interval: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: None,
            max_cpu_percent: None,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl ResourceLimits {
    pub fn is_unbounded(&self) -> bool {
        self.max_memory_bytes.is_none() && self.max_cpu_percent.is_none()
    }
}

/// One usage sample of a process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceViolation {
    Memory { used: u64, limit: u64 },
    Cpu { used: f32, limit: f32 },
}

impl fmt::Display for ResourceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceViolation::Memory { used, limit } => write!(
                f,
                "memory {} MiB exceeds limit {} MiB",
                used / (1024 * 1024),
                limit / (1024 * 1024)
            ),
            ResourceViolation::Cpu { used, limit } => {
                write!(f, "cpu {:.1}% exceeds limit {:.1}%", used, limit)
            }
        }
    }
}

/// Outcome of one monitor check
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorStatus {
    Within(ResourceUsage),
    Exceeded(ResourceViolation),
    Gone,
}

/// Source of process usage samples
#[cfg_attr(test, mockall::automock)]
pub trait ResourceSampler: Send {
    /// `None` once the process no longer exists
    fn sample(&mut self, pid: u32) -> Option<ResourceUsage>;
}

/// Samples through `sysinfo`
pub struct SysinfoSampler {
    system: System,
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&mut self, pid: u32) -> Option<ResourceUsage> {
        let pid = Pid::from_u32(pid);
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        self.system.process(pid).map(|process| ResourceUsage {
            memory_bytes: process.memory(),
            cpu_percent: process.cpu_usage(),
        })
    }
}

/// Periodically compares a process' usage against its limits
pub struct ResourceMonitor<S = SysinfoSampler> {
    limits: ResourceLimits,
    sampler: S,
}

impl ResourceMonitor<SysinfoSampler> {
    pub fn new(limits: ResourceLimits) -> Self {
        Self::with_sampler(limits, SysinfoSampler::default())
    }
}

impl<S: ResourceSampler + 'static> ResourceMonitor<S> {
    pub fn with_sampler(limits: ResourceLimits, sampler: S) -> Self {
        Self { limits, sampler }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Take one sample and compare it against the limits
    pub fn check(&mut self, pid: u32) -> MonitorStatus {
        let Some(usage) = self.sampler.sample(pid) else {
            return MonitorStatus::Gone;
        };

        if let Some(limit) = self.limits.max_memory_bytes {
            if usage.memory_bytes > limit {
                return MonitorStatus::Exceeded(ResourceViolation::Memory {
                    used: usage.memory_bytes,
                    limit,
                });
            }
        }
        if let Some(limit) = self.limits.max_cpu_percent {
            if usage.cpu_percent > limit {
                return MonitorStatus::Exceeded(ResourceViolation::Cpu {
                    used: usage.cpu_percent,
                    limit,
                });
            }
        }
        MonitorStatus::Within(usage)
    }

    /// Poll until cancelled, the process disappears, or a limit is breached
    pub fn spawn<F>(mut self, pid: u32, cancel: CancellationToken, on_violation: F) -> JoinHandle<()>
    where
        F: FnOnce(ResourceViolation) + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.limits.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.check(pid) {
                    MonitorStatus::Within(_) => {}
                    MonitorStatus::Exceeded(violation) => {
                        warn!(pid, %violation, "Resource limit exceeded");
                        on_violation(violation);
                        break;
                    }
                    MonitorStatus::Gone => {
                        debug!(pid, "Monitored process gone");
                        break;
                    }
                }
            }
        })
    }
}

/// Send SIGTERM to the process, or to its whole group
#[cfg(unix)]
pub fn terminate(pid: u32, group: bool) -> std::io::Result<()> {
    send_signal(pid, group, nix::sys::signal::Signal::SIGTERM)
}

/// Send SIGKILL to the process, or to its whole group
#[cfg(unix)]
pub fn force_kill(pid: u32, group: bool) -> std::io::Result<()> {
    send_signal(pid, group, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_signal(pid: u32, group: bool, signal: nix::sys::signal::Signal) -> std::io::Result<()> {
    use nix::sys::signal::{kill, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| std::io::Error::other("pid out of range"))?;
    let result = if group {
        killpg(Pid::from_raw(raw), signal)
    } else {
        kill(Pid::from_raw(raw), signal)
    };
    match result {
        // Already gone
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(errno) => Err(std::io::Error::from(errno)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_collector_rolls() {
        let mut out = OutputCollector::new(10);
        out.push_line("aaaa");
        out.push_line("bbbb");
        assert!(!out.is_truncated());
        assert_eq!(out.contents(), "aaaa\nbbbb");

        out.push_line("cccc");
        assert!(out.is_truncated());
        assert_eq!(out.contents(), "bbbb\ncccc");
        assert!(out.len_bytes() <= 10);
        assert_eq!(out.tail(1), "cccc");
    }

    #[test]
    fn test_output_collector_oversized_line() {
        let mut out = OutputCollector::new(4);
        out.push_line("0123456789");
        assert!(out.is_truncated());
        assert_eq!(out.contents(), "6789");

        out.clear();
        assert!(out.is_empty());
        assert!(!out.is_truncated());
    }

    fn limits() -> ResourceLimits {
        ResourceLimits {
            max_memory_bytes: Some(100 * 1024 * 1024),
            max_cpu_percent: Some(80.0),
            poll_interval: Duration::from_millis(100),
        }
    }

    #[test]
    fn test_check_detects_violations() {
        let mut sampler = MockResourceSampler::new();
        let mut samples = vec![
            None,
            Some(ResourceUsage {
                memory_bytes: 10,
                cpu_percent: 95.0,
            }),
            Some(ResourceUsage {
                memory_bytes: 200 * 1024 * 1024,
                cpu_percent: 1.0,
            }),
            Some(ResourceUsage {
                memory_bytes: 10,
                cpu_percent: 1.0,
            }),
        ];
        sampler
            .expect_sample()
            .times(4)
            .returning(move |_| samples.pop().flatten());

        let mut monitor = ResourceMonitor::with_sampler(limits(), sampler);
        assert!(matches!(monitor.check(1), MonitorStatus::Within(_)));
        assert!(matches!(
            monitor.check(1),
            MonitorStatus::Exceeded(ResourceViolation::Memory { .. })
        ));
        assert!(matches!(
            monitor.check(1),
            MonitorStatus::Exceeded(ResourceViolation::Cpu { .. })
        ));
        assert_eq!(monitor.check(1), MonitorStatus::Gone);
    }

    #[test]
    fn test_cpu_limit_is_a_rate() {
        let mut sampler = MockResourceSampler::new();
        sampler.expect_sample().returning(|_| {
            Some(ResourceUsage {
                memory_bytes: 10,
                cpu_percent: 79.0,
            })
        });

        // Usage just under the ceiling never trips, however long it lasts
        let mut monitor = ResourceMonitor::with_sampler(limits(), sampler);
        for _ in 0..1_000 {
            assert!(matches!(monitor.check(1), MonitorStatus::Within(_)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_reports_violation() {
        let mut sampler = MockResourceSampler::new();
        let mut calls = 0;
        sampler.expect_sample().returning(move |_| {
            calls += 1;
            Some(ResourceUsage {
                memory_bytes: if calls >= 3 { u64::MAX } else { 1 },
                cpu_percent: 0.0,
            })
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        let handle = ResourceMonitor::with_sampler(limits(), sampler).spawn(
            42,
            CancellationToken::new(),
            move |violation| {
                let _ = tx.send(violation);
            },
        );

        let violation = rx.await.unwrap();
        assert!(matches!(violation, ResourceViolation::Memory { .. }));
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_monitor_stops_on_cancel() {
        let mut sampler = MockResourceSampler::new();
        sampler.expect_sample().returning(|_| {
            Some(ResourceUsage {
                memory_bytes: 1,
                cpu_percent: 0.0,
            })
        });

        let cancel = CancellationToken::new();
        let handle = ResourceMonitor::with_sampler(limits(), sampler).spawn(
            42,
            cancel.clone(),
            |_| panic!("no violation expected"),
        );

        tokio::time::sleep(Duration::from_millis(350)).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[test]
    fn test_violation_display() {
        let violation = ResourceViolation::Memory {
            used: 300 * 1024 * 1024,
            limit: 256 * 1024 * 1024,
        };
        assert_eq!(violation.to_string(), "memory 300 MiB exceeds limit 256 MiB");
    }
}
