//! Stdio transport
//!
//! Spawns the MCP server as a child process and exchanges newline-delimited
//! JSON-RPC messages over its standard input/output. Standard error is kept
//! in a bounded buffer for diagnostics and never parsed.

use super::{EventDispatcher, EventSink, Transport, TransportHandlers};
use crate::Result;
use crate::config::{ServerConfig, TransportConfig};
use crate::error::MCPError;
use crate::protocol::{self, JsonRpcMessage};
use crate::sandbox::{OutputCollector, ResourceLimits, ResourceMonitor};
use crate::security::sanitize_env;
use crate::types::TransportKind;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Longest stdout line accepted as a message
pub const MAX_LINE_LENGTH: usize = 4 * 1024 * 1024;

/// Time between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Stderr lines included in a close reason
const STDERR_TAIL_LINES: usize = 20;

/// How long teardown waits for stderr to drain after the child exited
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    /// `disconnect()` was called
    Requested,
    /// stdout reached end of file
    Exited,
    /// The resource monitor flagged the child
    ResourceLimit,
}

/// Transport that talks to a child process over stdio
pub struct StdioTransport {
    inner: Arc<StdioInner>,
}

struct StdioInner {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    sandboxed: bool,
    limits: Option<ResourceLimits>,
    grace_period: Duration,
    max_line_length: usize,

    events: Arc<EventDispatcher>,
    stdin: Mutex<Option<ChildStdin>>,
    process: Mutex<Option<ProcessHandle>>,
    stderr: parking_lot::Mutex<OutputCollector>,
    connected: AtomicBool,
}

/// Everything owned by one spawned child
struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    sink: EventSink,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
    monitor: Option<(CancellationToken, JoinHandle<()>)>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.stdout_task.abort();
        self.stderr_task.abort();
        if let Some((token, task)) = self.monitor.take() {
            token.cancel();
            task.abort();
        }
    }
}

/// One newline-terminated chunk of child output
#[derive(Debug, PartialEq)]
enum Line {
    Complete(Vec<u8>),
    /// A line longer than the cap; its bytes were dropped
    Oversized,
}

/// Newline framing over raw bytes with a per-line cap
///
/// Bytes are never decoded here, so invalid UTF-8 only affects the line it
/// appears in. Memory stays within the cap plus one read buffer.
struct LineReader<R> {
    reader: BufReader<R>,
    max_length: usize,
    line: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R, max_length: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            max_length,
            line: Vec::new(),
            discarding: false,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<Line>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                let discarding = std::mem::take(&mut self.discarding);
                if discarding || self.line.is_empty() {
                    self.line.clear();
                    return Ok(None);
                }
                return Ok(Some(Line::Complete(std::mem::take(&mut self.line))));
            }

            let newline = available.iter().position(|b| *b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            let used = chunk.len() + usize::from(newline.is_some());
            if !self.discarding {
                self.line.extend_from_slice(chunk);
            }
            self.reader.consume(used);

            if !self.discarding && self.line.len() > self.max_length {
                self.line.clear();
                self.discarding = newline.is_none();
                return Ok(Some(Line::Oversized));
            }
            if newline.is_some() {
                if std::mem::take(&mut self.discarding) {
                    continue;
                }
                return Ok(Some(Line::Complete(std::mem::take(&mut self.line))));
            }
        }
    }
}

/// Split a command that carries inline arguments into program and arguments
fn split_command(command: &str) -> (&str, Vec<String>) {
    let mut parts = command.split_whitespace();
    let program = parts.next().unwrap_or(command);
    (program, parts.map(str::to_string).collect())
}

impl StdioTransport {
    /// Create from a stdio [`ServerConfig`]
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } = &config.transport
        else {
            return Err(MCPError::ConfigError(
                "Expected Stdio transport config".to_string(),
            ));
        };

        Ok(Self {
            inner: Arc::new(StdioInner {
                name: config.name.clone(),
                command: command.clone(),
                args: args.clone(),
                env: env.clone(),
                cwd: cwd.clone(),
                sandboxed: config.sandboxed,
                limits: config.effective_resource_limits(),
                grace_period: DEFAULT_GRACE_PERIOD,
                max_line_length: MAX_LINE_LENGTH,
                events: EventDispatcher::new(),
                stdin: Mutex::new(None),
                process: Mutex::new(None),
                stderr: parking_lot::Mutex::new(OutputCollector::default()),
                connected: AtomicBool::new(false),
            }),
        })
    }

    /// Override the SIGTERM to SIGKILL grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.grace_period = grace_period;
        }
        self
    }

    /// Override the longest accepted stdout line
    pub fn with_max_line_length(mut self, max_line_length: usize) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.max_line_length = max_line_length;
        }
        self
    }

    /// Process id of the running child
    pub async fn pid(&self) -> Option<u32> {
        self.inner.process.lock().await.as_ref().and_then(|p| p.pid)
    }
}

impl StdioInner {
    fn build_command(&self) -> Command {
        // "npx -y pkg" runs npx with the inline arguments ahead of `args`
        let (program, inline_args) = split_command(&self.command);
        let mut cmd = Command::new(program);
        cmd.args(inline_args)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        if self.sandboxed {
            let merged = std::env::vars().chain(self.env.clone());
            cmd.env_clear().envs(sanitize_env(merged));

            #[cfg(unix)]
            cmd.process_group(0);
        } else {
            cmd.envs(&self.env);
        }

        cmd
    }

    async fn spawn(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.process.lock().await;
        if slot.is_some() {
            return Ok(());
        }

        let sink = self.events.arm();
        self.stderr.lock().clear();

        debug!(
            server = %self.name,
            command = %self.command,
            args = ?self.args,
            sandboxed = self.sandboxed,
            "Spawning MCP server process"
        );

        let mut child = self.build_command().spawn().map_err(|e| {
            MCPError::ConnectionFailed(format!("Failed to spawn '{}': {}", self.command, e))
        })?;
        let pid = child.id();

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(MCPError::ConnectionFailed(
                "Child process is missing a stdio pipe".to_string(),
            ));
        };

        let stdout_task = tokio::spawn(read_stdout(
            Arc::downgrade(self),
            LineReader::new(stdout, self.max_line_length),
            sink.clone(),
        ));
        let stderr_task = tokio::spawn(read_stderr(
            Arc::downgrade(self),
            LineReader::new(stderr, self.max_line_length),
        ));

        let monitor = match (&self.limits, pid) {
            (Some(limits), Some(pid)) if !limits.is_unbounded() => {
                Some(self.start_monitor(limits.clone(), pid, sink.clone()))
            }
            _ => None,
        };

        *self.stdin.lock().await = Some(stdin);
        *slot = Some(ProcessHandle {
            child,
            pid,
            sink: sink.clone(),
            stdout_task,
            stderr_task,
            monitor,
        });
        self.connected.store(true, Ordering::SeqCst);
        drop(slot);

        info!(server = %self.name, pid = ?pid, "MCP server process started");
        sink.open();
        Ok(())
    }

    fn start_monitor(
        self: &Arc<Self>,
        limits: ResourceLimits,
        pid: u32,
        sink: EventSink,
    ) -> (CancellationToken, JoinHandle<()>) {
        let token = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let task = ResourceMonitor::new(limits).spawn(pid, token.clone(), move |violation| {
            sink.error(MCPError::ResourceLimit(violation.to_string()));
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(async move { inner.teardown(Teardown::ResourceLimit).await });
            }
        });
        (token, task)
    }

    async fn write_line(&self, line: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| MCPError::Transport("stdio transport is not connected".to_string()))?;

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| MCPError::Transport(e.to_string()))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| MCPError::Transport(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| MCPError::Transport(e.to_string()))
    }

    /// Single exit path for the child, whatever ended it
    async fn teardown(&self, reason: Teardown) {
        if reason == Teardown::Requested {
            self.events.close();
        }

        let mut slot = self.process.lock().await;
        let Some(mut handle) = slot.take() else {
            return;
        };
        self.connected.store(false, Ordering::SeqCst);

        if let Some((token, task)) = handle.monitor.take() {
            token.cancel();
            task.abort();
        }
        handle.stdout_task.abort();

        // Closing stdin asks well-behaved servers to exit
        drop(self.stdin.lock().await.take());

        let status = self.stop_child(&mut handle, reason).await;

        if reason == Teardown::Requested {
            handle.stderr_task.abort();
            info!(server = %self.name, "MCP server process stopped");
            return;
        }

        // Let stderr drain so the close reason carries the child's last words
        let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut handle.stderr_task).await;

        let exit = status.map_or_else(|| "unknown status".to_string(), |s| s.to_string());
        let tail = self.stderr.lock().tail(STDERR_TAIL_LINES);
        let mut message = match reason {
            Teardown::ResourceLimit => format!("process killed after exceeding resource limits ({exit})"),
            _ => format!("process exited ({exit})"),
        };
        if !tail.is_empty() {
            message.push_str(": ");
            message.push_str(&tail);
        }

        warn!(server = %self.name, "MCP server {}", message);
        handle.sink.close(Some(message));
    }

    async fn stop_child(&self, handle: &mut ProcessHandle, reason: Teardown) -> Option<ExitStatus> {
        if let Ok(Some(status)) = handle.child.try_wait() {
            self.kill_group(handle.pid);
            return Some(status);
        }

        if reason != Teardown::ResourceLimit {
            #[cfg(unix)]
            if let Some(pid) = handle.pid {
                if let Err(e) = crate::sandbox::terminate(pid, self.sandboxed) {
                    debug!(server = %self.name, "SIGTERM failed: {}", e);
                }
            }

            if let Ok(Ok(status)) =
                tokio::time::timeout(self.grace_period, handle.child.wait()).await
            {
                self.kill_group(handle.pid);
                return Some(status);
            }
            warn!(server = %self.name, "Process ignored SIGTERM, killing");
        }

        self.kill_group(handle.pid);
        if let Err(e) = handle.child.start_kill() {
            debug!(server = %self.name, "Kill failed: {}", e);
        }
        handle.child.wait().await.ok()
    }

    /// Take down descendants left in a sandboxed child's process group
    fn kill_group(&self, pid: Option<u32>) {
        #[cfg(unix)]
        if self.sandboxed {
            if let Some(pid) = pid {
                let _ = crate::sandbox::force_kill(pid, true);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;
    }
}

async fn read_stdout<R>(inner: Weak<StdioInner>, mut lines: LineReader<R>, sink: EventSink)
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(Line::Complete(line))) => {
                let line = line.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                match protocol::parse(line) {
                    Ok(message) => {
                        debug!("<- {}", String::from_utf8_lossy(line));
                        sink.message(message);
                    }
                    Err(e) => sink.error(e),
                }
            }
            Ok(Some(Line::Oversized)) => {
                sink.error(MCPError::Transport(
                    "discarded stdout line exceeding the maximum length".to_string(),
                ));
            }
            Ok(None) => break,
            Err(e) => {
                sink.error(MCPError::Transport(format!("stdout read failed: {e}")));
                break;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        tokio::spawn(async move { inner.teardown(Teardown::Exited).await });
    }
}

/// Drain stderr until end of file; a closed read end would SIGPIPE the child
async fn read_stderr<R>(inner: Weak<StdioInner>, mut lines: LineReader<R>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                debug!("stderr read failed: {}", e);
                break;
            }
        };
        let Some(inner) = inner.upgrade() else {
            continue;
        };
        match line {
            Line::Complete(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                let text = text.trim_end_matches('\r');
                debug!(server = %inner.name, "stderr: {}", text);
                inner.stderr.lock().push_line(text);
            }
            Line::Oversized => {
                inner.stderr.lock().push_line("[oversized stderr line dropped]");
            }
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn connect(&self) -> Result<()> {
        self.inner.spawn().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.teardown(Teardown::Requested).await;
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let line = protocol::serialize_to_string(message)?;
        debug!(server = %self.inner.name, "-> {}", line);
        self.inner.write_line(&line).await
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.inner.events.set_handlers(handlers);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn diagnostics(&self) -> Option<String> {
        let stderr = self.inner.stderr.lock();
        if stderr.is_empty() {
            None
        } else {
            Some(stderr.contents())
        }
    }
}
