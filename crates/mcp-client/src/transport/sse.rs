//! SSE transport
//!
//! Server-to-client messages arrive as `message` events on a long-lived
//! event stream; client-to-server messages are separate `POST` requests.

use super::{EventDispatcher, EventSink, Transport, TransportHandlers};
use crate::Result;
use crate::config::{ServerConfig, TransportConfig};
use crate::error::MCPError;
use crate::protocol::{self, JsonRpcMessage};
use crate::types::TransportKind;
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest_eventsource::{Event, EventSource};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

/// Header carrying the server-assigned session id
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// MCP client over HTTP Server-Sent Events
pub struct SseTransport {
    inner: Arc<SseInner>,
}

struct SseInner {
    name: String,
    url: Url,
    headers: HeaderMap,
    timeout: Duration,
    sandboxed: bool,
    client: reqwest::Client,

    events: Arc<EventDispatcher>,
    post_url: RwLock<Url>,
    session_id: RwLock<Option<String>>,
    sink: parking_lot::Mutex<Option<EventSink>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

pub(crate) fn header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| MCPError::Validation(format!("invalid header name '{}': {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| MCPError::Validation(format!("invalid value for header '{}': {}", name, e)))?;
        map.insert(name, value);
    }
    Ok(map)
}

impl SseTransport {
    /// Create from an SSE [`ServerConfig`]
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let TransportConfig::Sse { url, headers } = &config.transport else {
            return Err(MCPError::ConfigError(
                "Expected Sse transport config".to_string(),
            ));
        };

        let url = Url::parse(url)
            .map_err(|e| MCPError::ConfigError(format!("Invalid URL '{}': {}", url, e)))?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .build()
            .map_err(|e| MCPError::InternalError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            inner: Arc::new(SseInner {
                name: config.name.clone(),
                post_url: RwLock::new(url.clone()),
                url,
                headers: header_map(headers)?,
                timeout: config.timeout(),
                sandboxed: config.sandboxed,
                client,
                events: EventDispatcher::new(),
                session_id: RwLock::new(None),
                sink: parking_lot::Mutex::new(None),
                reader: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
        })
    }

    /// Session id announced by the server, if any
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    /// Where outbound messages are currently posted
    pub fn post_url(&self) -> Url {
        self.inner.post_url.read().clone()
    }
}

impl SseInner {
    async fn open_stream(self: &Arc<Self>) -> Result<()> {
        let mut reader = self.reader.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = reader.take() {
            stale.abort();
        }

        if self.sandboxed {
            crate::security::check_resolved_host(&self.url).await?;
        }

        let sink = self.events.arm();
        *self.session_id.write() = None;
        *self.post_url.write() = self.url.clone();

        let request = self
            .client
            .get(self.url.clone())
            .headers(self.headers.clone());
        let mut source = EventSource::new(request)
            .map_err(|e| MCPError::ConnectionFailed(format!("Invalid SSE request: {}", e)))?;
        // Reconnection belongs to the connection state machine
        source.set_retry_policy(Box::new(reqwest_eventsource::retry::Never));

        let (open_tx, open_rx) = oneshot::channel();
        let task = tokio::spawn(read_events(Arc::downgrade(self), source, sink.clone(), open_tx));

        match tokio::time::timeout(self.timeout, open_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                task.abort();
                return Err(MCPError::ConnectionFailed(format!(
                    "SSE stream failed to open: {}",
                    e
                )));
            }
            Ok(Err(_)) => {
                task.abort();
                return Err(MCPError::ConnectionFailed(
                    "SSE stream ended before opening".to_string(),
                ));
            }
            Err(_) => {
                task.abort();
                return Err(MCPError::ConnectionFailed(format!(
                    "SSE connect timed out after {:?}",
                    self.timeout
                )));
            }
        }

        *reader = Some(task);
        *self.sink.lock() = Some(sink.clone());
        self.connected.store(true, Ordering::SeqCst);
        drop(reader);

        info!(server = %self.name, url = %self.url, "SSE stream opened");
        sink.open();
        Ok(())
    }

    fn handle_event(&self, sink: &EventSink, event: &str, data: &str) {
        match event {
            "" | "message" => match protocol::parse(data.as_bytes()) {
                Ok(message) => {
                    debug!(server = %self.name, "<- {}", data);
                    sink.message(message);
                }
                Err(e) => sink.error(e),
            },
            "session" => {
                let id = data.trim();
                debug!(server = %self.name, session = %id, "SSE session assigned");
                *self.session_id.write() = Some(id.to_string());
            }
            "endpoint" => match self.url.join(data.trim()) {
                Ok(endpoint) if endpoint.origin() == self.url.origin() => {
                    debug!(server = %self.name, endpoint = %endpoint, "SSE post endpoint");
                    *self.post_url.write() = endpoint;
                }
                Ok(endpoint) => sink.error(MCPError::Validation(format!(
                    "endpoint '{}' is not on the stream's origin",
                    endpoint
                ))),
                Err(e) => sink.error(MCPError::Transport(format!(
                    "invalid endpoint '{}': {}",
                    data, e
                ))),
            },
            other => debug!(server = %self.name, "Ignoring SSE event '{}'", other),
        }
    }

    async fn post(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MCPError::Transport(
                "SSE transport is not connected".to_string(),
            ));
        }

        let body = protocol::serialize(message)?;
        let mut request = self
            .client
            .post(self.post_url.read().clone())
            .headers(self.headers.clone())
            .header(CONTENT_TYPE, "application/json")
            .timeout(self.timeout)
            .body(body);
        if let Some(session) = self.session_id.read().clone() {
            request = request.header(SESSION_HEADER, session);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MCPError::Transport(format!("POST failed: {}", e)))?;

        if let Some(session) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.write() = Some(session.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            return Err(MCPError::Transport(format!("POST returned HTTP {}", status)));
        }

        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));
        if !is_json {
            return Ok(());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| MCPError::Transport(format!("Failed to read POST response: {}", e)))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }

        match protocol::parse(&bytes) {
            Ok(inbound) => {
                let sink = self.sink.lock().clone();
                if let Some(sink) = sink {
                    sink.message(inbound);
                }
            }
            Err(e) => debug!(server = %self.name, "Ignoring POST response body: {}", e),
        }
        Ok(())
    }

    async fn close(&self) {
        self.events.close();
        self.connected.store(false, Ordering::SeqCst);
        self.sink.lock().take();
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        *self.session_id.write() = None;
    }
}

async fn read_events(
    inner: Weak<SseInner>,
    mut source: EventSource,
    sink: EventSink,
    open_tx: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut open_tx = Some(open_tx);
    let mut reason = "event stream ended".to_string();

    while let Some(event) = source.next().await {
        match event {
            Ok(Event::Open) => {
                if let Some(tx) = open_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Message(message)) => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.handle_event(&sink, &message.event, &message.data);
            }
            Err(reqwest_eventsource::Error::StreamEnded) => break,
            Err(e) => {
                if let Some(tx) = open_tx.take() {
                    let _ = tx.send(Err(e.to_string()));
                    source.close();
                    return;
                }
                warn!("SSE stream error: {}", e);
                reason = e.to_string();
                sink.error(MCPError::Transport(reason.clone()));
                break;
            }
        }
    }
    source.close();

    if let Some(inner) = inner.upgrade() {
        inner.connected.store(false, Ordering::SeqCst);
    }
    sink.close(Some(reason));
}

#[async_trait]
impl Transport for SseTransport {
    async fn connect(&self) -> Result<()> {
        self.inner.open_stream().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.close().await;
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        self.inner.post(message).await
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.inner.events.set_handlers(handlers);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Sse
    }
}
