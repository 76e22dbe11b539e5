//! WebSocket transport
//!
//! One JSON-RPC message per text frame, in both directions.

use super::{EventDispatcher, EventSink, Transport, TransportHandlers};
use crate::Result;
use crate::config::{ServerConfig, TransportConfig};
use crate::error::MCPError;
use crate::protocol::{self, JsonRpcMessage};
use crate::types::TransportKind;
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Upper bound on the closing handshake during disconnect
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// MCP client over a WebSocket
pub struct WebSocketTransport {
    inner: Arc<WsInner>,
}

struct WsInner {
    name: String,
    url: Url,
    headers: HashMap<String, String>,
    timeout: Duration,
    sandboxed: bool,

    events: Arc<EventDispatcher>,
    writer: Mutex<Option<WsWriter>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: AtomicBool,
}

impl WebSocketTransport {
    /// Create from a WebSocket [`ServerConfig`]
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let TransportConfig::Websocket { url, headers } = &config.transport else {
            return Err(MCPError::ConfigError(
                "Expected Websocket transport config".to_string(),
            ));
        };

        let url = Url::parse(url)
            .map_err(|e| MCPError::ConfigError(format!("Invalid URL '{}': {}", url, e)))?;

        Ok(Self {
            inner: Arc::new(WsInner {
                name: config.name.clone(),
                url,
                headers: headers.clone(),
                timeout: config.timeout(),
                sandboxed: config.sandboxed,
                events: EventDispatcher::new(),
                writer: Mutex::new(None),
                reader: Mutex::new(None),
                connected: AtomicBool::new(false),
            }),
        })
    }
}

impl WsInner {
    async fn open(self: &Arc<Self>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = self.reader.lock().await.take() {
            stale.abort();
        }

        if self.sandboxed {
            crate::security::check_resolved_host(&self.url).await?;
        }

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| MCPError::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| MCPError::Validation(format!("invalid header name '{}': {}", name, e)))?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                MCPError::Validation(format!("invalid value for header '{}': {}", name, e))
            })?;
            request.headers_mut().insert(name, value);
        }

        let sink = self.events.arm();

        let (stream, _response) = match tokio::time::timeout(self.timeout, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(MCPError::ConnectionFailed(format!(
                    "WebSocket handshake failed: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(MCPError::ConnectionFailed(format!(
                    "WebSocket connect timed out after {:?}",
                    self.timeout
                )));
            }
        };

        let (write_half, read_half) = stream.split();
        *writer = Some(write_half);
        *self.reader.lock().await = Some(tokio::spawn(read_frames(
            Arc::downgrade(self),
            read_half,
            sink.clone(),
        )));
        self.connected.store(true, Ordering::SeqCst);
        drop(writer);

        info!(server = %self.name, url = %self.url, "WebSocket connected");
        sink.open();
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().filter(|_| self.connected.load(Ordering::SeqCst)).ok_or_else(|| {
            MCPError::Transport("WebSocket transport is not connected".to_string())
        })?;
        writer
            .send(Message::Text(text))
            .await
            .map_err(|e| MCPError::Transport(format!("WebSocket send failed: {}", e)))
    }

    async fn close(&self) {
        self.events.close();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            };
            let goodbye = async {
                writer.send(Message::Close(Some(frame))).await?;
                writer.close().await
            };
            if let Ok(Err(e)) = tokio::time::timeout(CLOSE_TIMEOUT, goodbye).await {
                debug!(server = %self.name, "WebSocket close handshake failed: {}", e);
            }
        }
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
    }
}

async fn read_frames(inner: Weak<WsInner>, mut reader: WsReader, sink: EventSink) {
    let mut reason = None;

    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match protocol::parse(text.as_bytes()) {
                Ok(message) => {
                    debug!("<- {}", text);
                    sink.message(message);
                }
                Err(e) => sink.error(e),
            },
            Ok(Message::Binary(bytes)) => {
                debug!("Ignoring {}-byte binary frame", bytes.len());
            }
            Ok(Message::Close(frame)) => {
                match &frame {
                    Some(frame) if frame.code != CloseCode::Normal => {
                        sink.error(MCPError::Transport(format!(
                            "WebSocket closed with code {}: {}",
                            u16::from(frame.code),
                            frame.reason
                        )));
                    }
                    _ => {}
                }
                reason = Some(frame.map_or_else(
                    || "closed by server".to_string(),
                    |f| format!("closed by server ({})", u16::from(f.code)),
                ));
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("WebSocket read failed: {}", e);
                sink.error(MCPError::Transport(format!("WebSocket read failed: {}", e)));
                reason = Some(e.to_string());
                break;
            }
        }
    }

    let reason = match reason {
        Some(reason) => reason,
        None => {
            // Stream ended without a closing handshake (1006)
            sink.error(MCPError::Transport(
                "WebSocket closed abnormally".to_string(),
            ));
            "closed abnormally".to_string()
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.connected.store(false, Ordering::SeqCst);
    }
    sink.close(Some(reason));
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> Result<()> {
        self.inner.open().await
    }

    async fn disconnect(&self) -> Result<()> {
        self.inner.close().await;
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        let text = protocol::serialize_to_string(message)?;
        debug!(server = %self.inner.name, "-> {}", text);
        self.inner.send_text(text).await
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        self.inner.events.set_handlers(handlers);
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Accepts one socket and hands it to `script`
    async fn serve<F, Fut>(script: F) -> String
    where
        F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(socket).await.unwrap();
            script(ws).await;
        });
        format!("ws://{addr}/mcp")
    }

    fn transport(url: &str) -> WebSocketTransport {
        // Loopback test servers bypass config validation
        let mut config = ServerConfig::websocket("ws-test", url);
        config.sandboxed = false;
        config.timeout_ms = 5_000;
        WebSocketTransport::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_echo_and_normal_close() {
        let url = serve(|mut ws| async move {
            while let Some(Ok(frame)) = ws.next().await {
                if frame.is_text() {
                    ws.send(frame).await.unwrap();
                } else if frame.is_close() {
                    break;
                }
            }
        })
        .await;

        let transport = transport(&url);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (etx, mut errors) = mpsc::unbounded_channel();
        transport.set_handlers(TransportHandlers {
            on_message: Some(Arc::new(move |m: JsonRpcMessage| {
                let _ = tx.send(m);
            })),
            on_error: Some(Arc::new(move |e: MCPError| {
                let _ = etx.send(e);
            })),
            on_close: None,
        });

        transport.connect().await.unwrap();
        let ping: JsonRpcMessage =
            crate::protocol::JsonRpcRequest::new(1.into(), "ping", None).into();
        transport.send(&ping).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), ping);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
        assert!(errors.try_recv().is_err());
        assert!(matches!(
            transport.send(&ping).await,
            Err(MCPError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_abnormal_close_reports_error_then_close() {
        let url = serve(|mut ws| async move {
            let frame = CloseFrame {
                code: CloseCode::Error,
                reason: "internal failure".into(),
            };
            let _ = ws.close(Some(frame)).await;
        })
        .await;

        let transport = transport(&url);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (etx, ctx) = (tx.clone(), tx);
        transport.set_handlers(TransportHandlers {
            on_message: None,
            on_error: Some(Arc::new(move |e: MCPError| {
                let _ = etx.send(format!("error: {e}"));
            })),
            on_close: Some(Arc::new(move |r: Option<String>| {
                let _ = ctx.send(format!("close: {}", r.unwrap_or_default()));
            })),
        });

        transport.connect().await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(first.starts_with("error:") && first.contains("1011"), "{first}");
        let second = rx.recv().await.unwrap();
        assert!(second.starts_with("close:"), "{second}");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = transport(&format!("ws://{addr}/mcp"));
        assert!(matches!(
            transport.connect().await,
            Err(MCPError::ConnectionFailed(_))
        ));
    }
}
