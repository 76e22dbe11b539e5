//! In-memory transport and factory used by connection and pool tests

use crate::Result;
use crate::config::ServerConfig;
use crate::error::MCPError;
use crate::protocol::{JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::transport::{ArcTransport, Transport, TransportFactory, TransportHandlers};
use crate::types::TransportKind;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Tracks how many connects run at once
#[derive(Default)]
pub(crate) struct ConcurrencyProbe {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl ConcurrencyProbe {
    pub(crate) fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Scripted MCP server behind the [`Transport`] trait
///
/// Answers `initialize`, `tools/list` and `ping` itself, answers other
/// methods from `responses`, and holds anything else until the test replies.
pub(crate) struct MockTransport {
    handlers: RwLock<TransportHandlers>,
    connected: AtomicBool,
    fail_connect: AtomicBool,
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    probe: Mutex<Option<Arc<ConcurrencyProbe>>>,
    capabilities: Mutex<Value>,
    tools: Mutex<Vec<Value>>,
    responses: Mutex<HashMap<String, Value>>,
    held_methods: Mutex<HashSet<String>>,
    sent: Mutex<Vec<JsonRpcMessage>>,
    held: Mutex<Vec<JsonRpcRequest>>,
}

impl MockTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(TransportHandlers::default()),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            probe: Mutex::new(None),
            capabilities: Mutex::new(json!({"tools": {"listChanged": true}})),
            tools: Mutex::new(Vec::new()),
            responses: Mutex::new(HashMap::new()),
            held_methods: Mutex::new(HashSet::new()),
            sent: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub(crate) fn set_probe(&self, probe: Arc<ConcurrencyProbe>) {
        *self.probe.lock() = Some(probe);
    }

    pub(crate) fn set_capabilities(&self, capabilities: Value) {
        *self.capabilities.lock() = capabilities;
    }

    pub(crate) fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock() = tools;
    }

    pub(crate) fn set_response(&self, method: &str, result: Value) {
        self.responses.lock().insert(method.to_string(), result);
    }

    /// Stop answering `method`, even if it has a built-in reply
    pub(crate) fn hold(&self, method: &str) {
        self.held_methods.lock().insert(method.to_string());
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn sent(&self) -> Vec<JsonRpcMessage> {
        self.sent.lock().clone()
    }

    pub(crate) fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| m.method().map(str::to_string))
            .collect()
    }

    pub(crate) fn held(&self) -> Vec<JsonRpcRequest> {
        self.held.lock().clone()
    }

    /// Wait until `count` requests are being held
    pub(crate) async fn wait_for_held(&self, count: usize) -> Vec<JsonRpcRequest> {
        for _ in 0..500 {
            let held = self.held();
            if held.len() >= count {
                return held;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("expected {count} held requests, got {}", self.held().len());
    }

    pub(crate) fn respond(&self, id: &RequestId, result: Value) {
        self.emit_message(JsonRpcResponse::success(id.clone(), result).into());
    }

    pub(crate) fn emit_message(&self, message: JsonRpcMessage) {
        let handler = self.handlers.read().on_message.clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    pub(crate) fn emit_error(&self, error: MCPError) {
        let handler = self.handlers.read().on_error.clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    /// Simulate the remote side going away
    pub(crate) fn emit_close(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let handler = self.handlers.read().on_close.clone();
        if let Some(handler) = handler {
            handler(Some(reason.to_string()));
        }
    }

    fn reply_for(&self, request: &JsonRpcRequest) -> Option<Value> {
        if self.held_methods.lock().contains(&request.method) {
            return None;
        }
        match request.method.as_str() {
            "initialize" => Some(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": self.capabilities.lock().clone(),
                "serverInfo": {"name": "mock", "version": "1.0.0"}
            })),
            "tools/list" => Some(json!({"tools": self.tools.lock().clone()})),
            "ping" => Some(json!({})),
            method => self.responses.lock().get(method).cloned(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let probe = self.probe.lock().clone();
        if let Some(probe) = &probe {
            let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
            probe.max.fetch_max(now, Ordering::SeqCst);
        }
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(probe) = &probe {
            probe.current.fetch_sub(1, Ordering::SeqCst);
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MCPError::ConnectionFailed("simulated failure".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(MCPError::Transport("mock transport is not connected".to_string()));
        }
        self.sent.lock().push(message.clone());

        if let JsonRpcMessage::Request(request) = message {
            match self.reply_for(request) {
                Some(result) => self.respond(&request.id, result),
                None => self.held.lock().push(request.clone()),
            }
        }
        Ok(())
    }

    fn set_handlers(&self, handlers: TransportHandlers) {
        *self.handlers.write() = handlers;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }
}

/// Factory handing out [`MockTransport`]s, failing connects for chosen names
#[derive(Default)]
pub(crate) struct MockFactory {
    failing: HashSet<String>,
    connect_delay: Duration,
    probe: Arc<ConcurrencyProbe>,
    created: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing(mut self, name: &str) -> Self {
        self.failing.insert(name.to_string());
        self
    }

    pub(crate) fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub(crate) fn probe(&self) -> Arc<ConcurrencyProbe> {
        Arc::clone(&self.probe)
    }

    pub(crate) fn transport(&self, name: &str) -> Option<Arc<MockTransport>> {
        self.created.lock().get(name).cloned()
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, config: &ServerConfig) -> Result<ArcTransport> {
        let transport = MockTransport::new();
        transport.set_fail_connect(self.failing.contains(&config.name));
        transport.set_connect_delay(self.connect_delay);
        transport.set_probe(Arc::clone(&self.probe));
        self.created
            .lock()
            .insert(config.name.clone(), Arc::clone(&transport));
        Ok(transport)
    }
}
