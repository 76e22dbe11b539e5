//! A single MCP server connection
//!
//! Owns the transport, the status machine, request correlation and the
//! capability caches filled by discovery.

use crate::Result;
use crate::config::ServerConfig;
use crate::error::MCPError;
use crate::protocol::{
    self, JsonRpcError, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    RequestId,
};
use crate::transport::{ArcTransport, TransportHandlers, create_transport};
use crate::types::{
    MCPPromptDefinition, MCPPromptResult, MCPResourceContent, MCPResourceDefinition,
    MCPServerCapabilities, MCPServerInfo, MCPToolDefinition, MCPToolResult, ServerMetrics,
    ServerStatus, TransportKind,
};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// MCP protocol revision sent in `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Upper bound on `nextCursor` pages fetched per list during discovery
const MAX_DISCOVERY_PAGES: usize = 64;

/// Receives every status transition as `(server_name, new_status)`
pub type StatusListener = Arc<dyn Fn(&str, ServerStatus) + Send + Sync>;

/// Receives server notifications in transport order
pub type NotificationListener = Arc<dyn Fn(&str, &JsonRpcNotification) + Send + Sync>;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct PendingRequest {
    method: String,
    deadline: Instant,
    sender: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct ConnectionState {
    status: ServerStatus,
    server_info: Option<MCPServerInfo>,
    tools: Vec<MCPToolDefinition>,
    resources: Vec<MCPResourceDefinition>,
    prompts: Vec<MCPPromptDefinition>,
    metrics: ServerMetrics,
    last_error: Option<String>,
    /// Set by resource violations; suppresses reconnection
    fatal: bool,
}

struct ReconnectTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle to one MCP server; cheap to clone
#[derive(Clone)]
pub struct ServerConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    name: Arc<str>,
    config: ServerConfig,
    transport: ArcTransport,
    state: Mutex<ConnectionState>,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
    status_listener: RwLock<Option<StatusListener>>,
    notification_listeners: RwLock<Vec<NotificationListener>>,
    rate_limiter: Option<DirectRateLimiter>,
    lifecycle: tokio::sync::Mutex<()>,
    reconnect: Mutex<Option<ReconnectTask>>,
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("name", &self.inner.name)
            .field("transport", &self.inner.transport.kind())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Validate `config` and build a connection over the matching transport
    pub fn new(config: ServerConfig) -> Result<Self> {
        let name = config.name.clone();
        let transport = create_transport(&config).map_err(|e| e.for_server(name))?;
        Ok(Self::with_transport(config, transport))
    }

    /// Build a connection over an already constructed transport
    pub fn with_transport(config: ServerConfig, transport: ArcTransport) -> Self {
        // Evenly spaced, no burst
        let rate_limiter = config
            .rate_limit_rpm
            .and_then(NonZeroU32::new)
            .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm).allow_burst(NonZeroU32::MIN)));

        let inner = Arc::new(ConnectionInner {
            name: Arc::from(config.name.as_str()),
            config,
            transport,
            state: Mutex::new(ConnectionState::default()),
            pending: Mutex::new(HashMap::new()),
            status_listener: RwLock::new(None),
            notification_listeners: RwLock::new(Vec::new()),
            rate_limiter,
            lifecycle: tokio::sync::Mutex::new(()),
            reconnect: Mutex::new(None),
        });
        inner.install_handlers();

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.inner.name)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.inner.transport.kind()
    }

    pub fn status(&self) -> ServerStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ServerStatus::Connected
    }

    pub fn metrics(&self) -> ServerMetrics {
        self.inner.state.lock().metrics.clone()
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().last_error.clone()
    }

    pub fn server_info(&self) -> Option<MCPServerInfo> {
        self.inner.state.lock().server_info.clone()
    }

    pub fn capabilities(&self) -> Option<MCPServerCapabilities> {
        self.inner
            .state
            .lock()
            .server_info
            .as_ref()
            .map(|info| info.capabilities.clone())
    }

    /// Cached tools from the last discovery
    pub fn tools(&self) -> Vec<MCPToolDefinition> {
        self.inner.state.lock().tools.clone()
    }

    pub fn resources(&self) -> Vec<MCPResourceDefinition> {
        self.inner.state.lock().resources.clone()
    }

    pub fn prompts(&self) -> Vec<MCPPromptDefinition> {
        self.inner.state.lock().prompts.clone()
    }

    /// Out-of-band transport diagnostics, such as a stdio server's stderr
    pub fn diagnostics(&self) -> Option<String> {
        self.inner.transport.diagnostics()
    }

    /// Requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Replace the status listener slot
    pub fn set_status_listener(&self, listener: Option<StatusListener>) {
        *self.inner.status_listener.write() = listener;
    }

    /// Register a listener for server notifications
    pub fn on_notification(&self, listener: NotificationListener) {
        self.inner.notification_listeners.write().push(listener);
    }

    /// Connect and run the MCP handshake; a no-op when already connected
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        if inner.state.lock().status == ServerStatus::Connected {
            return Ok(());
        }
        inner.cancel_reconnect();
        inner.state.lock().fatal = false;
        inner.set_status(ServerStatus::Connecting);

        info!("Connecting to MCP server '{}'", inner.name);
        match inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let e = e.for_server(inner.name.as_ref());
                inner.fail(&e).await;
                Err(e)
            }
        }
    }

    /// Tear the connection down, rejecting anything still pending
    pub async fn disconnect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.stop_reconnect().await;
        let _lifecycle = inner.lifecycle.lock().await;

        let result = inner.transport.disconnect().await;
        inner.reject_all(|| MCPError::Transport("connection closed by client".to_string()));
        {
            let mut state = inner.state.lock();
            state.server_info = None;
            state.tools.clear();
            state.resources.clear();
            state.prompts.clear();
        }
        inner.set_status(ServerStatus::Disconnected);
        info!("Disconnected from MCP server '{}'", inner.name);

        result.map_err(|e| e.for_server(inner.name.as_ref()))
    }

    /// Send a request and wait for its response
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.inner.request(method, params, None).await
    }

    /// Like [`request`](Self::request), abandoning the wait when `cancel` fires
    pub async fn request_with_cancel(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.inner.request(method, params, Some(cancel)).await
    }

    /// Send a notification; no response is expected
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.inner.ensure_connected()?;
        self.inner
            .send_notification(method, params)
            .await
            .map_err(|e| e.for_server(self.name()))
    }

    /// Round-trip an MCP `ping`
    pub async fn ping(&self) -> Result<()> {
        self.request("ping", None).await.map(|_| ())
    }

    /// Call a tool after validating `arguments` against its cached input schema
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<MCPToolResult> {
        let schema = self
            .inner
            .state
            .lock()
            .tools
            .iter()
            .find(|tool| tool.name == tool_name)
            .map(|tool| tool.input_schema.clone())
            .ok_or_else(|| {
                MCPError::Validation(format!("unknown tool '{}'", tool_name)).for_server(self.name())
            })?;

        if let Err(problems) = crate::schema::validate_arguments(&arguments, &schema) {
            return Err(MCPError::Validation(format!(
                "invalid arguments for tool '{}': {}",
                tool_name,
                problems.join("; ")
            ))
            .for_server(self.name()));
        }

        debug!("Calling tool '{}' on server '{}'", tool_name, self.name());
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": tool_name, "arguments": arguments})),
            )
            .await?;

        serde_json::from_value(result).map_err(|e| {
            MCPError::Parse(format!("invalid tools/call result: {}", e)).for_server(self.name())
        })
    }

    /// Read one resource by URI
    pub async fn read_resource(&self, uri: &str) -> Result<Vec<MCPResourceContent>> {
        let mut result = self
            .request("resources/read", Some(json!({"uri": uri})))
            .await?;

        let contents = result.get_mut("contents").map(Value::take).unwrap_or_default();
        if contents.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(contents).map_err(|e| {
            MCPError::Parse(format!("invalid resources/read result: {}", e)).for_server(self.name())
        })
    }

    /// Render a prompt with the given arguments
    pub async fn get_prompt(&self, prompt_name: &str, arguments: Option<Value>) -> Result<MCPPromptResult> {
        let mut params = json!({"name": prompt_name});
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }

        let result = self.request("prompts/get", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| {
            MCPError::Parse(format!("invalid prompts/get result: {}", e)).for_server(self.name())
        })
    }

    /// Re-fetch the tool list into the cache
    pub async fn refresh_tools(&self) -> Result<Vec<MCPToolDefinition>> {
        self.inner.ensure_connected()?;
        let tools = self
            .inner
            .list_all::<MCPToolDefinition>("tools/list", "tools")
            .await
            .map_err(|e| e.for_server(self.name()))?;
        self.inner.state.lock().tools.clone_from(&tools);
        Ok(tools)
    }
}

/// Removes the pending entry when the request future finishes or is dropped
struct PendingGuard<'a> {
    pending: &'a Mutex<HashMap<RequestId, PendingRequest>>,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl ConnectionInner {
    fn install_handlers(self: &Arc<Self>) {
        let on_message = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let on_close = Arc::downgrade(self);

        self.transport.set_handlers(TransportHandlers {
            on_message: Some(Arc::new(move |message: JsonRpcMessage| {
                if let Some(inner) = on_message.upgrade() {
                    inner.handle_message(message);
                }
            })),
            on_error: Some(Arc::new(move |err: MCPError| {
                if let Some(inner) = on_error.upgrade() {
                    inner.handle_error(&err);
                }
            })),
            on_close: Some(Arc::new(move |reason: Option<String>| {
                if let Some(inner) = on_close.upgrade() {
                    inner.handle_close(reason);
                }
            })),
        });
    }

    fn set_status(&self, status: ServerStatus) {
        {
            let mut state = self.state.lock();
            if state.status == status {
                return;
            }
            debug!(
                "Server '{}' status {} -> {}",
                self.name, state.status, status
            );
            state.status = status;
        }

        let listener = self.status_listener.read().clone();
        if let Some(listener) = listener {
            listener(&self.name, status);
        }
    }

    fn record_error(&self, message: impl Into<String>) {
        self.state.lock().last_error = Some(message.into());
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state.lock().status == ServerStatus::Connected {
            Ok(())
        } else {
            Err(MCPError::NotConnected.for_server(self.name.as_ref()))
        }
    }

    /// Transport connect, handshake and discovery; status must already be set
    async fn establish(&self) -> Result<()> {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.transport.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(MCPError::ConnectionFailed(format!(
                    "connect timed out after {:?}",
                    timeout
                )));
            }
        }

        let info = self
            .initialize()
            .await
            .map_err(|e| MCPError::ConnectionFailed(format!("initialize handshake failed: {}", e)))?;
        self.send_notification("notifications/initialized", None)
            .await
            .map_err(|e| MCPError::ConnectionFailed(format!("initialize handshake failed: {}", e)))?;

        info!(
            "Connected to MCP server '{}' ({} {}, protocol {})",
            self.name, info.name, info.version, info.protocol_version
        );
        {
            let mut state = self.state.lock();
            state.server_info = Some(info);
            state.fatal = false;
            state.last_error = None;
        }
        self.set_status(ServerStatus::Connected);

        self.discover().await;
        Ok(())
    }

    async fn initialize(&self) -> Result<MCPServerInfo> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "mcp-rs",
                "version": env!("CARGO_PKG_VERSION")
            }
        });

        let result = self.send_request("initialize", Some(params), None).await?;

        let capabilities = result
            .get("capabilities")
            .cloned()
            .map(serde_json::from_value::<MCPServerCapabilities>)
            .transpose()?
            .unwrap_or_default();
        let server_info = result.get("serverInfo");

        Ok(MCPServerInfo {
            name: server_info
                .and_then(|v| v.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            version: server_info
                .and_then(|v| v.get("version"))
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            protocol_version: result
                .get("protocolVersion")
                .and_then(Value::as_str)
                .unwrap_or(PROTOCOL_VERSION)
                .to_string(),
            capabilities,
        })
    }

    /// Fill the caches for every capability the server advertised
    async fn discover(&self) {
        let capabilities = self
            .state
            .lock()
            .server_info
            .as_ref()
            .map(|info| info.capabilities.clone())
            .unwrap_or_default();

        if capabilities.tools.is_some() {
            match self.list_all::<MCPToolDefinition>("tools/list", "tools").await {
                Ok(tools) => {
                    info!("Discovered {} tools from '{}'", tools.len(), self.name);
                    self.state.lock().tools = tools;
                }
                Err(e) => warn!("Failed to list tools from '{}': {}", self.name, e),
            }
        }
        if capabilities.resources.is_some() {
            match self
                .list_all::<MCPResourceDefinition>("resources/list", "resources")
                .await
            {
                Ok(resources) => {
                    debug!("Discovered {} resources from '{}'", resources.len(), self.name);
                    self.state.lock().resources = resources;
                }
                Err(e) => warn!("Failed to list resources from '{}': {}", self.name, e),
            }
        }
        if capabilities.prompts.is_some() {
            match self
                .list_all::<MCPPromptDefinition>("prompts/list", "prompts")
                .await
            {
                Ok(prompts) => {
                    debug!("Discovered {} prompts from '{}'", prompts.len(), self.name);
                    self.state.lock().prompts = prompts;
                }
                Err(e) => warn!("Failed to list prompts from '{}': {}", self.name, e),
            }
        }
    }

    /// Follow `nextCursor` until the list is exhausted or the page cap is hit
    async fn list_all<T: DeserializeOwned>(&self, method: &str, key: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_DISCOVERY_PAGES {
            let params = cursor.as_ref().map(|c| json!({"cursor": c}));
            let mut result = self.send_request(method, params, None).await?;

            if let Some(page) = result.get_mut(key).map(Value::take) {
                if !page.is_null() {
                    items.extend(serde_json::from_value::<Vec<T>>(page)?);
                }
            }

            match result.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(items),
            }
        }

        warn!(
            "'{}' on '{}' still paginating after {} pages, keeping what was fetched",
            method, self.name, MAX_DISCOVERY_PAGES
        );
        Ok(items)
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        self.ensure_connected()?;
        self.send_request(method, params, cancel)
            .await
            .map_err(|e| e.for_server(self.name.as_ref()))
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Value> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let id = protocol::next_id();
        let timeout = self.config.timeout();
        let deadline = Instant::now() + timeout;
        let (sender, receiver) = oneshot::channel();

        self.pending.lock().insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                deadline,
                sender,
            },
        );
        let _entry = PendingGuard {
            pending: &self.pending,
            id: id.clone(),
        };

        self.state.lock().metrics.record_start();
        let started = std::time::Instant::now();

        let outcome = async {
            let message: JsonRpcMessage = JsonRpcRequest::new(id.clone(), method, params).into();
            self.transport.send(&message).await?;

            let response = async {
                match tokio::time::timeout_at(deadline, receiver).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(MCPError::Transport(
                        "response channel dropped".to_string(),
                    )),
                    Err(_) => Err(MCPError::Timeout {
                        method: method.to_string(),
                        timeout,
                    }),
                }
            };

            match cancel {
                Some(token) => tokio::select! {
                    () = token.cancelled() => Err(MCPError::Cancelled),
                    result = response => result,
                },
                None => response.await,
            }
        }
        .await;

        let mut state = self.state.lock();
        match &outcome {
            Ok(_) => state
                .metrics
                .record_success(started.elapsed().as_secs_f64() * 1000.0),
            Err(e) => {
                debug!("Request {} '{}' to '{}' failed: {}", id, method, self.name, e);
                state.metrics.record_failure();
            }
        }
        outcome
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message: JsonRpcMessage = JsonRpcNotification::new(method, params).into();
        self.transport.send(&message).await
    }

    fn reject_all(&self, make_error: impl Fn() -> MCPError) {
        let drained: Vec<(RequestId, PendingRequest)> = self.pending.lock().drain().collect();
        let now = Instant::now();
        for (id, request) in drained {
            debug!(
                "Rejecting pending request {} '{}' ({:?} before deadline)",
                id,
                request.method,
                request.deadline.saturating_duration_since(now)
            );
            let _ = request.sender.send(Err(make_error()));
        }
    }

    fn handle_message(self: &Arc<Self>, message: JsonRpcMessage) {
        match message {
            JsonRpcMessage::Response(response) => self.handle_response(response),
            JsonRpcMessage::Request(request) => self.handle_server_request(request),
            JsonRpcMessage::Notification(notification) => self.handle_notification(&notification),
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id.clone() else {
            warn!(
                "Server '{}' sent a response without id: {:?}",
                self.name, response.error
            );
            return;
        };

        let pending = self.pending.lock().remove(&id);
        match pending {
            Some(request) => {
                let _ = request.sender.send(response.into_result());
            }
            None => debug!(
                "Discarding late or unknown response {} from '{}'",
                id, self.name
            ),
        }
    }

    fn handle_server_request(self: &Arc<Self>, request: JsonRpcRequest) {
        let reply = if request.method == "ping" {
            JsonRpcResponse::success(request.id, json!({}))
        } else {
            debug!(
                "Server '{}' sent unsupported request '{}'",
                self.name, request.method
            );
            JsonRpcResponse::failure(
                Some(request.id),
                JsonRpcError::method_not_found(&request.method),
            )
        };

        let inner = Arc::clone(self);
        let reply: JsonRpcMessage = reply.into();
        tokio::spawn(async move {
            if let Err(e) = inner.transport.send(&reply).await {
                warn!("Failed to answer request from '{}': {}", inner.name, e);
            }
        });
    }

    fn handle_notification(self: &Arc<Self>, notification: &JsonRpcNotification) {
        if notification.method == "notifications/tools/list_changed" {
            let weak = Arc::downgrade(self);
            tokio::spawn(refresh_tool_cache(weak));
        }

        let listeners = self.notification_listeners.read().clone();
        for listener in listeners {
            listener(&self.name, notification);
        }
    }

    fn handle_error(&self, err: &MCPError) {
        if matches!(err.root(), MCPError::ResourceLimit(_)) {
            error!("Server '{}' exceeded its resource limits: {}", self.name, err);
            self.state.lock().fatal = true;
        } else {
            warn!("Transport error on '{}': {}", self.name, err);
        }
        self.record_error(err.to_string());
    }

    fn handle_close(self: &Arc<Self>, reason: Option<String>) {
        let reason = reason.unwrap_or_else(|| "transport closed".to_string());
        self.reject_all(|| MCPError::Transport(format!("connection closed: {}", reason)));

        let (status, fatal) = {
            let state = self.state.lock();
            (state.status, state.fatal)
        };
        if status != ServerStatus::Connected {
            debug!("Server '{}' transport closed while {}: {}", self.name, status, reason);
            return;
        }

        warn!("Server '{}' closed the connection: {}", self.name, reason);
        if fatal {
            self.set_status(ServerStatus::Error);
        } else if self.config.reconnect_on_error && self.config.max_reconnect_attempts > 0 {
            self.record_error(format!("connection closed: {}", reason));
            self.set_status(ServerStatus::Reconnecting);
            self.spawn_reconnect();
        } else {
            self.record_error(format!("connection closed: {}", reason));
            self.set_status(ServerStatus::Error);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let weak = Arc::downgrade(self);
        let policy = self.config.reconnect_policy();

        let handle = tokio::spawn(async move {
            let name = match weak.upgrade() {
                Some(inner) => Arc::clone(&inner.name),
                None => return,
            };
            let result = policy
                .execute_with(
                    &format!("reconnect '{}'", name),
                    |e: &MCPError| !matches!(e.root(), MCPError::Validation(_) | MCPError::Cancelled),
                    Some(&token),
                    || {
                        let weak = weak.clone();
                        async move {
                            match weak.upgrade() {
                                Some(inner) => inner.attempt_reconnect().await,
                                None => Err(MCPError::Cancelled),
                            }
                        }
                    },
                )
                .await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => info!("Reconnected to MCP server '{}'", name),
                Err(MCPError::Cancelled) => debug!("Reconnection of '{}' cancelled", name),
                Err(e) => {
                    error!("Giving up reconnecting to '{}': {}", name, e);
                    inner.record_error(e.to_string());
                    inner.set_status(ServerStatus::Error);
                }
            }
        });

        if let Some(previous) = self.reconnect.lock().replace(ReconnectTask { cancel, handle }) {
            previous.cancel.cancel();
            previous.handle.abort();
        }
    }

    async fn attempt_reconnect(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state.lock().status != ServerStatus::Reconnecting {
            return Err(MCPError::Cancelled);
        }

        let _ = self.transport.disconnect().await;
        match self.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Reconnect attempt for '{}' failed: {}", self.name, e);
                let _ = self.transport.disconnect().await;
                self.reject_all(|| MCPError::Transport("reconnect attempt failed".to_string()));
                Err(e)
            }
        }
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.reconnect.lock().take() {
            task.cancel.cancel();
            task.handle.abort();
        }
    }

    async fn stop_reconnect(&self) {
        let task = self.reconnect.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            task.handle.abort();
            let _ = task.handle.await;
        }
    }

    /// Failure path of an explicit connect
    async fn fail(&self, err: &MCPError) {
        error!("Failed to connect to MCP server '{}': {}", self.name, err);
        let message = err.to_string();
        self.reject_all(|| MCPError::ConnectionFailed(message.clone()));
        self.record_error(message.clone());
        self.set_status(ServerStatus::Error);
        if let Err(e) = self.transport.disconnect().await {
            debug!("Transport teardown for '{}' failed: {}", self.name, e);
        }
    }
}

async fn refresh_tool_cache(inner: Weak<ConnectionInner>) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    if inner.state.lock().status != ServerStatus::Connected {
        return;
    }
    match inner.list_all::<MCPToolDefinition>("tools/list", "tools").await {
        Ok(tools) => {
            info!("Tool list of '{}' changed, {} tools", inner.name, tools.len());
            inner.state.lock().tools = tools;
        }
        Err(e) => warn!("Failed to refresh tools of '{}': {}", inner.name, e),
    }
}
