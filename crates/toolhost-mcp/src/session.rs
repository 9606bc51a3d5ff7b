//! MCP session: one supervised server process and its JSON-RPC traffic.
//!
//! Handles the MCP protocol handshake (initialize + initialized notification),
//! tool discovery (tools/list), and tool invocation (tools/call), and tracks
//! the server's lifecycle:
//!
//! ```text
//! Stopped -> Starting -> Running -> Error
//!                   \          \--> Stopped
//!                    \--> Error
//! ```
//!
//! Error and Stopped are both terminal until the next explicit [`Session::start`].

use crate::config::ServerConfig;
use crate::correlator::{Correlator, Outcome, PendingGuard};
use crate::error::McpError;
use crate::jsonrpc::{
    self, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message, RequestId,
};
use crate::process::{ExitCause, ProcessEvents, ServerProcess};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// MCP protocol version we support.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Name we introduce ourselves with in `initialize`.
pub const CLIENT_NAME: &str = "toolhost";

const METHOD_NOT_FOUND: i64 = -32601;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Stopped,
    Starting,
    Running,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Stopped => "stopped",
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Fixed durations a session waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimeouts {
    /// Bound on the `initialize` round trip.
    pub handshake: Duration,
    /// Bound on each `tools/list` and `tools/call` round trip.
    pub call: Duration,
    /// How long `stop` waits for a voluntary exit before killing.
    pub shutdown_grace: Duration,
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            call: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Information about a tool exposed by an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Identity a server reports during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// A content item in a tool result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ToolContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: Value,
    },
}

/// Result of calling a tool on an MCP server.
///
/// `is_error` means the tool ran and reported a failure of its own; that is
/// application data, unlike the `Err` side of [`Session::call_tool`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    /// The `result` object exactly as the server sent it.
    pub raw: Value,
    pub content: Vec<ToolContent>,
    pub is_error: bool,
}

impl ToolCallResult {
    fn from_value(raw: Value) -> Self {
        let is_error = raw
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let content = raw
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match serde_json::from_value(item.clone()) {
                        Ok(content) => Some(content),
                        Err(e) => {
                            tracing::debug!("Skipping unrecognized tool content: {e}");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            raw,
            content,
            is_error,
        }
    }

    /// All text content joined by newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| match c {
                ToolContent::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Deserialize)]
struct ToolsListResult {
    tools: Vec<ToolDescriptor>,
}

#[derive(Deserialize)]
struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    protocol_version: Option<String>,
    #[serde(default)]
    capabilities: Value,
    #[serde(default, rename = "serverInfo")]
    server_info: ServerInfo,
}

/// What the call path needs from a live process, cloned out from under a
/// short lock so callers never wait on `start` or `stop`.
#[derive(Clone)]
struct Link {
    writer: mpsc::Sender<String>,
    cancel: CancellationToken,
}

struct SessionInner {
    config: ServerConfig,
    timeouts: SessionTimeouts,
    status: RwLock<SessionStatus>,
    last_error: RwLock<Option<McpError>>,
    tools: RwLock<Vec<ToolDescriptor>>,
    server_info: RwLock<Option<ServerInfo>>,
    capabilities: RwLock<Option<Value>>,
    correlator: Correlator,
    next_id: AtomicI64,
    link: Mutex<Option<Link>>,
    pid: Mutex<Option<u32>>,
    /// Serializes start and stop; holds the process while it is alive.
    process: tokio::sync::Mutex<Option<ServerProcess>>,
}

/// Client for a single MCP server.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name())
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    /// Create a stopped session. The call timeout comes from
    /// `config.timeout_ms`; the others use their defaults.
    pub fn new(config: ServerConfig) -> Self {
        let timeouts = SessionTimeouts {
            call: config.call_timeout(),
            ..SessionTimeouts::default()
        };
        Self::with_timeouts(config, timeouts)
    }

    pub fn with_timeouts(config: ServerConfig, timeouts: SessionTimeouts) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                timeouts,
                status: RwLock::new(SessionStatus::Stopped),
                last_error: RwLock::new(None),
                tools: RwLock::new(Vec::new()),
                server_info: RwLock::new(None),
                capabilities: RwLock::new(None),
                correlator: Correlator::new(),
                next_id: AtomicI64::new(1),
                link: Mutex::new(None),
                pid: Mutex::new(None),
                process: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.read().unwrap()
    }

    /// The most recent fatal error (spawn, handshake, or unexpected exit).
    /// Cleared when the session is started again.
    pub fn last_error(&self) -> Option<McpError> {
        self.inner.last_error.read().unwrap().clone()
    }

    /// Snapshot of the tool catalog. Empty unless the session is running.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.inner.tools.read().unwrap().clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.inner.tools.read().unwrap().iter().any(|t| t.name == name)
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.inner.server_info.read().unwrap().clone()
    }

    pub fn capabilities(&self) -> Option<Value> {
        self.inner.capabilities.read().unwrap().clone()
    }

    /// Process id of the live child, if any.
    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap()
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Spawn the server, perform the handshake, and discover its tools.
    ///
    /// Allowed from Stopped or Error. Any failure leaves the session in Error
    /// with no process attached and `last_error` set.
    pub async fn start(&self) -> Result<(), McpError> {
        {
            let mut status = self.inner.status.write().unwrap();
            match *status {
                SessionStatus::Stopped | SessionStatus::Error => {
                    *status = SessionStatus::Starting;
                }
                current => {
                    return Err(McpError::AlreadyStarted {
                        server: self.name().to_string(),
                        status: current,
                    });
                }
            }
        }
        *self.inner.last_error.write().unwrap() = None;
        let mut process_slot = self.inner.process.lock().await;

        // Leftovers from a run that died on its own.
        if let Some(stale) = process_slot.take() {
            stale.shutdown(self.inner.timeouts.shutdown_grace).await;
        }

        tracing::info!(
            "Starting MCP server '{}': {} {}",
            self.name(),
            self.inner.config.command,
            self.inner.config.args.join(" ")
        );

        let cancel = CancellationToken::new();
        let events = Arc::new(EventsHandle(Arc::downgrade(&self.inner))) as Arc<dyn ProcessEvents>;
        let process = match ServerProcess::spawn(&self.inner.config, events, cancel.clone()) {
            Ok(process) => process,
            Err(e) => return Err(self.inner.fail(e)),
        };
        let Some(writer) = process.writer() else {
            return Err(self.inner.fail(McpError::Pipe {
                server: self.name().to_string(),
                stream: "stdin",
            }));
        };
        *self.inner.pid.lock().unwrap() = process.pid();
        *process_slot = Some(process);
        *self.inner.link.lock().unwrap() = Some(Link { writer, cancel });

        // A concurrent stop() may have landed before the link was installed.
        let result = if self.status() == SessionStatus::Starting {
            self.handshake().await
        } else {
            Err(self.inner.shutdown_error())
        };

        let result = result.and_then(|()| {
            let mut status = self.inner.status.write().unwrap();
            if *status == SessionStatus::Starting {
                *status = SessionStatus::Running;
                Ok(())
            } else {
                Err(self.inner.shutdown_error())
            }
        });

        match result {
            Ok(()) => {
                tracing::info!(
                    "MCP server '{}' running with {} tools",
                    self.name(),
                    self.inner.tools.read().unwrap().len()
                );
                Ok(())
            }
            Err(e) => {
                let err = McpError::Handshake {
                    server: self.name().to_string(),
                    source: Box::new(e),
                };
                // Record the failure before tearing down so the exit of our
                // own child is not mistaken for a crash.
                let err = self.inner.fail(err);
                self.inner.detach();
                if let Some(process) = process_slot.take() {
                    process.shutdown(self.inner.timeouts.shutdown_grace).await;
                }
                self.inner.correlator.cancel_all(err.clone());
                Err(err)
            }
        }
    }

    /// Stop the server. A no-op on a stopped session.
    ///
    /// Status flips to Stopped before anything else, so status queries never
    /// wait on the shutdown sequence. When this returns, every call that was
    /// waiting on the server has returned with [`McpError::Shutdown`].
    pub async fn stop(&self) {
        {
            let mut status = self.inner.status.write().unwrap();
            if *status == SessionStatus::Stopped {
                return;
            }
            *status = SessionStatus::Stopped;
        }
        tracing::info!("Stopping MCP server '{}'", self.name());

        self.inner.detach();
        let mut process_slot = self.inner.process.lock().await;
        if let Some(process) = process_slot.take() {
            let cause = process.shutdown(self.inner.timeouts.shutdown_grace).await;
            tracing::debug!(
                "MCP server '{}' stopped ({})",
                self.name(),
                cause.map_or_else(|| "exit status unknown".to_string(), |c| c.to_string())
            );
        }
        // Under the lock, so a start queued behind us keeps its own requests.
        self.inner.correlator.cancel_all(self.inner.shutdown_error());
    }

    /// Re-fetch the tool list and replace the catalog in one step.
    pub async fn refresh_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        self.ensure_running()?;
        self.fetch_tools(self.inner.timeouts.call).await
    }

    /// Call a tool on this server.
    ///
    /// Fails immediately, without touching the process, unless the session is
    /// running and the tool is in its catalog.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        self.ensure_running()?;
        if !self.has_tool(tool_name) {
            return Err(McpError::ToolNotFound {
                server: self.name().to_string(),
                tool: tool_name.to_string(),
            });
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self
            .request("tools/call", Some(params), self.inner.timeouts.call)
            .await?;
        Ok(ToolCallResult::from_value(result))
    }

    fn ensure_running(&self) -> Result<(), McpError> {
        match self.status() {
            SessionStatus::Running => Ok(()),
            status => Err(McpError::NotRunning {
                server: self.name().to_string(),
                status,
            }),
        }
    }

    /// `initialize`, `notifications/initialized` and `tools/list`, all within
    /// one handshake deadline.
    async fn handshake(&self) -> Result<(), McpError> {
        let deadline = Instant::now() + self.inner.timeouts.handshake;
        let init_params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION")
            }
        });
        let result = self
            .request("initialize", Some(init_params), self.inner.timeouts.handshake)
            .await?;
        let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
            McpError::Protocol(format!("Failed to parse initialize response: {e}"))
        })?;
        if let Some(version) = init.protocol_version.as_deref() {
            if version != PROTOCOL_VERSION {
                tracing::debug!(
                    "MCP server '{}' negotiated protocol {version} (we asked for {PROTOCOL_VERSION})",
                    self.name()
                );
            }
        }
        *self.inner.server_info.write().unwrap() = Some(init.server_info);
        *self.inner.capabilities.write().unwrap() = Some(init.capabilities);

        self.notify("notifications/initialized", None).await?;
        self.fetch_tools(deadline.saturating_duration_since(Instant::now()))
            .await?;
        Ok(())
    }

    async fn fetch_tools(&self, timeout: Duration) -> Result<Vec<ToolDescriptor>, McpError> {
        let result = self.request("tools/list", None, timeout).await?;
        let list: ToolsListResult = serde_json::from_value(result).map_err(|e| {
            McpError::Protocol(format!("Failed to parse tools/list response: {e}"))
        })?;
        *self.inner.tools.write().unwrap() = list.tools.clone();
        tracing::debug!(
            "MCP server '{}' listed {} tools",
            self.name(),
            list.tools.len()
        );
        Ok(list.tools)
    }

    /// Send a request and wait for its result, the timeout, or shutdown.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, McpError> {
        let Link { writer, cancel } = self.inner.link()?;
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let line = jsonrpc::encode(&JsonRpcRequest::new(id.clone(), method, params))?;

        let slot = self.inner.correlator.register(id.clone())?;
        let _pending = PendingGuard {
            correlator: &self.inner.correlator,
            id,
        };

        if writer.send(line).await.is_err() {
            return Err(self.inner.shutdown_error());
        }
        drop(writer);

        // A delivered outcome wins over a link cancelled in the same instant.
        let outcome = tokio::select! {
            biased;
            waited = tokio::time::timeout(timeout, slot) => match waited {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => return Err(self.inner.shutdown_error()),
                Err(_) => {
                    return Err(McpError::Timeout {
                        server: self.name().to_string(),
                        method: method.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            _ = cancel.cancelled() => return Err(self.inner.shutdown_error()),
        };

        match outcome {
            Outcome::Cancelled(reason) => Err(reason),
            Outcome::Response(resp) => {
                if let Some(err) = resp.error {
                    return Err(McpError::JsonRpc {
                        server: self.name().to_string(),
                        code: err.code,
                        message: err.message,
                    });
                }
                resp.result.ok_or_else(|| {
                    McpError::Protocol(format!(
                        "{method} response has neither result nor error"
                    ))
                })
            }
        }
    }

    /// Send a notification (fire-and-forget, no response expected).
    async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        let Link { writer, .. } = self.inner.link()?;
        let line = jsonrpc::encode(&JsonRpcNotification::new(method, params))?;
        writer
            .send(line)
            .await
            .map_err(|_| self.inner.shutdown_error())
    }
}

impl SessionInner {
    fn link(&self) -> Result<Link, McpError> {
        self.link
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| self.shutdown_error())
    }

    fn shutdown_error(&self) -> McpError {
        McpError::Shutdown {
            server: self.config.name.clone(),
        }
    }

    /// Cancel in-flight work and forget everything learned from the process.
    fn detach(&self) {
        if let Some(link) = self.link.lock().unwrap().take() {
            link.cancel.cancel();
        }
        *self.pid.lock().unwrap() = None;
        self.tools.write().unwrap().clear();
    }

    /// Record a fatal error and move to Error, unless a stop already won the
    /// race, in which case the session stays Stopped and nothing is recorded.
    fn fail(&self, err: McpError) -> McpError {
        {
            let mut status = self.status.write().unwrap();
            if *status == SessionStatus::Stopped {
                tracing::debug!("{err} (session was stopped)");
                return err;
            }
            *status = SessionStatus::Error;
        }
        tracing::error!("{err}");
        *self.last_error.write().unwrap() = Some(err.clone());
        err
    }

    fn handle_notification(&self, notification: JsonRpcNotification) {
        // Accepted but not acted on, including tools/list_changed.
        tracing::debug!(
            server = %self.config.name,
            "Ignoring notification {}",
            notification.method
        );
    }

    fn handle_server_request(&self, request: JsonRpcRequest) {
        let response = if request.method == "ping" {
            JsonRpcResponse::success(request.id, serde_json::json!({}))
        } else {
            tracing::debug!(
                server = %self.config.name,
                "Rejecting server request {}",
                request.method
            );
            JsonRpcResponse::failure(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            )
        };
        let Ok(link) = self.link() else {
            return;
        };
        match jsonrpc::encode(&response) {
            Ok(line) => {
                if link.writer.try_send(line).is_err() {
                    tracing::warn!(server = %self.config.name, "Dropping reply to server request");
                }
            }
            Err(e) => tracing::warn!("Failed to encode reply to server request: {e}"),
        }
    }

    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        match jsonrpc::decode_line(line) {
            Ok(Message::Response(resp)) => {
                self.correlator.resolve(resp);
            }
            Ok(Message::Notification(notification)) => self.handle_notification(notification),
            Ok(Message::Request(request)) => self.handle_server_request(request),
            Err(e) => {
                tracing::warn!(
                    server = %self.config.name,
                    "Discarding malformed line from MCP server: {e}: {line}"
                );
            }
        }
    }

    fn handle_exit(&self, cause: &ExitCause, requested: bool) {
        if requested {
            return;
        }
        let status = *self.status.read().unwrap();
        if !matches!(status, SessionStatus::Running | SessionStatus::Starting) {
            return;
        }
        let err = McpError::ProcessExited {
            server: self.config.name.clone(),
            cause: cause.to_string(),
        };
        let err = self.fail(err);
        self.correlator.cancel_all(err);
        self.detach();
    }
}

/// Routes process callbacks to the session without keeping it alive, so
/// dropping the last [`Session`] handle tears the process down.
struct EventsHandle(Weak<SessionInner>);

impl ProcessEvents for EventsHandle {
    fn on_stdout_line(&self, line: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_line(line);
        }
    }

    fn on_exit(&self, cause: &ExitCause, requested: bool) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_exit(cause, requested);
        }
    }
}
