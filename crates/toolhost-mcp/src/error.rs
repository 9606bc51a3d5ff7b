//! Error types for MCP operations.

use crate::session::SessionStatus;
use std::sync::Arc;
use thiserror::Error;

/// Errors from MCP server communication.
///
/// Cloneable so a single fatal error can be both returned to the caller and
/// kept as a session's `last_error`, and so shutdown can hand the same reason
/// to every parked caller.
#[derive(Debug, Clone, Error)]
pub enum McpError {
    #[error("Failed to spawn MCP server '{server}' ({command}): {source}")]
    SpawnFailed {
        server: String,
        command: String,
        source: Arc<std::io::Error>,
    },

    #[error("MCP server '{server}' has no {stream} pipe")]
    Pipe {
        server: String,
        stream: &'static str,
    },

    #[error("MCP server '{server}' failed its handshake: {source}")]
    Handshake {
        server: String,
        source: Box<McpError>,
    },

    #[error("MCP server '{server}' exited unexpectedly ({cause})")]
    ProcessExited { server: String, cause: String },

    #[error("MCP server '{server}' is already {status}")]
    AlreadyStarted {
        server: String,
        status: SessionStatus,
    },

    #[error("MCP server '{server}' is not running (status: {status})")]
    NotRunning {
        server: String,
        status: SessionStatus,
    },

    #[error("MCP server '{server}' has no tool named '{tool}'")]
    ToolNotFound { server: String, tool: String },

    #[error("No MCP server named '{server}'")]
    UnknownServer { server: String },

    #[error("No running MCP server provides a tool named '{tool}'")]
    UnknownTool { tool: String },

    #[error("Tool '{tool}' is provided by several servers ({}); qualify it as server.tool", servers.join(", "))]
    AmbiguousTool { tool: String, servers: Vec<String> },

    #[error("JSON-RPC error from '{server}' (code {code}): {message}")]
    JsonRpc {
        server: String,
        code: i64,
        message: String,
    },

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("MCP server '{server}' timed out after {timeout_ms}ms waiting for {method}")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    #[error("MCP server '{server}' is shutting down")]
    Shutdown { server: String },

    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl McpError {
    /// True for errors that mean the call never completed, as opposed to a
    /// server that answered with a JSON-RPC error.
    pub fn is_infrastructure(&self) -> bool {
        !matches!(self, McpError::JsonRpc { .. })
    }
}

impl From<serde_json::Error> for McpError {
    fn from(e: serde_json::Error) -> Self {
        McpError::Json(Arc::new(e))
    }
}

/// Why a single line read from a server could not be decoded.
///
/// These are never fatal: the reader logs them and moves on to the next line.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("unsupported id {0}")]
    InvalidId(serde_json::Value),

    #[error("method is not a string")]
    InvalidMethod,

    #[error("malformed error object: {0}")]
    InvalidErrorObject(serde_json::Error),

    #[error("frame has neither an id nor a method")]
    Unclassifiable,
}
