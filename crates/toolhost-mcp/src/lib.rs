//! MCP (Model Context Protocol) client runtime.
//!
//! Supports stdio-based MCP servers that communicate via newline-delimited
//! JSON-RPC 2.0 messages. Each configured server is spawned as a child process,
//! initialized with a handshake, and its tools are discovered and exposed
//! through a [`Session`]. A [`ServerPool`] owns one session per configured
//! server and routes `server.tool` calls to the right one.

pub mod config;
pub mod correlator;
pub mod error;
pub mod jsonrpc;
pub mod pool;
pub mod process;
pub mod session;

pub use config::ServerConfig;
pub use error::{DecodeError, McpError};
pub use jsonrpc::RequestId;
pub use pool::{QualifiedTool, ServerPool, ServerState, StartReport};
pub use process::ExitCause;
pub use session::{
    ServerInfo, Session, SessionStatus, SessionTimeouts, ToolCallResult, ToolContent,
    ToolDescriptor,
};
