//! Server pool: one session per configured MCP server.

use crate::config::ServerConfig;
use crate::error::McpError;
use crate::session::{Session, SessionStatus, ToolCallResult, ToolDescriptor};
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Separator between server and tool in a qualified tool name.
pub const QUALIFIER: char = '.';

/// A tool together with the server that provides it.
#[derive(Debug, Clone, PartialEq)]
pub struct QualifiedTool {
    pub server: String,
    pub tool: ToolDescriptor,
}

impl QualifiedTool {
    /// `server.tool`
    pub fn qualified_name(&self) -> String {
        format!("{}{QUALIFIER}{}", self.server, self.tool.name)
    }
}

/// Outcome of [`ServerPool::start_enabled_servers`].
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, McpError)>,
}

impl StartReport {
    pub fn all_started(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Point-in-time view of one server.
#[derive(Debug, Clone)]
pub struct ServerState {
    pub name: String,
    pub enabled: bool,
    pub status: SessionStatus,
    pub tool_count: usize,
    pub last_error: Option<McpError>,
}

/// Manages sessions for multiple MCP servers, one per configured server.
#[derive(Debug, Default)]
pub struct ServerPool {
    sessions: Vec<Session>,
}

impl ServerPool {
    /// Create a pool with one stopped session per config, in order. A later
    /// config with a name already seen replaces the earlier one.
    pub fn new(configs: impl IntoIterator<Item = ServerConfig>) -> Self {
        Self::from_sessions(configs.into_iter().map(Session::new))
    }

    /// Build a pool from pre-made sessions (e.g. with custom timeouts).
    pub fn from_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let mut pool = Self::default();
        for session in sessions {
            if let Some(existing) = pool.sessions.iter_mut().find(|s| s.name() == session.name()) {
                tracing::warn!(
                    "MCP server '{}' is configured more than once; using the last entry",
                    session.name()
                );
                *existing = session;
            } else {
                pool.sessions.push(session);
            }
        }
        pool
    }

    /// Start every enabled server concurrently.
    ///
    /// Servers that fail to start are logged and reported; the others carry
    /// on. If `cancel` fires first, every enabled server is stopped and the
    /// ones that had not finished starting are reported as failed.
    pub async fn start_enabled_servers(&self, cancel: &CancellationToken) -> StartReport {
        let enabled: Vec<&Session> = self
            .sessions
            .iter()
            .filter(|s| s.config().enabled)
            .collect();
        let starts = join_all(enabled.iter().map(|session| async move {
            (session.name().to_string(), session.start().await)
        }));

        let results = tokio::select! {
            results = starts => results,
            _ = cancel.cancelled() => {
                tracing::warn!("Startup cancelled; stopping MCP servers");
                join_all(enabled.iter().map(|s| s.stop())).await;
                let failed = enabled
                    .iter()
                    .map(|s| {
                        (
                            s.name().to_string(),
                            McpError::Shutdown { server: s.name().to_string() },
                        )
                    })
                    .collect();
                return StartReport { started: Vec::new(), failed };
            }
        };

        let mut report = StartReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => {
                    let count = self.session(&name).map_or(0, |s| s.tools().len());
                    tracing::info!("MCP server '{}' started ({} tools)", name, count);
                    report.started.push(name);
                }
                Err(e) => {
                    tracing::warn!("Failed to start MCP server '{}': {}", name, e);
                    report.failed.push((name, e));
                }
            }
        }
        report
    }

    /// Stop every server.
    pub async fn stop_all(&self) {
        join_all(self.sessions.iter().map(|s| s.stop())).await;
    }

    pub fn session(&self, name: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.name() == name)
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// All tools from all running servers, in configuration order.
    pub fn tools(&self) -> Vec<QualifiedTool> {
        self.sessions
            .iter()
            .flat_map(|session| {
                session.tools().into_iter().map(|tool| QualifiedTool {
                    server: session.name().to_string(),
                    tool,
                })
            })
            .collect()
    }

    /// Call a tool by `server.tool` name, or by bare tool name when exactly
    /// one running server provides it.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let (session, tool) = self.resolve(name)?;
        session.call_tool(tool, arguments).await
    }

    /// Find the session that owns `name` and the tool name to send it.
    pub fn resolve<'a>(&'a self, name: &'a str) -> Result<(&'a Session, &'a str), McpError> {
        let qualified = name.split_once(QUALIFIER);
        if let Some((server, tool)) = qualified {
            if let Some(session) = self.session(server) {
                return Ok((session, tool));
            }
        }

        // Tool names may themselves contain the separator.
        let owners: Vec<&Session> = self.sessions.iter().filter(|s| s.has_tool(name)).collect();
        match owners.as_slice() {
            [session] => Ok((*session, name)),
            [] => match qualified {
                Some((server, _)) => Err(McpError::UnknownServer {
                    server: server.to_string(),
                }),
                None => Err(McpError::UnknownTool {
                    tool: name.to_string(),
                }),
            },
            many => Err(McpError::AmbiguousTool {
                tool: name.to_string(),
                servers: many.iter().map(|s| s.name().to_string()).collect(),
            }),
        }
    }

    /// Status of every configured server, in configuration order.
    pub fn statuses(&self) -> Vec<ServerState> {
        self.sessions
            .iter()
            .map(|s| ServerState {
                name: s.name().to_string(),
                enabled: s.config().enabled,
                status: s.status(),
                tool_count: s.tools().len(),
                last_error: s.last_error(),
            })
            .collect()
    }

    /// Number of running servers.
    pub fn running_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|s| s.status() == SessionStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_config_starts_no_servers() {
        let pool = ServerPool::new(Vec::new());
        let report = pool.start_enabled_servers(&CancellationToken::new()).await;
        assert!(report.started.is_empty());
        assert!(report.all_started());
        assert_eq!(pool.running_count(), 0);
        assert!(pool.tools().is_empty());
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn failed_server_is_reported() {
        let pool = ServerPool::new(vec![ServerConfig::new(
            "bad",
            "nonexistent_command_xyz123",
        )]);
        let report = pool.start_enabled_servers(&CancellationToken::new()).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert!(matches!(report.failed[0].1, McpError::SpawnFailed { .. }));

        let states = pool.statuses();
        assert_eq!(states[0].status, SessionStatus::Error);
        assert!(states[0].last_error.is_some());
        pool.stop_all().await;
    }

    #[tokio::test]
    async fn disabled_servers_are_not_started() {
        let pool = ServerPool::new(vec![
            ServerConfig::new("off", "nonexistent_command_xyz123").disabled(),
        ]);
        let report = pool.start_enabled_servers(&CancellationToken::new()).await;
        assert!(report.started.is_empty());
        assert!(report.failed.is_empty());
        assert_eq!(pool.statuses()[0].status, SessionStatus::Stopped);
    }

    #[test]
    fn duplicate_names_keep_the_last_entry() {
        let pool = ServerPool::new(vec![
            ServerConfig::new("fs", "first"),
            ServerConfig::new("git", "git-server"),
            ServerConfig::new("fs", "second"),
        ]);
        assert_eq!(pool.sessions().len(), 2);
        assert_eq!(pool.session("fs").unwrap().config().command, "second");
        assert_eq!(pool.sessions()[0].name(), "fs");
    }

    #[test]
    fn resolve_errors_without_running_servers() {
        let pool = ServerPool::new(vec![ServerConfig::new("fs", "cat")]);
        assert!(matches!(
            pool.resolve("nope.read"),
            Err(McpError::UnknownServer { server }) if server == "nope"
        ));
        assert!(matches!(
            pool.resolve("read"),
            Err(McpError::UnknownTool { tool }) if tool == "read"
        ));
        let (session, tool) = pool.resolve("fs.read").unwrap();
        assert_eq!(session.name(), "fs");
        assert_eq!(tool, "read");
    }

    #[test]
    fn qualified_name_format() {
        let tool = QualifiedTool {
            server: "github".to_string(),
            tool: ToolDescriptor {
                name: "list_repos".to_string(),
                description: String::new(),
                input_schema: serde_json::json!({}),
            },
        };
        assert_eq!(tool.qualified_name(), "github.list_repos");
    }
}
