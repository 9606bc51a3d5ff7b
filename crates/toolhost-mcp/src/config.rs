//! Configuration types for MCP servers.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_timeout() -> u64 {
    30000
}

fn default_enabled() -> bool {
    true
}

/// Configuration for a single MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Unique server name; also the prefix of its qualified tool names.
    pub name: String,
    /// Command to run (e.g., "npx", "python").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// Disabled servers are configured but never started by the pool.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Environment variables to set for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Timeout for tool calls in milliseconds (default: 30000).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl ServerConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            enabled: true,
            env: HashMap::new(),
            timeout_ms: default_timeout(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Deserialize)]
    struct Servers {
        servers: Vec<ServerConfig>,
    }

    #[test]
    fn parse_single_server() {
        let toml_str = r#"
[[servers]]
name = "filesystem"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/home/user"]
"#;
        let config: Servers = toml::from_str(toml_str).unwrap();
        assert_eq!(config.servers.len(), 1);
        let fs = &config.servers[0];
        assert_eq!(fs.name, "filesystem");
        assert_eq!(fs.command, "npx");
        assert_eq!(fs.args.len(), 3);
        assert!(fs.enabled);
        assert_eq!(fs.timeout_ms, 30000);
    }

    #[test]
    fn parse_disabled_server_with_env() {
        let toml_str = r#"
[[servers]]
name = "github"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-github"]
enabled = false
timeout_ms = 60000
env = { GITHUB_TOKEN = "ghp_xxxx" }
"#;
        let config: Servers = toml::from_str(toml_str).unwrap();
        let gh = &config.servers[0];
        assert!(!gh.enabled);
        assert_eq!(gh.env["GITHUB_TOKEN"], "ghp_xxxx");
        assert_eq!(gh.call_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn builder_defaults_match_serde_defaults() {
        let built = ServerConfig::new("echo", "cat").with_args(["-u"]);
        let parsed: ServerConfig = toml::from_str(
            r#"
name = "echo"
command = "cat"
args = ["-u"]
"#,
        )
        .unwrap();
        assert_eq!(built, parsed);
        assert!(!built.disabled().enabled);
    }
}
