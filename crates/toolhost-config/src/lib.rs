//! TOML configuration for toolhost.
//!
//! The settings file is looked up in order:
//! `--config` path > `$TOOLHOST_CONFIG_DIR/config.toml` > `~/.toolhost/config.toml`
//!
//! ```toml
//! [logging]
//! level = "info"
//!
//! [[servers]]
//! name = "filesystem"
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//! timeout_ms = 10000
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use toolhost_mcp::ServerConfig;

/// Name of the settings file inside the config directory.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable that overrides the config directory.
pub const CONFIG_DIR_ENV: &str = "TOOLHOST_CONFIG_DIR";

/// The default log level when neither the file nor `RUST_LOG` sets one.
pub const DEFAULT_LOG_LEVEL: &str = "warn";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config file parse error at {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct ToolhostConfig {
    pub servers: Vec<ServerConfig>,
    pub log_level: String,
    /// The file the settings came from (it may not exist).
    pub config_path: PathBuf,
}

/// Settings that can be read from a TOML config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
}

/// CLI overrides that take highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
}

impl ToolhostConfig {
    /// Load configuration, honoring an explicit `--config` path first.
    pub fn load(overrides: CliOverrides) -> Result<Self, ConfigError> {
        let path = overrides
            .config_path
            .unwrap_or_else(|| config_dir().join(CONFIG_FILE_NAME));
        Self::load_from(&path)
    }

    /// Load configuration from one file. A missing file yields no servers.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings = load_settings_file(path)?;
        validate(&settings)?;
        tracing::debug!(
            "Loaded {} MCP server(s) from {}",
            settings.servers.len(),
            path.display()
        );
        Ok(ToolhostConfig {
            servers: settings.servers,
            log_level: settings
                .logging
                .level
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            config_path: path.to_path_buf(),
        })
    }

    /// Servers with `enabled = true`.
    pub fn enabled_servers(&self) -> impl Iterator<Item = &ServerConfig> {
        self.servers.iter().filter(|s| s.enabled)
    }
}

/// Get the toolhost config directory path (~/.toolhost/).
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolhost")
}

/// Read and parse a TOML settings file. A missing file is not an error.
fn load_settings_file(path: &Path) -> Result<SettingsFile, ConfigError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config file at {}", path.display());
            return Ok(SettingsFile::default());
        }
        Err(source) => {
            return Err(ConfigError::Io {
                path: path.display().to_string(),
                source,
            });
        }
    };
    toml::from_str(&content).map_err(|e| ConfigError::Parse {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn validate(settings: &SettingsFile) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for server in &settings.servers {
        if server.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "servers.name".into(),
                message: "server name must not be empty".into(),
            });
        }
        if server.name.contains(toolhost_mcp::pool::QUALIFIER) {
            return Err(ConfigError::InvalidValue {
                key: format!("servers.{}.name", server.name),
                message: format!(
                    "server name must not contain '{}'",
                    toolhost_mcp::pool::QUALIFIER
                ),
            });
        }
        if server.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: format!("servers.{}.command", server.name),
                message: "command must not be empty".into(),
            });
        }
        if server.timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: format!("servers.{}.timeout_ms", server.name),
                message: "timeout must be greater than zero".into(),
            });
        }
        if !seen.insert(server.name.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: format!("servers.{}", server.name),
                message: "server is configured more than once".into(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_settings() {
        let settings = SettingsFile::default();
        assert!(settings.servers.is_empty());
        assert!(settings.logging.level.is_none());
    }

    #[test]
    fn test_missing_file_yields_no_servers() {
        let dir = tempfile::tempdir().unwrap();
        let config = ToolhostConfig::load(CliOverrides {
            config_path: Some(dir.path().join("absent.toml")),
        })
        .unwrap();
        assert!(config.servers.is_empty());
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
    }

    #[test]
    fn test_servers_parse() {
        let file = write_config(
            r#"
[logging]
level = "debug"

[[servers]]
name = "filesystem"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]

[[servers]]
name = "github"
command = "github-mcp"
enabled = false
timeout_ms = 5000
env = { GITHUB_TOKEN = "abc" }
"#,
        );
        let config = ToolhostConfig::load_from(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0].name, "filesystem");
        assert_eq!(config.servers[0].args.len(), 3);
        assert!(config.servers[0].enabled);
        assert_eq!(config.servers[1].timeout_ms, 5000);
        assert_eq!(config.servers[1].env["GITHUB_TOKEN"], "abc");

        let enabled: Vec<_> = config.enabled_servers().map(|s| s.name.as_str()).collect();
        assert_eq!(enabled, ["filesystem"]);
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        let file = write_config("[[servers]]\nname = \"broken\"\ncommand = ");
        let err = ToolhostConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_command_is_parse_error() {
        let file = write_config("[[servers]]\nname = \"nocommand\"\n");
        assert!(matches!(
            ToolhostConfig::load_from(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let file = write_config(
            r#"
[[servers]]
name = "fs"
command = "a"

[[servers]]
name = "fs"
command = "b"
"#,
        );
        match ToolhostConfig::load_from(file.path()) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "servers.fs"),
            other => panic!("Expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_invalid_server_values_rejected() {
        for body in [
            "name = \"\"\ncommand = \"x\"",
            "name = \"a.b\"\ncommand = \"x\"",
            "name = \"blank\"\ncommand = \"  \"",
            "name = \"zero\"\ncommand = \"x\"\ntimeout_ms = 0",
        ] {
            let file = write_config(&format!("[[servers]]\n{body}\n"));
            assert!(
                matches!(
                    ToolhostConfig::load_from(file.path()),
                    Err(ConfigError::InvalidValue { .. })
                ),
                "accepted: {body}"
            );
        }
    }
}
