//! `ServerPool` against real stub server processes.

use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolhost_mcp::{McpError, ServerConfig, ServerPool, Session, SessionStatus, SessionTimeouts};

const STUB: &str = env!("CARGO_BIN_EXE_stub-mcp-server");

fn stub(name: &str, tools: &str) -> ServerConfig {
    ServerConfig::new(name, STUB).with_args(["--tools", tools])
}

fn session(config: ServerConfig) -> Session {
    Session::with_timeouts(
        config,
        SessionTimeouts {
            handshake: Duration::from_millis(500),
            call: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        },
    )
}

#[tokio::test]
async fn one_bad_server_does_not_block_the_others() {
    let pool = ServerPool::from_sessions([
        session(stub("good", "echo")),
        session(ServerConfig::new("missing", "nonexistent_command_xyz123")),
        session(ServerConfig::new("mute", STUB).with_args(["--silent"])),
    ]);

    let started = Instant::now();
    let report = pool.start_enabled_servers(&CancellationToken::new()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(report.started, ["good"]);
    let failed: Vec<_> = report.failed.iter().map(|(name, _)| name.as_str()).collect();
    assert_eq!(failed.len(), 2);
    assert!(failed.contains(&"missing"));
    assert!(failed.contains(&"mute"));
    assert_eq!(pool.running_count(), 1);

    let states = pool.statuses();
    assert_eq!(states[0].status, SessionStatus::Running);
    assert_eq!(states[0].tool_count, 1);
    assert_eq!(states[1].status, SessionStatus::Error);
    assert!(matches!(
        states[1].last_error,
        Some(McpError::SpawnFailed { .. })
    ));
    assert_eq!(states[2].status, SessionStatus::Error);

    pool.stop_all().await;
    assert_eq!(pool.running_count(), 0);
}

#[tokio::test]
async fn tools_are_qualified_and_routable() {
    let pool = ServerPool::from_sessions([
        session(stub("alpha", "echo,fail")),
        session(stub("beta", "echo,explode")),
    ]);
    let report = pool.start_enabled_servers(&CancellationToken::new()).await;
    assert!(report.all_started());

    let names: Vec<_> = pool.tools().iter().map(|t| t.qualified_name()).collect();
    assert_eq!(
        names,
        ["alpha.echo", "alpha.fail", "beta.echo", "beta.explode"]
    );

    let result = pool
        .call_tool("beta.echo", json!({"via": "beta"}))
        .await
        .unwrap();
    assert_eq!(result.raw, json!({"via": "beta"}));

    // Bare names route when exactly one server has the tool.
    let result = pool.call_tool("fail", json!({})).await.unwrap();
    assert!(result.is_error);

    match pool.call_tool("echo", json!({})).await {
        Err(McpError::AmbiguousTool { servers, .. }) => assert_eq!(servers, ["alpha", "beta"]),
        other => panic!("Expected AmbiguousTool, got {other:?}"),
    }
    assert!(matches!(
        pool.call_tool("alpha.explode", json!({})).await,
        Err(McpError::ToolNotFound { .. })
    ));
    assert!(matches!(
        pool.call_tool("gamma.echo", json!({})).await,
        Err(McpError::UnknownServer { .. })
    ));

    pool.stop_all().await;
    assert!(pool.tools().is_empty());
}

#[tokio::test]
async fn cancelled_startup_stops_everything() {
    let pool = ServerPool::from_sessions([
        session(ServerConfig::new("mute", STUB).with_args(["--silent"])),
    ]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pool.start_enabled_servers(&cancel).await;
    assert!(report.started.is_empty());
    assert!(matches!(report.failed[0].1, McpError::Shutdown { .. }));
    assert_eq!(pool.statuses()[0].status, SessionStatus::Stopped);
}
