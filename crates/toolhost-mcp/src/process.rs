//! Process supervisor for a stdio MCP server.
//!
//! Spawns the child with all three standard streams piped and runs four
//! background tasks around it:
//!
//! - writer: drains an outgoing line channel into the child's stdin
//! - stdout reader: hands each line to [`ProcessEvents::on_stdout_line`]
//! - stderr reader: logs each line, never parses it
//! - exit watcher: owns the [`Child`], reports its exit via [`ProcessEvents::on_exit`]
//!
//! Every task except the exit watcher selects on the cancellation token and
//! stops within one read iteration of it firing. The writer dropping stdin on
//! cancellation is what asks the child to exit.

use crate::config::ServerConfig;
use crate::error::McpError;
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long to wait for a force-killed child to be reaped.
const KILL_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Callbacks from the supervisor's background tasks.
pub trait ProcessEvents: Send + Sync + 'static {
    /// One line read from the child's stdout, without its line terminator.
    fn on_stdout_line(&self, line: &str);

    /// The child exited. `requested` is true when the exit followed a
    /// shutdown request (cancellation or kill) rather than happening on its own.
    fn on_exit(&self, cause: &ExitCause, requested: bool);
}

/// How a child process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    Code(i32),
    Signal(i32),
    Unknown(String),
}

impl From<ExitStatus> for ExitCause {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitCause::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitCause::Signal(signal);
            }
        }
        ExitCause::Unknown(status.to_string())
    }
}

impl fmt::Display for ExitCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCause::Code(code) => write!(f, "exit code {code}"),
            ExitCause::Signal(signal) => write!(f, "killed by signal {signal}"),
            ExitCause::Unknown(detail) => write!(f, "{detail}"),
        }
    }
}

/// A running MCP server process and its background tasks.
pub struct ServerProcess {
    server: String,
    pid: Option<u32>,
    write_tx: Option<mpsc::Sender<String>>,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ExitCause>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerProcess {
    /// Spawn the configured command and start the background tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &ServerConfig,
        events: Arc<dyn ProcessEvents>,
        cancel: CancellationToken,
    ) -> Result<Self, McpError> {
        let server = config.name.clone();
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            server: server.clone(),
            command: config.command.clone(),
            source: Arc::new(e),
        })?;

        let pipe_error = |stream| McpError::Pipe {
            server: server.clone(),
            stream,
        };
        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;
        let pid = child.id();

        tracing::debug!(server = %server, pid = ?pid, "Spawned {}", config.command);

        let (write_tx, write_rx) = mpsc::channel::<String>(64);
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);

        let tasks = vec![
            tokio::spawn(write_stdin(server.clone(), stdin, write_rx, cancel.clone())),
            tokio::spawn(read_lines(
                server.clone(),
                stdout,
                cancel.clone(),
                LineSink::Events(Arc::clone(&events)),
            )),
            tokio::spawn(read_lines(
                server.clone(),
                stderr,
                cancel.clone(),
                LineSink::Log,
            )),
            tokio::spawn(watch_exit(
                server.clone(),
                child,
                kill_rx,
                exit_tx,
                cancel.clone(),
                events,
            )),
        ];

        Ok(Self {
            server,
            pid,
            write_tx: Some(write_tx),
            kill_tx: Some(kill_tx),
            exit_rx,
            cancel,
            tasks,
        })
    }

    /// OS process id of the child, if it is known.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// A handle for queueing outgoing lines to the child's stdin.
    pub fn writer(&self) -> Option<mpsc::Sender<String>> {
        self.write_tx.clone()
    }

    /// The exit cause, once the child has exited.
    pub fn exit_cause(&self) -> Option<ExitCause> {
        self.exit_rx.borrow().clone()
    }

    /// Stop the process: cancel the background tasks (closing stdin), wait up
    /// to `grace` for a voluntary exit, force-kill after that, then join every
    /// task.
    pub async fn shutdown(mut self, grace: Duration) -> Option<ExitCause> {
        self.cancel.cancel();
        drop(self.write_tx.take());

        let mut exit_rx = self.exit_rx.clone();
        let exited = tokio::time::timeout(grace, wait_for_exit(&mut exit_rx))
            .await
            .is_ok();
        if !exited {
            tracing::warn!(
                server = %self.server,
                "MCP server did not exit within {}ms, killing it",
                grace.as_millis()
            );
            if let Some(kill) = self.kill_tx.take() {
                let _ = kill.send(());
            }
            if tokio::time::timeout(KILL_REAP_TIMEOUT, wait_for_exit(&mut exit_rx))
                .await
                .is_err()
            {
                tracing::error!(server = %self.server, "MCP server could not be reaped after kill");
            }
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!(server = %self.server, "MCP background task panicked: {e}");
                }
            }
        }

        self.exit_cause()
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        // Dropped without `shutdown`: make sure the child does not outlive us.
        self.cancel.cancel();
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
    }
}

async fn wait_for_exit(exit_rx: &mut watch::Receiver<Option<ExitCause>>) {
    // A closed channel means the watcher is gone, so the child is too.
    let _ = exit_rx.wait_for(Option::is_some).await;
}

async fn write_stdin(
    server: String,
    mut stdin: ChildStdin,
    mut write_rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            line = write_rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };
        let written = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = written.await {
            tracing::warn!(server = %server, "Failed to write to MCP server stdin: {e}");
            break;
        }
    }
    tracing::debug!(server = %server, "Closing MCP server stdin");
}

enum LineSink {
    Events(Arc<dyn ProcessEvents>),
    Log,
}

/// Reads raw lines; an undecodable line is skipped. Only cancellation, EOF or
/// an I/O error ends the loop, since the child must always have a reader.
async fn read_lines<R>(server: String, stream: R, cancel: CancellationToken, sink: LineSink)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            read = reader.read_until(b'\n', &mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(_) => {
                let line = trim_line_end(&buf);
                match &sink {
                    LineSink::Events(events) => match std::str::from_utf8(line) {
                        Ok(line) => events.on_stdout_line(line),
                        Err(e) => tracing::warn!(
                            server = %server,
                            "Discarding non-UTF-8 line from MCP server: {e}"
                        ),
                    },
                    LineSink::Log => {
                        tracing::debug!(server = %server, "stderr: {}", String::from_utf8_lossy(line))
                    }
                }
            }
            Err(e) => {
                tracing::warn!(server = %server, "Failed to read from MCP server: {e}");
                break;
            }
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

async fn watch_exit(
    server: String,
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ExitCause>>,
    cancel: CancellationToken,
    events: Arc<dyn ProcessEvents>,
) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill_rx => None,
    };
    let killed = exited.is_none();
    let status = match exited {
        Some(status) => status,
        None => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(server = %server, "Failed to kill MCP server: {e}");
            }
            child.wait().await
        }
    };
    let cause = match status {
        Ok(status) => ExitCause::from(status),
        Err(e) => ExitCause::Unknown(format!("wait failed: {e}")),
    };
    let requested = killed || cancel.is_cancelled();
    tracing::debug!(server = %server, requested, "MCP server exited: {cause}");
    exit_tx.send_replace(Some(cause.clone()));
    events.on_exit(&cause, requested);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
        exits: Mutex<Vec<(ExitCause, bool)>>,
    }

    impl ProcessEvents for Recorder {
        fn on_stdout_line(&self, line: &str) {
            self.lines.lock().unwrap().push(line.to_string());
        }

        fn on_exit(&self, cause: &ExitCause, requested: bool) {
            self.exits.lock().unwrap().push((cause.clone(), requested));
        }
    }

    fn spawn(
        command: &str,
        args: &[&str],
        recorder: &Arc<Recorder>,
    ) -> Result<ServerProcess, McpError> {
        let config = ServerConfig::new("test", command).with_args(args.iter().copied());
        ServerProcess::spawn(
            &config,
            Arc::clone(recorder) as Arc<dyn ProcessEvents>,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn cat_echoes_lines_and_exits_on_stdin_close() {
        let recorder = Arc::new(Recorder::default());
        let process = spawn("cat", &[], &recorder).unwrap();
        assert!(process.pid().is_some());

        let writer = process.writer().unwrap();
        writer.send("hello".to_string()).await.unwrap();
        writer.send("world".to_string()).await.unwrap();
        drop(writer);

        for _ in 0..100 {
            if recorder.lines.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*recorder.lines.lock().unwrap(), vec!["hello", "world"]);

        let cause = process.shutdown(Duration::from_secs(5)).await;
        assert_eq!(cause, Some(ExitCause::Code(0)));
        assert_eq!(
            *recorder.exits.lock().unwrap(),
            vec![(ExitCause::Code(0), true)]
        );
    }

    #[tokio::test]
    async fn spawn_nonexistent_command_fails() {
        let recorder = Arc::new(Recorder::default());
        match spawn("this_command_does_not_exist_xyz123", &[], &recorder) {
            Err(McpError::SpawnFailed { command, .. }) => {
                assert_eq!(command, "this_command_does_not_exist_xyz123");
            }
            Err(other) => panic!("Expected SpawnFailed, got: {other:?}"),
            Ok(_) => panic!("Expected error, got Ok"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_ignoring_stdin_is_killed_after_grace() {
        // `sleep` never reads stdin, so closing it does not make it exit.
        let recorder = Arc::new(Recorder::default());
        let process = spawn("sleep", &["30"], &recorder).unwrap();

        let started = std::time::Instant::now();
        let cause = process.shutdown(Duration::from_millis(200)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(cause, Some(ExitCause::Signal(_))));
        assert!(recorder.exits.lock().unwrap()[0].1);
    }

    #[tokio::test]
    async fn voluntary_exit_is_reported_as_unrequested() {
        let recorder = Arc::new(Recorder::default());
        let process = spawn("sh", &["-c", "exit 3"], &recorder).unwrap();

        for _ in 0..100 {
            if !recorder.exits.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(process.exit_cause(), Some(ExitCause::Code(3)));
        assert_eq!(
            *recorder.exits.lock().unwrap(),
            vec![(ExitCause::Code(3), false)]
        );
        process.shutdown(Duration::from_secs(1)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_utf8_lines_are_skipped_on_both_streams() {
        let recorder = Arc::new(Recorder::default());
        let script = r"printf '\377\376 garbage\n'; printf '\377\376\n' >&2; sleep 0.2; \
                       echo 'more log' >&2; printf 'ok\r\n'";
        let process = spawn("sh", &["-c", script], &recorder).unwrap();

        for _ in 0..100 {
            let exited = !recorder.exits.lock().unwrap().is_empty();
            if exited && !recorder.lines.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(*recorder.lines.lock().unwrap(), vec!["ok"]);
        // A stderr reader that quit early would get the child killed by SIGPIPE.
        assert_eq!(
            *recorder.exits.lock().unwrap(),
            vec![(ExitCause::Code(0), false)]
        );
        process.shutdown(Duration::from_secs(1)).await;
    }

    #[test]
    fn line_endings_are_trimmed() {
        assert_eq!(trim_line_end(b"abc\r\n"), b"abc");
        assert_eq!(trim_line_end(b"abc\n"), b"abc");
        assert_eq!(trim_line_end(b"abc"), b"abc");
    }

    #[test]
    fn exit_cause_display() {
        assert_eq!(ExitCause::Code(1).to_string(), "exit code 1");
        assert_eq!(ExitCause::Signal(9).to_string(), "killed by signal 9");
    }
}
