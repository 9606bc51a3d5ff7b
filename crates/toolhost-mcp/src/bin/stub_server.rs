//! Scripted stdio MCP server for tests and demos.
//!
//! Tools it can advertise:
//!
//! - `echo`: replies with its arguments as the result
//! - `fail`: replies with a tool-level error (`isError: true`)
//! - `explode`: replies with a JSON-RPC error object
//! - `sleep`: never replies
//! - `exit`: the process exits with code 3

use clap::Parser;
use rand::Rng;
use serde_json::{Value, json};
use std::io::Write as _;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use toolhost_mcp::jsonrpc::{self, JsonRpcRequest, Message, RequestId};

#[derive(Parser, Clone)]
#[command(name = "stub-mcp-server", about = "Scripted MCP server over stdio")]
struct Args {
    /// Tools advertised by tools/list
    #[arg(long, value_delimiter = ',', default_value = "echo,fail,explode,sleep,exit")]
    tools: Vec<String>,

    /// Tools advertised by every tools/list after the first
    #[arg(long, value_delimiter = ',')]
    tools_after_refresh: Option<Vec<String>>,

    /// Read requests but never answer any of them
    #[arg(long)]
    silent: bool,

    /// Answer initialize but never answer tools/list
    #[arg(long)]
    silent_tools_list: bool,

    /// Delay each tools/call reply by a random 0..=N milliseconds
    #[arg(long, default_value_t = 0)]
    max_delay_ms: u64,

    /// Echo integer ids back as floats (e.g. 3.0)
    #[arg(long)]
    float_ids: bool,

    /// Write a malformed line, an unmatched response, and a notification
    /// before every real response, and a burst of stderr chatter that
    /// includes a decoy response for the same id
    #[arg(long)]
    noise: bool,

    /// Write a line that is not valid UTF-8 to stdout and to stderr before
    /// every real response
    #[arg(long)]
    binary_noise: bool,

    /// Keep running after stdin is closed
    #[arg(long)]
    ignore_eof: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = out_rx.recv().await {
            if stdout.write_all(&line).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut list_calls = 0usize;
    while let Ok(Some(line)) = lines.next_line().await {
        eprintln!("stub-mcp-server <- {line}");
        if args.silent {
            continue;
        }
        let request = match jsonrpc::decode_line(&line) {
            Ok(Message::Request(request)) => request,
            Ok(_) => continue,
            Err(e) => {
                eprintln!("stub-mcp-server: bad frame: {e}");
                continue;
            }
        };

        let reply = match request.method.as_str() {
            "initialize" => Reply::Result(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "stub-mcp-server", "version": env!("CARGO_PKG_VERSION")}
            })),
            "tools/list" if args.silent_tools_list => continue,
            "tools/list" => {
                list_calls += 1;
                let names = match (&args.tools_after_refresh, list_calls) {
                    (Some(later), n) if n > 1 => later,
                    _ => &args.tools,
                };
                Reply::Result(json!({ "tools": names.iter().map(|n| tool_entry(n)).collect::<Vec<_>>() }))
            }
            "tools/call" => match call(&request) {
                Some(reply) => reply,
                None => continue,
            },
            other => Reply::Error(-32601, format!("Method not found: {other}")),
        };

        let delay = if request.method == "tools/call" && args.max_delay_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=args.max_delay_ms))
        } else {
            Duration::ZERO
        };
        let frames = render(&args, &request.id, reply);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for frame in frames {
                let _ = out_tx.send(frame);
            }
        });
    }

    if args.ignore_eof {
        std::future::pending::<()>().await;
    }
    drop(out_tx);
    let _ = writer.await;
}

enum Reply {
    Result(Value),
    Error(i64, String),
}

fn tool_entry(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("Stub tool '{name}'"),
        "inputSchema": {"type": "object"}
    })
}

fn call(request: &JsonRpcRequest) -> Option<Reply> {
    let params = request.params.clone().unwrap_or(Value::Null);
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
    match name {
        "echo" => Some(Reply::Result(arguments)),
        "fail" => Some(Reply::Result(json!({
            "content": [{"type": "text", "text": "tool failed"}],
            "isError": true
        }))),
        "explode" => Some(Reply::Error(-32000, "explode".to_string())),
        "sleep" => None,
        "exit" => std::process::exit(3),
        other => Some(Reply::Error(-32602, format!("Unknown tool: {other}"))),
    }
}

fn render(args: &Args, id: &RequestId, reply: Reply) -> Vec<Vec<u8>> {
    let id = match id {
        RequestId::Number(n) if args.float_ids => json!(*n as f64),
        other => json!(other),
    };
    let body = match reply {
        Reply::Result(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
        Reply::Error(code, message) => {
            json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
        }
    };

    let mut frames: Vec<Vec<u8>> = Vec::new();
    if args.noise {
        // Diagnostics only: a client must never read responses from stderr.
        let decoy = json!({"jsonrpc": "2.0", "id": id, "result": {"from": "stderr"}});
        eprintln!("{decoy}");
        for i in 0..100 {
            eprintln!("stub-mcp-server: log line {i}");
        }

        frames.push(b"this is not json".to_vec());
        frames.push(json!({"jsonrpc": "2.0", "id": 987654321, "result": {}}).to_string().into_bytes());
        frames.push(
            json!({"jsonrpc": "2.0", "method": "notifications/message", "params": {"level": "info"}})
                .to_string()
                .into_bytes(),
        );
        frames.push(Vec::new());
    }
    if args.binary_noise {
        let _ = std::io::stderr().write_all(b"\xff\xfe stderr garbage\n");
        frames.push(b"\xff\xfe garbage".to_vec());
    }
    frames.push(body.to_string().into_bytes());
    frames
}
