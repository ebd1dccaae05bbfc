//! Minimal stdio tool server.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and serves a handful
//! of tools that make transport behaviour easy to exercise:
//!
//! - `echo {text}`: returns `text`
//! - `sleep {millis}`: waits, then reports how long it slept
//! - `fail {message}`: tool-reported error
//! - `env {name}`: value of an environment variable
//! - `crash`: exits the process without answering
//!
//! Requests are handled concurrently, so responses may come back out of order.

use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing_subscriber::EnvFilter;

const PAGE_SIZE: usize = 3;

fn tools() -> Vec<Value> {
    let object = |properties: Value| json!({ "type": "object", "properties": properties });
    vec![
        json!({
            "name": "echo",
            "description": "Echo the given text back",
            "inputSchema": object(json!({ "text": { "type": "string" } })),
        }),
        json!({
            "name": "sleep",
            "description": "Sleep for the given number of milliseconds",
            "inputSchema": object(json!({ "millis": { "type": "integer" } })),
        }),
        json!({
            "name": "fail",
            "description": "Report a tool error",
            "inputSchema": object(json!({ "message": { "type": "string" } })),
        }),
        json!({
            "name": "env",
            "description": "Read an environment variable",
            "inputSchema": object(json!({ "name": { "type": "string" } })),
        }),
        json!({
            "name": "crash",
            "description": "Terminate the server process",
            "inputSchema": object(json!({})),
        }),
    ]
}

fn text(text: impl Into<String>, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text.into() }],
        "isError": is_error,
    })
}

fn list_tools(params: &Value) -> Value {
    let all = tools();
    let start = params
        .get("cursor")
        .and_then(Value::as_str)
        .and_then(|c| c.strip_prefix("page-"))
        .and_then(|n| n.parse::<usize>().ok())
        .map_or(0, |page| page.saturating_sub(1) * PAGE_SIZE);
    let end = (start + PAGE_SIZE).min(all.len());
    let page = all.get(start..end).map(<[Value]>::to_vec).unwrap_or_default();

    let mut result = json!({ "tools": page });
    if end < all.len() {
        result["nextCursor"] = json!(format!("page-{}", end / PAGE_SIZE + 1));
    }
    result
}

async fn call_tool(params: &Value) -> Result<Value, (i64, String)> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
    let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
    let arg = |key: &str| args.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    match name {
        "echo" => Ok(text(arg("text"), false)),
        "sleep" => {
            let millis = args.get("millis").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok(text(format!("slept {millis} ms"), false))
        }
        "fail" => Ok(text(arg("message"), true)),
        "env" => Ok(text(std::env::var(arg("name")).unwrap_or_default(), false)),
        "crash" => {
            tracing::warn!("Crashing on request");
            std::process::exit(3);
        }
        other => Err((-32602, format!("Unknown tool: {other}"))),
    }
}

async fn handle(message: Value) -> Option<Value> {
    let id = message.get("id").cloned()?;
    let method = message.get("method").and_then(Value::as_str).unwrap_or_default();
    let params = message.get("params").cloned().unwrap_or_else(|| json!({}));

    let outcome = match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": {} },
            "serverInfo": { "name": "mcp-echo-server", "version": env!("CARGO_PKG_VERSION") },
        })),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(list_tools(&params)),
        "tools/call" => call_tool(&params).await,
        other => Err((-32601, format!("Method not found: {other}"))),
    };

    Some(match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => {
            json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
    tracing::info!("mcp-echo-server ready");

    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let mut line = message.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = FramedRead::new(tokio::io::stdin(), LinesCodec::new());
    while let Some(line) = lines.next().await {
        let line = line?;
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed line");
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(response) = handle(message).await {
                let _ = tx.send(response);
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    Ok(())
}
