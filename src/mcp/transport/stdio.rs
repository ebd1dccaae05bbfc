//! Subprocess transport: newline-delimited JSON-RPC over stdin/stdout.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{FramedRead, LinesCodec};

use super::rpc::{OutboundFrame, RpcChannel};
use super::{ConnectRequest, Transport, TransportKind, TransportSettings, arguments_object, ensure_open};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::types::{McpTool, ToolOutput};

/// A tool server running as a child process.
///
/// The child's stderr is forwarded to the log; it never touches the
/// protocol channel. When stdout ends, every in-flight call fails with
/// [`McpError::ConnectionLost`].
#[derive(Debug)]
pub struct StdioTransport {
    endpoint: String,
    rpc: Arc<RpcChannel>,
    child: Mutex<Option<Child>>,
    settings: TransportSettings,
}

impl StdioTransport {
    /// Spawn the command line in `request.endpoint` and run the handshake.
    ///
    /// The command line is split on whitespace; the first word is the
    /// program. Credential `env` entries are exported to the child.
    pub async fn connect(request: &ConnectRequest, settings: TransportSettings) -> McpResult<Self> {
        let mut words = request.endpoint.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| McpError::connect(&request.endpoint, "empty command line"))?;

        let mut cmd = Command::new(program);
        cmd.args(words)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &request.credentials.env {
            cmd.env(key, value);
        }

        tracing::info!(
            name: "mcp.stdio.spawn",
            server = %request.server_name,
            command = %request.endpoint,
            "Starting tool server process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::connect(&request.endpoint, e))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::connect(&request.endpoint, "missing stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::connect(&request.endpoint, "missing stdout"))?;
        let stderr = child.stderr.take();

        let (tx, rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(RpcChannel::new(request.server_name.clone(), tx));

        tokio::spawn(write_frames(stdin, rx, Arc::clone(&rpc)));
        tokio::spawn(read_frames(stdout, Arc::clone(&rpc)));
        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(stderr, request.server_name.clone()));
        }

        let transport = Self {
            endpoint: request.endpoint.clone(),
            rpc,
            child: Mutex::new(Some(child)),
            settings,
        };

        if let Err(e) = transport.rpc.initialize(settings.connect_timeout).await {
            tracing::error!(server = %request.server_name, error = %e, "Handshake failed");
            transport.disconnect().await;
            return Err(match e {
                McpError::ConnectionLost(_) => {
                    McpError::connect(&request.endpoint, "process exited during handshake")
                }
                other => other,
            });
        }

        Ok(transport)
    }
}

#[async_trait]
impl Transport for StdioTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.rpc.is_open()
    }

    async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        ensure_open(self.is_connected(), self.rpc.server())?;
        self.rpc.list_tools(self.settings.connect_timeout).await
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<ToolOutput> {
        self.rpc
            .call_tool(name, arguments_object(arguments), timeout)
            .await
    }

    async fn disconnect(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        self.rpc.stop_accepting();
        self.rpc.drain().await;
        // Dropping the writer closes the child's stdin.
        self.rpc.close();

        match tokio::time::timeout(self.settings.shutdown_grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(server = %self.rpc.server(), %status, "Tool server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.rpc.server(), error = %e, "Failed to reap tool server process");
            }
            Err(_) => {
                tracing::warn!(server = %self.rpc.server(), "Force-killing tool server process");
                if let Err(e) = child.kill().await {
                    tracing::warn!(server = %self.rpc.server(), error = %e, "Failed to kill tool server process");
                }
            }
        }
    }
}

/// Writer task: each JSON-RPC message is a single line, newline-terminated.
async fn write_frames(
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    rpc: Arc<RpcChannel>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_line(&mut stdin, frame.body.as_bytes()).await {
            tracing::warn!(server = %rpc.server(), error = %e, "Write to tool server failed");
            if let Some(id) = frame.id {
                rpc.fail(id, McpError::ConnectionLost(rpc.server().to_string()));
            }
            rpc.close();
            break;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> std::io::Result<()> {
    stdin.write_all(line).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

/// Reader task: route each stdout line; end of stream closes the channel.
async fn read_frames(stdout: ChildStdout, rpc: Arc<RpcChannel>) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                let line = line.trim();
                if !line.is_empty() {
                    rpc.handle_incoming(line);
                }
            }
            Err(e) => {
                tracing::warn!(server = %rpc.server(), error = %e, "Read from tool server failed");
                break;
            }
        }
    }
    tracing::debug!(server = %rpc.server(), "Tool server stdout closed");
    rpc.close();
}

async fn log_stderr(stderr: ChildStderr, server: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::warn!(target: "mcp_explorer::stdio", server = %server, "STDERR: {line}");
    }
}
