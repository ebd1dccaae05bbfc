//! Transports to tool servers.
//!
//! A [`Transport`] is a live, handshaken channel to exactly one server. Two
//! implementations exist, [`StdioTransport`] (subprocess pipes) and
//! [`SseTransport`] (HTTP event stream plus POST channel). Callers hold them
//! as `Arc<dyn Transport>` and never look at which one they have; the only
//! place that branches on [`TransportKind`] is [`DefaultConnector`].

mod rpc;
pub mod sse;
pub mod stdio;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{McpError, McpResult};
use super::types::{McpTool, ToolOutput};

pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Physical channel used to reach a tool server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Subprocess speaking newline-delimited JSON-RPC on stdin/stdout.
    Stdio,
    /// HTTP server-sent event stream with a companion POST endpoint.
    Sse,
}

impl TransportKind {
    /// Guess the transport from an endpoint: URLs are event streams,
    /// everything else is a command line.
    #[must_use]
    pub fn infer(endpoint: &str) -> Self {
        let trimmed = endpoint.trim_start();
        if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
            Self::Sse
        } else {
            Self::Stdio
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdio" | "pipe" => Ok(Self::Stdio),
            "sse" | "http" | "event-stream" => Ok(Self::Sse),
            other => Err(format!("unsupported transport type: {other}")),
        }
    }
}

/// Secrets handed to a server at connect time.
///
/// `env` is exported to a subprocess; `headers` are sent with every HTTP
/// request of an event-stream connection.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Credentials {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.headers.is_empty()
    }
}

// Values stay out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Timing bounds shared by both transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    /// Bound on opening the channel, the handshake and catalog requests.
    pub connect_timeout: Duration,
    /// How long `disconnect` waits for a subprocess to exit after its stdin
    /// closes before killing it.
    pub shutdown_grace: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// Everything needed to open a transport to one server.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Registry name, used for log context only.
    pub server_name: String,
    pub kind: TransportKind,
    /// Command line (stdio) or URL (sse).
    pub endpoint: String,
    pub credentials: Credentials,
}

/// Uniform request/response interface over one channel to one tool server.
///
/// Implementations correlate responses by request id, so any number of
/// calls may be in flight at once.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    fn endpoint(&self) -> &str;

    /// False once the peer went away or `disconnect` was called.
    fn is_connected(&self) -> bool;

    /// Fetch the full tool catalog, following pagination cursors.
    async fn list_tools(&self) -> McpResult<Vec<McpTool>>;

    /// Invoke one tool. Expiry of `timeout` yields [`McpError::Timeout`];
    /// the call is then considered resolved and is not retried.
    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<ToolOutput>;

    /// Stop accepting calls, wait until every in-flight call has completed or
    /// hit its own timeout, then release the channel. Idempotent.
    async fn disconnect(&self);
}

/// Opens transports. The registry only ever talks to this seam.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open the channel and complete the protocol handshake.
    async fn connect(&self, request: &ConnectRequest) -> McpResult<Arc<dyn Transport>>;
}

/// Connector for real subprocess and HTTP servers.
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    settings: TransportSettings,
}

impl DefaultConnector {
    #[must_use]
    pub fn new(settings: TransportSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(&self, request: &ConnectRequest) -> McpResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match request.kind {
            TransportKind::Stdio => Arc::new(StdioTransport::connect(request, self.settings).await?),
            TransportKind::Sse => Arc::new(SseTransport::connect(request, self.settings).await?),
        };
        Ok(transport)
    }
}

/// Normalise tool arguments: the protocol requires an object.
pub(crate) fn arguments_object(arguments: Value) -> Value {
    match arguments {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}

/// Reject operations on a channel that is already gone.
pub(crate) fn ensure_open(connected: bool, server: &str) -> McpResult<()> {
    if connected {
        Ok(())
    } else {
        Err(McpError::ConnectionLost(server.to_string()))
    }
}
