//! Event-stream transport: server-sent events down, HTTP POST up.
//!
//! `GET <url>` opens a `text/event-stream`. The server's first `endpoint`
//! event names the URL that accepts JSON-RPC messages by POST; responses
//! come back on the stream as `message` events.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use super::rpc::{OutboundFrame, RpcChannel};
use super::{
    ConnectRequest, Credentials, Transport, TransportKind, TransportSettings, arguments_object,
    ensure_open,
};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::types::{McpTool, ToolOutput};

/// A tool server reached over HTTP server-sent events.
#[derive(Debug)]
pub struct SseTransport {
    endpoint: String,
    rpc: Arc<RpcChannel>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    settings: TransportSettings,
}

impl SseTransport {
    /// Open the event stream, wait for the `endpoint` event and run the handshake.
    pub async fn connect(request: &ConnectRequest, settings: TransportSettings) -> McpResult<Self> {
        let endpoint = request.endpoint.trim();
        let stream_url =
            Url::parse(endpoint).map_err(|e| McpError::connect(endpoint, e))?;
        let http = reqwest::Client::builder()
            .default_headers(header_map(&request.credentials).map_err(|e| McpError::connect(endpoint, e))?)
            .build()
            .map_err(|e| McpError::connect(endpoint, e))?;

        tracing::info!(
            name: "mcp.sse.open",
            server = %request.server_name,
            url = %stream_url,
            "Opening event stream"
        );

        let response = tokio::time::timeout(
            settings.connect_timeout,
            http.get(stream_url.clone())
                .header(ACCEPT, "text/event-stream")
                .send(),
        )
        .await
        .map_err(|elapsed| McpError::connect(endpoint, format!("opening event stream: {elapsed}")))?
        .and_then(reqwest::Response::error_for_status)
        .map_err(|e| McpError::connect(endpoint, e))?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let (tx, rx) = mpsc::unbounded_channel();
        let rpc = Arc::new(RpcChannel::new(request.server_name.clone(), tx));
        let reader = tokio::spawn(read_events(response, Arc::clone(&rpc), endpoint_tx));

        let announced = match tokio::time::timeout(settings.connect_timeout, endpoint_rx).await {
            Ok(Ok(path)) => path,
            Ok(Err(_)) => {
                reader.abort();
                return Err(McpError::connect(endpoint, "stream ended before the endpoint event"));
            }
            Err(_) => {
                reader.abort();
                return Err(McpError::connect(endpoint, "no endpoint event received"));
            }
        };
        let post_url = match stream_url.join(&announced) {
            Ok(url) => url,
            Err(e) => {
                reader.abort();
                return Err(McpError::Protocol(format!(
                    "invalid endpoint event '{announced}': {e}"
                )));
            }
        };
        tracing::debug!(server = %request.server_name, post_url = %post_url, "Event stream ready");

        let writer = tokio::spawn(post_frames(http, post_url, rx, Arc::clone(&rpc)));
        let transport = Self {
            endpoint: endpoint.to_string(),
            rpc,
            tasks: Mutex::new(vec![reader, writer]),
            settings,
        };

        if let Err(e) = transport.rpc.initialize(settings.connect_timeout).await {
            tracing::error!(server = %request.server_name, error = %e, "Handshake failed");
            transport.disconnect().await;
            return Err(e);
        }

        Ok(transport)
    }
}

#[async_trait]
impl Transport for SseTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Sse
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
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if tasks.is_empty() {
            return;
        }

        self.rpc.stop_accepting();
        self.rpc.drain().await;
        self.rpc.close();
        for task in tasks {
            task.abort();
        }
        tracing::info!(server = %self.rpc.server(), "Event stream closed");
    }
}

fn header_map(credentials: &Credentials) -> Result<HeaderMap, String> {
    let mut headers = HeaderMap::new();
    for (name, value) in &credentials.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| format!("invalid header name '{name}': {e}"))?;
        let mut value = HeaderValue::from_str(value)
            .map_err(|e| format!("invalid value for header '{name}': {e}"))?;
        value.set_sensitive(true);
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Reader task: the first `endpoint` event is handed to `connect`, every
/// `message` event goes to the RPC channel.
async fn read_events(
    response: reqwest::Response,
    rpc: Arc<RpcChannel>,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let events = event_stream(response.bytes_stream());
    futures::pin_mut!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(event) if event.event == "endpoint" => {
                if let Some(tx) = endpoint_tx.take() {
                    let _ = tx.send(event.data.trim().to_string());
                }
            }
            Ok(event) if event.event == "message" => rpc.handle_incoming(&event.data),
            Ok(event) => {
                tracing::debug!(server = %rpc.server(), event = %event.event, "Ignoring event");
            }
            Err(e) => {
                tracing::warn!(server = %rpc.server(), error = %e, "Event stream failed");
                break;
            }
        }
    }
    tracing::debug!(server = %rpc.server(), "Event stream ended");
    rpc.close();
}

/// Writer task: POST each message to the announced endpoint, in order.
async fn post_frames(
    http: reqwest::Client,
    url: Url,
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    rpc: Arc<RpcChannel>,
) {
    while let Some(frame) = rx.recv().await {
        let sent = http
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(frame.body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        if let Err(e) = sent {
            tracing::warn!(server = %rpc.server(), error = %e, "POST to tool server failed");
            if let Some(id) = frame.id {
                rpc.fail(id, McpError::Protocol(format!("POST {url} failed: {e}")));
            }
        }
    }
}

/// One decoded server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incremental decoder for `text/event-stream` bodies.
#[derive(Debug, Default)]
pub(crate) struct EventStreamDecoder {
    buf: Vec<u8>,
}

impl EventStreamDecoder {
    /// Append a chunk and return every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut events = Vec::new();
        while let Some(pos) = find_double_newline(&self.buf) {
            let frame: Vec<u8> = self.buf.drain(..pos + 2).collect();
            if let Some(event) = parse_frame(&String::from_utf8_lossy(&frame)) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_frame(frame: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in frame.lines() {
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_string()),
            "data" => data.push(value),
            _ => {}
        }
    }

    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        event: event.unwrap_or_else(|| "message".to_string()),
        data: data.join("\n"),
    })
}

/// Find the position of a double newline in the buffer.
fn find_double_newline(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

fn event_stream<S, B>(bytes: S) -> impl Stream<Item = Result<SseEvent, reqwest::Error>>
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
{
    async_stream::try_stream! {
        let mut decoder = EventStreamDecoder::default();
        futures::pin_mut!(bytes);
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk?;
            for event in decoder.feed(chunk.as_ref()) {
                yield event;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_events_split_across_chunks() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.feed(b"event: endpoint\ndata: /messages?session").is_empty());
        let events = decoder.feed(b"_id=42\n\nevent: message\ndata: {\"id\":1}\n\n");
        assert_eq!(
            events,
            vec![
                SseEvent {
                    event: "endpoint".to_string(),
                    data: "/messages?session_id=42".to_string()
                },
                SseEvent {
                    event: "message".to_string(),
                    data: "{\"id\":1}".to_string()
                },
            ]
        );
    }

    #[test]
    fn handles_crlf_comments_and_multiline_data() {
        let mut decoder = EventStreamDecoder::default();
        let events = decoder.feed(b": keep-alive\r\n\r\ndata: line one\r\ndata: line two\r\n\r\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: "message".to_string(),
                data: "line one\nline two".to_string()
            }]
        );
    }

    #[test]
    fn ignores_frames_without_data() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.feed(b"event: ping\nid: 3\n\n").is_empty());
    }

    #[test]
    fn rejects_invalid_header_names() {
        let mut credentials = Credentials::default();
        credentials
            .headers
            .insert("bad header".to_string(), "x".to_string());
        assert!(header_map(&credentials).is_err());

        let mut credentials = Credentials::default();
        credentials
            .headers
            .insert("Authorization".to_string(), "Bearer token".to_string());
        let headers = header_map(&credentials).unwrap();
        assert!(headers.get("authorization").unwrap().is_sensitive());
    }
}
