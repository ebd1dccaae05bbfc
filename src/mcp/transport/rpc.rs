//! JSON-RPC request/response correlation shared by both transports.
//!
//! Each transport owns a writer task that drains [`OutboundFrame`]s onto its
//! physical channel and a reader task that feeds inbound messages back into
//! [`RpcChannel::handle_incoming`]. Callers await a oneshot keyed by request
//! id, so responses may arrive in any order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::mcp::error::{McpError, McpResult};
use crate::mcp::types::{
    JsonRpcMessage, JsonRpcRequest, ListToolsResult, McpTool, ToolOutput, initialize_params,
};

type Pending = HashMap<u64, oneshot::Sender<McpResult<Value>>>;

/// Upper bound on `tools/list` pages fetched for one catalog.
const MAX_TOOL_PAGES: usize = 100;

/// A serialized message waiting to be written to the channel.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    /// Request id, absent for notifications.
    pub id: Option<u64>,
    pub body: String,
}

#[derive(Debug)]
pub(crate) struct RpcChannel {
    server: String,
    outbound: Mutex<Option<mpsc::UnboundedSender<OutboundFrame>>>,
    pending: Mutex<Pending>,
    idle: Notify,
    next_id: AtomicU64,
    accepting: AtomicBool,
    closed: AtomicBool,
}

impl RpcChannel {
    pub fn new(server: impl Into<String>, outbound: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self {
            server: server.into(),
            outbound: Mutex::new(Some(outbound)),
            pending: Mutex::new(HashMap::new()),
            idle: Notify::new(),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    /// True while new requests are accepted.
    pub fn is_open(&self) -> bool {
        self.accepting.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_pending(&self, id: u64) -> Option<oneshot::Sender<McpResult<Value>>> {
        let mut pending = self.lock_pending();
        let sender = pending.remove(&id);
        if pending.is_empty() {
            self.idle.notify_waiters();
        }
        sender
    }

    fn send_frame(&self, frame: OutboundFrame) -> McpResult<()> {
        let guard = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) if tx.send(frame).is_ok() => Ok(()),
            _ => Err(McpError::ConnectionLost(self.server.clone())),
        }
    }

    /// Send a request and wait for its response.
    ///
    /// On expiry of `timeout` the pending slot is released and a
    /// [`McpError::Timeout`] labelled with `method` is returned.
    pub async fn request(&self, method: &str, params: Value, timeout: Duration) -> McpResult<Value> {
        if !self.is_open() {
            return Err(McpError::ConnectionLost(self.server.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);

        // `close` may have drained the map between the check above and the insert.
        if self.closed.load(Ordering::Acquire) {
            self.take_pending(id);
            return Err(McpError::ConnectionLost(self.server.clone()));
        }

        let body = match serde_json::to_string(&JsonRpcRequest::request(id, method, params)) {
            Ok(body) => body,
            Err(e) => {
                self.take_pending(id);
                return Err(McpError::Protocol(format!("failed to encode {method}: {e}")));
            }
        };

        tracing::trace!(server = %self.server, id, method, "Sending request");
        if let Err(e) = self.send_frame(OutboundFrame { id: Some(id), body }) {
            self.take_pending(id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::ConnectionLost(self.server.clone())),
            Err(_) => {
                self.take_pending(id);
                Err(McpError::Timeout {
                    tool: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    pub fn notify(&self, method: &str, params: Value) -> McpResult<()> {
        let body = serde_json::to_string(&JsonRpcRequest::notification(method, params))
            .map_err(|e| McpError::Protocol(format!("failed to encode {method}: {e}")))?;
        self.send_frame(OutboundFrame { id: None, body })
    }

    /// Route one inbound message to its waiter. Anything that is not a
    /// response to an outstanding request is logged and dropped.
    pub fn handle_incoming(&self, raw: &str) {
        let message: JsonRpcMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(server = %self.server, error = %e, "Ignoring malformed message");
                return;
            }
        };

        let Some(id) = message.response_id() else {
            tracing::debug!(
                server = %self.server,
                method = ?message.method,
                "Ignoring server-initiated message"
            );
            return;
        };

        let outcome = match (message.result, message.error) {
            (_, Some(error)) => Err(McpError::Rpc {
                code: error.code,
                message: error.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(McpError::Protocol(format!(
                "response {id} carries neither result nor error"
            ))),
        };

        match self.take_pending(id) {
            Some(waiter) => {
                let _ = waiter.send(outcome);
            }
            None => {
                tracing::debug!(server = %self.server, id, "Response for unknown or expired request");
            }
        }
    }

    /// Resolve a single outstanding request with an error.
    pub fn fail(&self, id: u64, error: McpError) {
        if let Some(waiter) = self.take_pending(id) {
            let _ = waiter.send(Err(error));
        }
    }

    /// Stop accepting new requests; in-flight ones keep waiting.
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// Wait until no request is in flight.
    ///
    /// Every pending request carries its own timeout and releases its slot
    /// when that expires, so this always returns.
    pub async fn drain(&self) {
        loop {
            let idle = self.idle.notified();
            let in_flight = self.lock_pending().len();
            if in_flight == 0 {
                return;
            }
            tracing::debug!(server = %self.server, in_flight, "Waiting for in-flight requests");
            idle.await;
        }
    }

    /// Tear the channel down: drop the writer and fail every waiter with
    /// [`McpError::ConnectionLost`]. Idempotent.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::Release);
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let waiters: Vec<_> = self.lock_pending().drain().map(|(_, tx)| tx).collect();
        if !waiters.is_empty() {
            tracing::warn!(
                server = %self.server,
                in_flight = waiters.len(),
                "Channel closed with requests in flight"
            );
        }
        for waiter in waiters {
            let _ = waiter.send(Err(McpError::ConnectionLost(self.server.clone())));
        }
        self.idle.notify_waiters();
    }

    /// `initialize` request followed by the `notifications/initialized` notification.
    pub async fn initialize(&self, timeout: Duration) -> McpResult<Value> {
        let result = self
            .request("initialize", initialize_params(), timeout)
            .await
            .map_err(|e| match e {
                McpError::Rpc { code, message } => {
                    McpError::Protocol(format!("initialize rejected ({code}): {message}"))
                }
                McpError::Timeout { after, .. } => McpError::Protocol(format!(
                    "no initialize response within {}s",
                    after.as_secs()
                )),
                other => other,
            })?;

        if result.get("protocolVersion").and_then(Value::as_str).is_none() {
            return Err(McpError::Protocol(format!(
                "malformed initialize result: {result}"
            )));
        }

        self.notify("notifications/initialized", serde_json::json!({}))?;
        Ok(result)
    }

    /// `tools/list`, concatenating every page.
    pub async fn list_tools(&self, timeout: Duration) -> McpResult<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = HashSet::new();

        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(cursor) => serde_json::json!({ "cursor": cursor }),
                None => serde_json::json!({}),
            };
            let result = self.request("tools/list", params, timeout).await?;
            let page: ListToolsResult = serde_json::from_value(result)
                .map_err(|e| McpError::Protocol(format!("malformed tools/list result: {e}")))?;
            tools.extend(page.tools);

            let Some(next) = page.next_cursor else {
                return Ok(tools);
            };
            if !seen.insert(next.clone()) {
                return Err(McpError::Protocol(format!(
                    "tools/list cursor '{next}' repeated"
                )));
            }
            cursor = Some(next);
        }

        Err(McpError::Protocol(format!(
            "tools/list did not finish within {MAX_TOOL_PAGES} pages"
        )))
    }

    /// `tools/call` for one tool.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<ToolOutput> {
        let params = serde_json::json!({ "name": name, "arguments": arguments });
        let result = self
            .request("tools/call", params, timeout)
            .await
            .map_err(|e| match e {
                McpError::Timeout { after, .. } => McpError::Timeout {
                    tool: name.to_string(),
                    after,
                },
                other => other,
            })?;

        serde_json::from_value(result)
            .map_err(|e| McpError::Protocol(format!("malformed tools/call result for {name}: {e}")))
    }
}
