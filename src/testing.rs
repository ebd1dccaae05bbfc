//! In-process fakes for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::llm::{LanguageModel, ModelError, ModelReply, ModelRequest, ToolSpec};
use crate::mcp::error::{McpError, McpResult};
use crate::mcp::transport::{ConnectRequest, Connector, Transport, TransportKind};
use crate::mcp::types::{McpTool, ToolOutput};
use crate::session::Message;

/// A transport whose tools echo their arguments back as compact JSON.
#[derive(Debug, Clone)]
pub(crate) struct FakeTransport {
    inner: Arc<FakeInner>,
}

#[derive(Debug)]
struct FakeInner {
    tools: Vec<McpTool>,
    connected: AtomicBool,
    list_error: Mutex<Option<McpError>>,
    delays: Mutex<HashMap<String, Duration>>,
}

impl FakeTransport {
    pub fn new(tools: &[&str]) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                tools: tools
                    .iter()
                    .map(|name| McpTool {
                        name: (*name).to_string(),
                        description: Some(format!("{name} tool")),
                        input_schema: json!({ "type": "object" }),
                    })
                    .collect(),
                connected: AtomicBool::new(true),
                list_error: Mutex::new(None),
                delays: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn fail_list_tools(&self, error: McpError) {
        *self.inner.list_error.lock().unwrap() = Some(error);
    }

    pub fn delay(&self, tool: &str, delay: Duration) {
        self.inner
            .delays
            .lock()
            .unwrap()
            .insert(tool.to_string(), delay);
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    fn endpoint(&self) -> &str {
        "fake"
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn list_tools(&self) -> McpResult<Vec<McpTool>> {
        if let Some(error) = self.inner.list_error.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(self.inner.tools.clone())
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> McpResult<ToolOutput> {
        if !self.is_connected() {
            return Err(McpError::ConnectionLost("fake".to_string()));
        }
        let delay = self.inner.delays.lock().unwrap().get(name).copied();
        if let Some(delay) = delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Err(McpError::Timeout {
                    tool: name.to_string(),
                    after: timeout,
                });
            }
        }
        Ok(ToolOutput::from_text(arguments.to_string()))
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
    }
}

/// Hands out pre-built [`FakeTransport`]s by endpoint.
#[derive(Debug, Default)]
pub(crate) struct FakeConnector {
    transports: Mutex<HashMap<String, FakeTransport>>,
}

impl FakeConnector {
    pub fn serve(&self, endpoint: &str, transport: FakeTransport) {
        self.transports
            .lock()
            .unwrap()
            .insert(endpoint.to_string(), transport);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, request: &ConnectRequest) -> McpResult<Arc<dyn Transport>> {
        let transport = self
            .transports
            .lock()
            .unwrap()
            .get(&request.endpoint)
            .cloned()
            .ok_or_else(|| McpError::connect(&request.endpoint, "unreachable"))?;
        Ok(Arc::new(transport))
    }
}

/// What [`ScriptedModel`] was asked.
#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub system_prompt: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
}

/// Replays canned replies in order; fails once the script runs out.
#[derive(Debug)]
pub(crate) struct ScriptedModel {
    replies: Mutex<VecDeque<ModelReply>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ModelReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            system_prompt: request.system_prompt.to_string(),
            messages: request.messages.to_vec(),
            tools: request.tools.to_vec(),
        });
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ModelError::InvalidResponse("script exhausted".to_string()))
    }
}
