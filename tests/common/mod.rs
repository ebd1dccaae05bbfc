#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use mcp_explorer::llm::{LanguageModel, ModelError, ModelReply, ModelRequest};
use mcp_explorer::mcp::transport::{ConnectRequest, Credentials, TransportKind, TransportSettings};
use mcp_explorer::session::{Message, ToolResult};

/// Command line that starts the bundled stdio tool server.
pub fn echo_server_command() -> String {
    env!("CARGO_BIN_EXE_mcp-echo-server").to_string()
}

pub fn stdio_request(name: &str) -> ConnectRequest {
    ConnectRequest {
        server_name: name.to_string(),
        kind: TransportKind::Stdio,
        endpoint: echo_server_command(),
        credentials: Credentials::default(),
    }
}

pub fn fast_settings() -> TransportSettings {
    TransportSettings {
        connect_timeout: Duration::from_secs(10),
        shutdown_grace: Duration::from_secs(2),
    }
}

type Policy = dyn Fn(&ModelRequest<'_>) -> ModelReply + Send + Sync;

/// Model whose replies are computed from the request it receives.
pub struct PolicyModel {
    policy: Box<Policy>,
    calls: Mutex<usize>,
}

impl std::fmt::Debug for PolicyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyModel").finish_non_exhaustive()
    }
}

impl PolicyModel {
    pub fn new(policy: impl Fn(&ModelRequest<'_>) -> ModelReply + Send + Sync + 'static) -> Self {
        Self {
            policy: Box::new(policy),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl LanguageModel for PolicyModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        *self.calls.lock().unwrap() += 1;
        Ok((self.policy)(&request))
    }
}

/// Results of the most recent tool round, if the last message is one.
pub fn last_results(request: &ModelRequest<'_>) -> Option<Vec<ToolResult>> {
    match request.messages.last() {
        Some(Message::ToolResults { results }) => Some(results.clone()),
        _ => None,
    }
}
