//! The engine's public face: one default session plus the shared registry.

use std::sync::Arc;

use serde_json::Value;

use crate::config::Settings;
use crate::llm::{
    ChatCompletionsModel, LanguageModel, QueryError, QueryOptions, QueryProcessor, QuerySettings,
};
use crate::mcp::config::ServerConfig;
use crate::mcp::error::McpResult;
use crate::mcp::registry::{RegisteredTool, ServerRecord, ServerRegistry};
use crate::mcp::transport::{Credentials, TransportKind};
use crate::mcp::types::ToolOutput;
use crate::session::Message;

/// Tool-orchestration engine.
///
/// Holds the process-wide [`ServerRegistry`] and a default
/// [`QueryProcessor`]. Further independent sessions sharing the same
/// servers come from [`Explorer::new_session`].
#[derive(Debug)]
pub struct Explorer {
    registry: Arc<ServerRegistry>,
    model: Arc<dyn LanguageModel>,
    settings: QuerySettings,
    default_options: QueryOptions,
    session: QueryProcessor,
}

impl Explorer {
    pub fn new(
        registry: Arc<ServerRegistry>,
        model: Arc<dyn LanguageModel>,
        settings: QuerySettings,
    ) -> Self {
        let session = QueryProcessor::new(Arc::clone(&registry), Arc::clone(&model), settings);
        Self {
            registry,
            model,
            settings,
            default_options: QueryOptions::default(),
            session,
        }
    }

    /// Engine with real transports and a Chat Completions model.
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let registry = Arc::new(ServerRegistry::with_default_connector(
            settings.transport_settings(),
        ));
        let model = Arc::new(ChatCompletionsModel::new(settings.llm_settings()));
        Self::new(registry, model, settings.query_settings())
            .with_default_options(settings.query_options())
    }

    /// Options used by [`Explorer::process_query`].
    #[must_use]
    pub fn with_default_options(mut self, options: QueryOptions) -> Self {
        self.default_options = options;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn session(&self) -> &QueryProcessor {
        &self.session
    }

    /// A fresh conversation over the same servers and model.
    #[must_use]
    pub fn new_session(&self) -> QueryProcessor {
        QueryProcessor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.model),
            self.settings,
        )
    }

    pub async fn process_query(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, QueryError> {
        self.session
            .process_query_with(system_prompt, user_text, &self.default_options)
            .await
    }

    pub async fn process_query_with(
        &self,
        system_prompt: &str,
        user_text: &str,
        options: &QueryOptions,
    ) -> Result<String, QueryError> {
        self.session
            .process_query_with(system_prompt, user_text, options)
            .await
    }

    #[must_use]
    pub fn get_history(&self) -> Vec<Message> {
        self.session.history()
    }

    pub async fn reset_history(&self) {
        self.session.reset().await;
    }

    pub async fn add_tool_server(
        &self,
        name: Option<&str>,
        endpoint: &str,
        kind: TransportKind,
        credentials: Option<Credentials>,
    ) -> McpResult<ServerRecord> {
        self.registry
            .add_server(name, kind, endpoint, credentials.unwrap_or_default())
            .await
    }

    pub async fn remove_tool_server(&self, name: &str) -> McpResult<()> {
        self.registry.remove_server(name).await
    }

    pub async fn rename_tool_server(&self, old: &str, new: &str) -> McpResult<()> {
        self.registry.rename_server(old, new).await
    }

    #[must_use]
    pub fn list_tool_servers(&self) -> Vec<ServerRecord> {
        self.registry.list_servers()
    }

    #[must_use]
    pub fn list_tools(&self) -> Vec<RegisteredTool> {
        self.registry.list_tools()
    }

    /// Invoke a tool outside the model loop, with the configured timeout.
    pub async fn call_tool_directly(&self, tool_name: &str, arguments: Value) -> McpResult<ToolOutput> {
        self.registry
            .call_tool(tool_name, arguments, self.settings.tool_timeout)
            .await
    }

    /// Connect every configured server. Failures are logged and skipped.
    pub async fn connect_configured(&self, servers: &[ServerConfig]) -> Vec<ServerRecord> {
        let mut connected = Vec::with_capacity(servers.len());
        for server in servers {
            let added = self
                .registry
                .add_server(
                    server.name.as_deref(),
                    server.kind(),
                    &server.url,
                    server.credentials(),
                )
                .await;
            match added {
                Ok(record) => connected.push(record),
                Err(e) => tracing::error!(
                    server = server.name.as_deref().unwrap_or("<unnamed>"),
                    endpoint = %server.url,
                    error = %e,
                    "Skipping tool server"
                ),
            }
        }
        connected
    }

    /// Disconnect every server.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }
}
