//! Query processor: the model/tool turn loop.
//!
//! One call to [`QueryProcessor::process_query`] runs:
//! 1. Append the user's message to the conversation
//! 2. Ask the model, advertising every registered tool
//! 3. If the model asks for tools, run them concurrently and append the results
//! 4. Repeat until the model answers with text
//!
//! Tool failures of any kind (unknown tool, timeout, transport error, tool
//! reported error) come back to the model as error-tagged results. Only a
//! failed model call or too many tool rounds end the query with an error.
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_explorer::llm::{ChatCompletionsModel, QueryProcessor, QuerySettings};
//!
//! let processor = QueryProcessor::new(registry, Arc::new(model), QuerySettings::default());
//! let answer = processor.process_query("You are helpful.", "What time is it?").await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mcp::registry::{RegisteredTool, ServerRegistry};
use crate::session::{Conversation, ConversationError, Message, ToolCall, ToolResult};

use super::{LanguageModel, ModelError, ModelReply, ModelRequest, ToolSpec};

/// Default cap on model/tool rounds per query.
pub const MAX_TOOL_ITERATIONS: usize = 5;

/// Failures that end a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("Model kept requesting tools after {limit} rounds")]
    TooManyIterations { limit: usize },

    #[error(transparent)]
    Conversation(#[from] ConversationError),
}

/// Per-processor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuerySettings {
    /// Maximum number of tool rounds per query.
    pub max_tool_calls: usize,
    /// Bound on each individual tool call.
    pub tool_timeout: Duration,
    /// Conversation bound in messages; zero disables trimming.
    pub history_limit: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            max_tool_calls: MAX_TOOL_ITERATIONS,
            tool_timeout: Duration::from_secs(30),
            history_limit: 100,
        }
    }
}

/// Replaces the description the model sees for one server's tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOverride {
    pub server: String,
    pub name: String,
    pub description: String,
}

/// Options for a single query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOptions {
    #[serde(default)]
    pub max_tool_calls: Option<usize>,
    #[serde(default)]
    pub tool_overrides: Vec<ToolOverride>,
}

/// Drives one session's conversation against the model and the registry.
///
/// Queries on the same processor run one at a time; the history can be
/// read at any point, including while a query is running.
pub struct QueryProcessor {
    registry: Arc<ServerRegistry>,
    model: Arc<dyn LanguageModel>,
    conversation: Conversation,
    settings: QuerySettings,
    turn: tokio::sync::Mutex<()>,
}

#[allow(clippy::missing_fields_in_debug)]
impl std::fmt::Debug for QueryProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryProcessor")
            .field("conversation", &self.conversation.id())
            .field("settings", &self.settings)
            .field("model", &self.model)
            .finish()
    }
}

impl QueryProcessor {
    pub fn new(
        registry: Arc<ServerRegistry>,
        model: Arc<dyn LanguageModel>,
        settings: QuerySettings,
    ) -> Self {
        Self {
            registry,
            model,
            conversation: Conversation::new(),
            settings,
            turn: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &QuerySettings {
        &self.settings
    }

    #[must_use]
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    /// Snapshot of the conversation so far.
    #[must_use]
    pub fn history(&self) -> Vec<Message> {
        self.conversation.messages()
    }

    /// Clear the conversation. Waits for a running query to finish first.
    pub async fn reset(&self) {
        let _turn = self.turn.lock().await;
        self.conversation.clear();
        tracing::info!(conversation = %self.conversation.id(), "Conversation reset");
    }

    /// Run one user query to a final answer.
    pub async fn process_query(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> Result<String, QueryError> {
        self.process_query_with(system_prompt, user_text, &QueryOptions::default())
            .await
    }

    /// [`Self::process_query`] with per-query options.
    pub async fn process_query_with(
        &self,
        system_prompt: &str,
        user_text: &str,
        options: &QueryOptions,
    ) -> Result<String, QueryError> {
        let _turn = self.turn.lock().await;
        let request_id = Uuid::new_v4().to_string();
        let limit = options.max_tool_calls.unwrap_or(self.settings.max_tool_calls);

        self.resolve_interrupted_calls()?;
        self.conversation.append(Message::user(user_text))?;
        let trimmed = self.conversation.enforce_limit(self.settings.history_limit);
        if trimmed > 0 {
            tracing::debug!(request_id = %request_id, trimmed, "Dropped oldest turns from history");
        }

        let tools = build_catalog(self.registry.list_tools(), &options.tool_overrides);
        tracing::info!(
            name: "query.start",
            request_id = %request_id,
            message_count = self.conversation.len(),
            tool_count = tools.len(),
            "Starting query"
        );

        let mut rounds = 0;
        loop {
            let messages = self.conversation.messages();
            tracing::debug!(
                name: "query.iteration",
                request_id = %request_id,
                iteration = rounds + 1,
                message_count = messages.len(),
                "Calling model"
            );

            let reply = self
                .model
                .complete(ModelRequest {
                    system_prompt,
                    messages: &messages,
                    tools: &tools,
                })
                .await
                .inspect_err(|e| {
                    tracing::error!(request_id = %request_id, error = %e, "Model call failed");
                })?;

            let (text, calls) = match reply {
                ModelReply::Text(text) => {
                    self.conversation.append(Message::assistant(text.clone()))?;
                    tracing::info!(
                        name: "query.done",
                        request_id = %request_id,
                        rounds,
                        "Query completed"
                    );
                    return Ok(text);
                }
                ModelReply::ToolCalls { calls, .. } if calls.is_empty() => {
                    return Err(ModelError::InvalidResponse(
                        "tool-call reply without any calls".to_string(),
                    )
                    .into());
                }
                ModelReply::ToolCalls { text, calls } => (text, calls),
            };

            if rounds >= limit {
                tracing::error!(
                    request_id = %request_id,
                    iteration = rounds,
                    max_iterations = limit,
                    "Maximum tool loop iterations exceeded"
                );
                return Err(QueryError::TooManyIterations { limit });
            }
            rounds += 1;

            self.conversation.append(Message::AssistantToolCalls {
                text,
                calls: calls.clone(),
            })?;
            let results = self.dispatch(&request_id, calls).await;
            self.conversation.append(Message::ToolResults { results })?;
        }
    }

    /// Run every call concurrently; results come back in request order.
    async fn dispatch(&self, request_id: &str, calls: Vec<ToolCall>) -> Vec<ToolResult> {
        let timeout = self.settings.tool_timeout;
        let handles: Vec<_> = calls
            .iter()
            .cloned()
            .map(|call| {
                let registry = Arc::clone(&self.registry);
                let request_id = request_id.to_string();
                tokio::spawn(async move {
                    tracing::info!(
                        name: "mcp.tool.call",
                        request_id = %request_id,
                        tool_id = %call.call_id,
                        tool_name = %call.tool_name,
                        "Executing tool call"
                    );
                    let outcome = registry
                        .call_tool(&call.tool_name, call.arguments.clone(), timeout)
                        .await;
                    if let Err(e) = &outcome {
                        tracing::warn!(
                            request_id = %request_id,
                            tool_id = %call.call_id,
                            tool_name = %call.tool_name,
                            error = %e,
                            "Tool call failed"
                        );
                    }
                    ToolResult::from_outcome(&call, outcome)
                })
            })
            .collect();

        futures::future::join_all(handles)
            .await
            .into_iter()
            .zip(&calls)
            .map(|(joined, call)| {
                joined.unwrap_or_else(|e| ToolResult::error(call, format!("Tool task failed: {e}")))
            })
            .collect()
    }

    /// A query dropped mid-dispatch leaves calls without results; close them out.
    fn resolve_interrupted_calls(&self) -> Result<(), ConversationError> {
        let Some(calls) = self.conversation.pending_tool_calls() else {
            return Ok(());
        };
        tracing::warn!(
            conversation = %self.conversation.id(),
            calls = calls.len(),
            "Resolving tool calls left over from an interrupted query"
        );
        let results = calls
            .iter()
            .map(|call| ToolResult::error(call, "Tool call interrupted"))
            .collect();
        self.conversation.append(Message::ToolResults { results })
    }
}

/// Tool list for the model: one entry per name (the one dispatch would
/// use), with per-query description overrides applied.
fn build_catalog(tools: Vec<RegisteredTool>, overrides: &[ToolOverride]) -> Vec<ToolSpec> {
    let mut seen = HashSet::new();
    tools
        .into_iter()
        .filter(|registered| seen.insert(registered.tool.name.clone()))
        .map(|registered| {
            let description = overrides
                .iter()
                .find(|o| o.server == registered.server && o.name == registered.tool.name)
                .map(|o| o.description.clone())
                .or(registered.tool.description)
                .unwrap_or_default();
            ToolSpec {
                name: registered.tool.name,
                description,
                input_schema: registered.tool.input_schema,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::transport::{Connector, Credentials, TransportKind};
    use crate::mcp::types::McpTool;
    use crate::testing::{FakeConnector, FakeTransport, ScriptedModel};
    use serde_json::json;

    fn registered(server: &str, name: &str, description: &str) -> RegisteredTool {
        RegisteredTool {
            server: server.to_string(),
            tool: McpTool {
                name: name.to_string(),
                description: Some(description.to_string()),
                input_schema: json!({ "type": "object" }),
            },
        }
    }

    async fn setup(transport: FakeTransport) -> Arc<ServerRegistry> {
        let connector = Arc::new(FakeConnector::default());
        connector.serve("fake", transport);
        let registry = Arc::new(ServerRegistry::new(connector as Arc<dyn Connector>));
        registry
            .add_server(Some("main"), TransportKind::Stdio, "fake", Credentials::default())
            .await
            .unwrap();
        registry
    }

    fn processor(registry: Arc<ServerRegistry>, model: &Arc<ScriptedModel>) -> QueryProcessor {
        QueryProcessor::new(
            registry,
            Arc::clone(model) as Arc<dyn LanguageModel>,
            QuerySettings {
                tool_timeout: Duration::from_millis(200),
                ..QuerySettings::default()
            },
        )
    }

    #[test]
    fn catalog_dedupes_and_applies_overrides() {
        let catalog = build_catalog(
            vec![
                registered("a", "search", "first"),
                registered("b", "search", "second"),
                registered("b", "time", "clock"),
            ],
            &[
                ToolOverride {
                    server: "a".to_string(),
                    name: "search".to_string(),
                    description: "custom".to_string(),
                },
                ToolOverride {
                    server: "a".to_string(),
                    name: "time".to_string(),
                    description: "wrong server".to_string(),
                },
            ],
        );

        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog[0].name, "search");
        assert_eq!(catalog[0].description, "custom");
        assert_eq!(catalog[1].description, "clock");
    }

    #[tokio::test]
    async fn text_reply_finishes_immediately() {
        let registry = setup(FakeTransport::new(&["echo"])).await;
        let model = Arc::new(ScriptedModel::new(vec![ModelReply::Text("hello".to_string())]));
        let processor = processor(registry, &model);

        let answer = processor.process_query("sp", "hi").await.unwrap();
        assert_eq!(answer, "hello");
        assert_eq!(
            processor.history(),
            vec![Message::user("hi"), Message::assistant("hello")]
        );

        let requests = model.requests();
        assert_eq!(requests[0].system_prompt, "sp");
        assert_eq!(requests[0].tools[0].name, "echo");
    }

    #[tokio::test]
    async fn results_keep_request_order() {
        let transport = FakeTransport::new(&["slow", "fast"]);
        transport.delay("slow", Duration::from_millis(80));
        let registry = setup(transport).await;
        let model = Arc::new(ScriptedModel::new(vec![
            ModelReply::ToolCalls {
                text: None,
                calls: vec![
                    ToolCall::new("1", "slow", json!({ "n": 1 })),
                    ToolCall::new("2", "fast", json!({ "n": 2 })),
                    ToolCall::new("3", "missing", json!({})),
                ],
            },
            ModelReply::Text("done".to_string()),
        ]));
        let processor = processor(registry, &model);

        processor.process_query("sp", "go").await.unwrap();

        let history = processor.history();
        let Message::ToolResults { results } = &history[2] else {
            panic!("expected tool results, got {:?}", history[2]);
        };
        let ids: Vec<_> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert!(!results[0].is_error);
        assert!(results[2].is_error);
        assert!(results[2].output.contains("missing"));

        // The second model call saw the results.
        assert_eq!(model.requests()[1].messages.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn calls_in_one_round_run_concurrently() {
        let transport = FakeTransport::new(&["a", "b", "c"]);
        for tool in ["a", "b", "c"] {
            transport.delay(tool, Duration::from_millis(150));
        }
        let registry = setup(transport).await;
        let model = Arc::new(ScriptedModel::new(vec![
            ModelReply::ToolCalls {
                text: None,
                calls: vec![
                    ToolCall::new("1", "a", json!({})),
                    ToolCall::new("2", "b", json!({})),
                    ToolCall::new("3", "c", json!({})),
                ],
            },
            ModelReply::Text("done".to_string()),
        ]));
        let processor = processor(registry, &model);

        let started = tokio::time::Instant::now();
        processor.process_query("sp", "go").await.unwrap();
        let elapsed = started.elapsed();

        // One after another would take 450ms.
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "{elapsed:?}");

        let history = processor.history();
        let Message::ToolResults { results } = &history[2] else {
            panic!("expected tool results, got {:?}", history[2]);
        };
        assert!(results.iter().all(|r| !r.is_error), "{results:?}");
    }

    #[tokio::test]
    async fn too_many_rounds_fails_without_dangling_calls() {
        let registry = setup(FakeTransport::new(&["echo"])).await;
        let call = || ModelReply::ToolCalls {
            text: None,
            calls: vec![ToolCall::new(Uuid::new_v4().to_string(), "echo", json!({}))],
        };
        let model = Arc::new(ScriptedModel::new(vec![call(), call(), call()]));
        let processor = processor(registry, &model);

        let options = QueryOptions {
            max_tool_calls: Some(2),
            ..QueryOptions::default()
        };
        let err = processor
            .process_query_with("sp", "loop", &options)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::TooManyIterations { limit: 2 }));

        let history = processor.history();
        assert_eq!(history.len(), 5);
        assert!(matches!(history.last(), Some(Message::ToolResults { .. })));
        assert!(processor.conversation().pending_tool_calls().is_none());
    }

    #[tokio::test]
    async fn model_errors_are_fatal() {
        let registry = setup(FakeTransport::new(&["echo"])).await;
        let model = Arc::new(ScriptedModel::new(vec![]));
        let processor = processor(registry, &model);

        let err = processor.process_query("sp", "hi").await.unwrap_err();
        assert!(matches!(err, QueryError::Model(_)));
        assert_eq!(processor.history(), vec![Message::user("hi")]);
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let registry = setup(FakeTransport::new(&["echo"])).await;
        let model = Arc::new(ScriptedModel::new(vec![ModelReply::Text("ok".to_string())]));
        let processor = processor(registry, &model);

        processor.process_query("sp", "hi").await.unwrap();
        processor.reset().await;
        assert!(processor.history().is_empty());
    }

    #[tokio::test]
    async fn interrupted_calls_are_closed_out_on_next_query() {
        let registry = setup(FakeTransport::new(&["echo"])).await;
        let model = Arc::new(ScriptedModel::new(vec![ModelReply::Text("ok".to_string())]));
        let processor = processor(registry, &model);

        processor.conversation().append(Message::user("before")).unwrap();
        processor
            .conversation()
            .append(Message::AssistantToolCalls {
                text: None,
                calls: vec![ToolCall::new("lost", "echo", json!({}))],
            })
            .unwrap();

        processor.process_query("sp", "again").await.unwrap();
        let history = processor.history();
        let Message::ToolResults { results } = &history[2] else {
            panic!("expected tool results");
        };
        assert!(results[0].is_error);
        assert_eq!(history[3], Message::user("again"));
    }
}
