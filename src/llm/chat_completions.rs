//! `OpenAI`-compatible Chat Completions client.
//!
//! Renders the structured conversation into `/v1/chat/completions` messages,
//! advertises the tool catalog as function tools and maps
//! `choices[0].message` back into a [`ModelReply`].

use serde_json::{Value, json};
use uuid::Uuid;

use super::{LanguageModel, LlmSettings, ModelError, ModelReply, ModelRequest, ToolSpec};
use crate::session::{Message, ToolCall};

/// Language model backed by the Chat Completions API.
#[derive(Clone)]
pub struct ChatCompletionsModel {
    http: reqwest::Client,
    settings: LlmSettings,
}

impl std::fmt::Debug for ChatCompletionsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCompletionsModel")
            .field("settings", &self.settings)
            .finish()
    }
}

impl ChatCompletionsModel {
    #[must_use]
    pub fn new(settings: LlmSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    fn body(&self, request: &ModelRequest<'_>) -> Value {
        let mut body = json!({
            "model": self.settings.model,
            "messages": render_messages(request.system_prompt, request.messages),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(render_tools(request.tools));
        }
        if let Some(max_tokens) = self.settings.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait::async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError> {
        let mut rb = self.http.post(self.url()).json(&self.body(&request));
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }

        let resp = rb.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let value: Value = resp.json().await?;
        parse_reply(&value)
    }
}

/// Chat Completions messages, system prompt first.
fn render_messages(system_prompt: &str, messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::with_capacity(messages.len() + 1);
    if !system_prompt.is_empty() {
        out.push(json!({ "role": "system", "content": system_prompt }));
    }

    for message in messages {
        match message {
            Message::UserText { text } => out.push(json!({ "role": "user", "content": text })),
            Message::AssistantText { text } => {
                out.push(json!({ "role": "assistant", "content": text }));
            }
            Message::AssistantToolCalls { text, calls } => {
                let tool_calls: Vec<Value> = calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.call_id,
                            "type": "function",
                            "function": {
                                "name": call.tool_name,
                                // The API wants the arguments as a JSON string.
                                "arguments": call.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                out.push(json!({
                    "role": "assistant",
                    "content": text,
                    "tool_calls": tool_calls,
                }));
            }
            Message::ToolResults { results } => {
                for result in results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.call_id,
                        "content": result.output,
                    }));
                }
            }
        }
    }
    out
}

fn render_tools(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            json!({
                "type": "function",
                "function": {
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                }
            })
        })
        .collect()
}

fn parse_reply(value: &Value) -> Result<ModelReply, ModelError> {
    let message = value
        .pointer("/choices/0/message")
        .ok_or_else(|| ModelError::InvalidResponse(format!("no choices in response: {value}")))?;

    let text = message
        .get("content")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string);

    let calls: Vec<ToolCall> = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| calls.iter().filter_map(parse_tool_call).collect())
        .unwrap_or_default();

    if calls.is_empty() {
        return Ok(ModelReply::Text(text.unwrap_or_default()));
    }
    Ok(ModelReply::ToolCalls { text, calls })
}

fn parse_tool_call(raw: &Value) -> Option<ToolCall> {
    let function = raw.get("function")?;
    let Some(name) = function.get("name").and_then(Value::as_str) else {
        tracing::warn!(call = %raw, "Skipping tool call without a function name");
        return None;
    };
    let call_id = raw
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map_or_else(|| format!("call_{}", Uuid::new_v4().simple()), ToString::to_string);

    let arguments = match function.get("arguments") {
        Some(Value::String(s)) if s.trim().is_empty() => json!({}),
        Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|e| {
            tracing::warn!(tool = %name, error = %e, "Unparseable tool arguments; using {{}}");
            json!({})
        }),
        Some(other @ Value::Object(_)) => other.clone(),
        _ => json!({}),
    };

    Some(ToolCall {
        call_id,
        tool_name: name.to_string(),
        arguments,
    })
}
