//! Structured conversation messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mcp::error::McpResult;
use crate::mcp::types::ToolOutput;

/// One entry of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    UserText {
        text: String,
    },
    AssistantText {
        text: String,
    },
    /// The model asked for tools. Must be followed by the matching [`Message::ToolResults`].
    AssistantToolCalls {
        /// Text the model produced alongside the calls, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
    ToolResults {
        results: Vec<ToolResult>,
    },
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::UserText { text: text.into() }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::AssistantText { text: text.into() }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UserText { .. } => "user_text",
            Self::AssistantText { .. } => "assistant_text",
            Self::AssistantToolCalls { .. } => "assistant_tool_calls",
            Self::ToolResults { .. } => "tool_results",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, tool_name: impl Into<String>, arguments: Value) -> Self {
        Self {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// Outcome of one [`ToolCall`]. Failures of any kind are recorded here
/// with `is_error` set rather than dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub output: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            output: message.into(),
            is_error: true,
        }
    }

    /// Fold a dispatch outcome into a result entry.
    pub fn from_outcome(call: &ToolCall, outcome: McpResult<ToolOutput>) -> Self {
        match outcome {
            Ok(output) => Self {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                output: output.text(),
                is_error: output.is_error,
            },
            Err(e) => Self::error(call, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::error::McpError;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn messages_are_tagged_by_type() {
        let message = Message::AssistantToolCalls {
            text: None,
            calls: vec![ToolCall::new("c1", "echo", json!({ "text": "hi" }))],
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "type": "assistant_tool_calls",
                "calls": [{ "call_id": "c1", "tool_name": "echo", "arguments": { "text": "hi" } }]
            })
        );
        assert_eq!(message.kind(), "assistant_tool_calls");
    }

    #[test]
    fn outcomes_map_to_results() {
        let call = ToolCall::new("c1", "echo", json!({}));

        let ok = ToolResult::from_outcome(&call, Ok(ToolOutput::from_text("hi")));
        assert_eq!(ok.output, "hi");
        assert!(!ok.is_error);

        let mut reported = ToolOutput::from_text("bad input");
        reported.is_error = true;
        assert!(ToolResult::from_outcome(&call, Ok(reported)).is_error);

        let timed_out = ToolResult::from_outcome(
            &call,
            Err(McpError::Timeout {
                tool: "echo".to_string(),
                after: Duration::from_secs(5),
            }),
        );
        assert!(timed_out.is_error);
        assert!(timed_out.output.contains("timed out"));
        assert_eq!(timed_out.call_id, "c1");
    }
}
