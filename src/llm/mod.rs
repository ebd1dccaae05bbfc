//! Language-model collaborator and the query turn loop.
//!
//! # Overview
//!
//! The [`LanguageModel`] trait is the only thing the turn loop knows about the
//! model: it takes the system prompt, the structured history and the tool
//! catalog, and answers with either text or a batch of tool calls. The
//! [`QueryProcessor`] drives that trait and the server registry until a
//! final answer is produced.
//!
//! # Models
//!
//! - [`ChatCompletionsModel`]: `OpenAI`-compatible Chat Completions API (`/v1/chat/completions`)
//!
//! # Example
//!
//! ```rust,ignore
//! use mcp_explorer::llm::{ChatCompletionsModel, LlmSettings};
//!
//! let model = ChatCompletionsModel::new(LlmSettings {
//!     base_url: "https://api.openai.com".to_string(),
//!     api_key: Some("sk-...".to_string()),
//!     model: "gpt-4o-mini".to_string(),
//!     max_tokens: None,
//! });
//! ```

pub mod chat_completions;
pub mod orchestrator;

pub use chat_completions::ChatCompletionsModel;
pub use orchestrator::{QueryError, QueryOptions, QueryProcessor, QuerySettings, ToolOverride};

use serde::Serialize;
use serde_json::Value;

use crate::session::{Message, ToolCall};

/// LLM connection and model settings.
#[derive(Clone)]
pub struct LlmSettings {
    /// Base URL for the LLM API (e.g., `https://api.openai.com`).
    pub base_url: String,
    /// Optional API key for authentication.
    pub api_key: Option<String>,
    /// Model identifier (e.g., `gpt-4o`, `llama3.1`).
    pub model: String,
    pub max_tokens: Option<u32>,
}

impl std::fmt::Debug for LlmSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Everything the model sees for one turn.
#[derive(Debug, Clone, Copy)]
pub struct ModelRequest<'a> {
    pub system_prompt: &'a str,
    pub messages: &'a [Message],
    pub tools: &'a [ToolSpec],
}

/// What the model decided to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelReply {
    /// Final answer.
    Text(String),
    /// One or more tools to run before the model continues.
    ToolCalls {
        text: Option<String>,
        calls: Vec<ToolCall>,
    },
}

/// Failures of the model call itself. These end the query.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Unusable model response: {0}")]
    InvalidResponse(String),
}

/// Opaque request/response language-model collaborator.
#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync + std::fmt::Debug {
    /// Produce the next assistant step for the conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the reply cannot be interpreted.
    async fn complete(&self, request: ModelRequest<'_>) -> Result<ModelReply, ModelError>;
}
