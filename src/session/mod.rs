//! Conversation history.
//!
//! - [`Message`]: the structured entries of a conversation
//! - [`Conversation`]: one session's append-only log
//!
//! # Example
//!
//! ```rust
//! use mcp_explorer::session::{Conversation, Message};
//!
//! let conversation = Conversation::new();
//! conversation.append(Message::user("Hello!")).unwrap();
//!
//! assert_eq!(conversation.len(), 1);
//! ```

mod conversation;
mod message;

pub use conversation::{Conversation, ConversationError};
pub use message::{Message, ToolCall, ToolResult};
