//! Append-only conversation log.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use super::message::{Message, ToolCall};

/// Appends that would break the pairing between tool calls and their results.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("Tool calls {pending:?} are unresolved; cannot append {attempted}")]
    UnresolvedToolCalls {
        pending: Vec<String>,
        attempted: &'static str,
    },

    #[error("Tool results {got:?} do not match the requested calls {expected:?}")]
    MismatchedToolResults {
        expected: Vec<String>,
        got: Vec<String>,
    },

    #[error("Tool results appended without a preceding tool-call request")]
    OrphanToolResults,

    #[error("A tool-call request must contain at least one call")]
    EmptyToolCalls,
}

/// One session's ordered message history.
///
/// Cloning shares the underlying log. Every append is checked so that an
/// [`Message::AssistantToolCalls`] is immediately followed by a
/// [`Message::ToolResults`] resolving each call, in request order.
#[derive(Debug, Clone)]
pub struct Conversation {
    inner: Arc<ConversationInner>,
}

#[derive(Debug)]
struct ConversationInner {
    id: Uuid,
    messages: RwLock<Vec<Message>>,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
}

#[derive(Serialize)]
struct ConversationState<'a> {
    id: Uuid,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    messages: &'a [Message],
}

impl Serialize for Conversation {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let messages = self.read();
        ConversationState {
            id: self.inner.id,
            created_at: self.inner.created_at,
            last_activity: self.last_activity(),
            messages: &messages,
        }
        .serialize(serializer)
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(ConversationInner {
                id: Uuid::new_v4(),
                messages: RwLock::new(Vec::new()),
                created_at: now,
                last_activity: RwLock::new(now),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn last_activity(&self) -> DateTime<Utc> {
        *self
            .inner
            .last_activity
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Message>> {
        self.inner.messages.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Message>> {
        self.inner.messages.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        *self
            .inner
            .last_activity
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Utc::now();
    }

    /// Append a message, rejecting it if it would break tool-call pairing.
    pub fn append(&self, message: Message) -> Result<(), ConversationError> {
        let mut messages = self.write();
        check_append(messages.last(), &message)?;
        messages.push(message);
        drop(messages);
        self.touch();
        Ok(())
    }

    /// Copy of the full history.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<Message> {
        self.read().last().cloned()
    }

    /// The calls of a trailing [`Message::AssistantToolCalls`], if any.
    #[must_use]
    pub fn pending_tool_calls(&self) -> Option<Vec<ToolCall>> {
        match self.read().last() {
            Some(Message::AssistantToolCalls { calls, .. }) => Some(calls.clone()),
            _ => None,
        }
    }

    pub fn clear(&self) {
        self.write().clear();
        self.touch();
    }

    /// Drop whole oldest turns until at most `limit` messages remain.
    ///
    /// A turn starts at a [`Message::UserText`]. The most recent turn is
    /// always kept, even if it alone exceeds `limit`. A `limit` of zero
    /// disables trimming. Returns the number of messages removed.
    pub fn enforce_limit(&self, limit: usize) -> usize {
        let mut messages = self.write();
        if limit == 0 || messages.len() <= limit {
            return 0;
        }

        let starts: Vec<usize> = messages
            .iter()
            .enumerate()
            .filter(|(_, m)| matches!(m, Message::UserText { .. }))
            .map(|(i, _)| i)
            .collect();
        let len = messages.len();
        let cut = starts
            .iter()
            .copied()
            .find(|&start| start > 0 && len - start <= limit)
            .or_else(|| starts.last().copied())
            .unwrap_or(0);

        messages.drain(..cut);
        cut
    }
}

fn call_ids<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<String> {
    ids.cloned().collect()
}

fn check_append(last: Option<&Message>, next: &Message) -> Result<(), ConversationError> {
    match (last, next) {
        (_, Message::AssistantToolCalls { calls, .. }) if calls.is_empty() => {
            Err(ConversationError::EmptyToolCalls)
        }
        (Some(Message::AssistantToolCalls { calls, .. }), Message::ToolResults { results }) => {
            let matches = calls.len() == results.len()
                && calls
                    .iter()
                    .zip(results)
                    .all(|(call, result)| call.call_id == result.call_id);
            if matches {
                Ok(())
            } else {
                Err(ConversationError::MismatchedToolResults {
                    expected: call_ids(calls.iter().map(|c| &c.call_id)),
                    got: call_ids(results.iter().map(|r| &r.call_id)),
                })
            }
        }
        (Some(Message::AssistantToolCalls { calls, .. }), other) => {
            Err(ConversationError::UnresolvedToolCalls {
                pending: call_ids(calls.iter().map(|c| &c.call_id)),
                attempted: other.kind(),
            })
        }
        (_, Message::ToolResults { .. }) => Err(ConversationError::OrphanToolResults),
        _ => Ok(()),
    }
}
