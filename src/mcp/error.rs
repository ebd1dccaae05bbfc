//! Errors raised by transports and the server registry.

use std::time::Duration;

/// Failures of the tool-server layer.
///
/// Connection and registry errors are returned to whoever asked for the
/// operation. During a query the dispatcher turns every variant into an
/// error-tagged tool result instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum McpError {
    /// The subprocess could not be started or the remote endpoint was unreachable.
    #[error("Failed to connect to '{endpoint}': {reason}")]
    Connect { endpoint: String, reason: String },

    /// The server answered with something that is not a valid protocol message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The channel closed while the request was in flight (or before it was sent).
    #[error("Connection to server '{0}' lost")]
    ConnectionLost(String),

    /// No response arrived within the bound.
    #[error("Tool call '{tool}' timed out after {}s", .after.as_secs_f64())]
    Timeout { tool: String, after: Duration },

    /// The server answered the request with a JSON-RPC error object.
    #[error("Server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("A server named '{0}' is already registered")]
    DuplicateName(String),

    #[error("No server named '{0}' is registered")]
    NotFound(String),

    #[error("Invalid server name '{0}'")]
    InvalidName(String),

    #[error("Tool '{0}' not found in any connected server")]
    UnknownTool(String),
}

impl McpError {
    pub(crate) fn connect(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the call ran out of time rather than failing outright.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

pub type McpResult<T> = Result<T, McpError>;
