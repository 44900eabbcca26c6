//! MCP Client error types.
//!
//! Every failure the core can surface is one variant of [`McpError`]. The
//! variants fall into three families (see [`ErrorKind`]) which the CLI maps
//! onto stable exit codes.

use thiserror::Error;

use super::types::ConnectionState;

/// Coarse classification of an [`McpError`], used for exit codes and for
/// deciding which layer absorbs the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The configuration document was malformed or violated the schema.
    Config,
    /// A server could not be reached, or stopped responding.
    Connection,
    /// A single tool invocation was rejected or failed.
    Invocation,
}

impl ErrorKind {
    /// Process exit code reported by the CLI for this family.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Config => 1,
            ErrorKind::Connection => 2,
            ErrorKind::Invocation => 3,
        }
    }
}

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The configuration document could not be read or parsed.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// A server entry is missing a field or carries an invalid value.
    #[error("invalid config for server '{server}', field '{field}': {reason}")]
    SchemaViolation {
        server: String,
        field: String,
        reason: String,
    },

    /// A server name that is not in the configuration.
    #[error("no configuration for server '{name}'")]
    UnknownServer { name: String },

    /// Spawn/dial/handshake/write/read failure on a transport.
    #[error("transport error for server '{server}': {reason}")]
    Transport { server: String, reason: String },

    /// A request did not receive its response before the deadline.
    #[error("request '{method}' to server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        method: String,
        timeout_ms: u64,
    },

    /// Every connect attempt failed; the server is now `Failed`.
    #[error("server '{name}' failed after {attempts} connect attempts: {reason}")]
    ReconnectExhausted {
        name: String,
        attempts: u32,
        reason: String,
    },

    /// The server owning a tool is not in a usable state.
    #[error("server '{name}' is unavailable (state: {state})")]
    ServerUnavailable { name: String, state: ConnectionState },

    /// No connected server exposes the requested tool.
    #[error("unknown tool: '{name}'{}", format_suggestions(suggestions))]
    ToolNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    /// More than one server exposes the requested bare tool name.
    #[error("tool '{name}' is ambiguous; specify a server (candidates: {})", candidates.join(", "))]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    /// Parameters do not satisfy the tool's input schema.
    #[error("invalid arguments for '{tool}', field '{field}': {reason}")]
    Validation {
        tool: String,
        field: String,
        reason: String,
    },

    /// A tool call exceeded its invocation timeout.
    #[error("tool call '{tool}' timed out after {timeout_ms}ms")]
    ExecutionTimeout { tool: String, timeout_ms: u64 },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The tool ran but reported failure (`isError: true`).
    #[error("tool '{tool}' reported an error: {message}")]
    ToolFailed { tool: String, message: String },
}

impl McpError {
    /// Which family this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            McpError::Config { .. }
            | McpError::SchemaViolation { .. }
            | McpError::UnknownServer { .. } => ErrorKind::Config,
            McpError::Transport { .. }
            | McpError::Timeout { .. }
            | McpError::ReconnectExhausted { .. }
            | McpError::ServerUnavailable { .. } => ErrorKind::Connection,
            McpError::ToolNotFound { .. }
            | McpError::AmbiguousTool { .. }
            | McpError::Validation { .. }
            | McpError::ExecutionTimeout { .. }
            | McpError::ServerError { .. }
            | McpError::ToolFailed { .. } => ErrorKind::Invocation,
        }
    }

    /// Exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        self.kind().exit_code()
    }

    /// Only transport faults are transient. Timeouts are surfaced to the
    /// caller so a side-effecting call is never silently duplicated.
    pub fn is_retriable(&self) -> bool {
        matches!(self, McpError::Transport { .. })
    }

    pub(crate) fn transport(server: &str, reason: impl Into<String>) -> Self {
        McpError::Transport {
            server: server.to_string(),
            reason: reason.into(),
        }
    }
}

fn format_suggestions(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean: {}?)", suggestions.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_by_family() {
        let config = McpError::Config {
            reason: "bad".into(),
        };
        let conn = McpError::ServerUnavailable {
            name: "memory".into(),
            state: ConnectionState::Failed,
        };
        let call = McpError::Validation {
            tool: "store_value".into(),
            field: "key".into(),
            reason: "missing".into(),
        };
        assert_eq!(config.exit_code(), 1);
        assert_eq!(conn.exit_code(), 2);
        assert_eq!(call.exit_code(), 3);
    }

    #[test]
    fn test_only_transport_is_retriable() {
        assert!(McpError::transport("s", "broken pipe").is_retriable());
        assert!(!McpError::Timeout {
            server: "s".into(),
            method: "tools/call".into(),
            timeout_ms: 10,
        }
        .is_retriable());
        assert!(!McpError::ExecutionTimeout {
            tool: "t".into(),
            timeout_ms: 10,
        }
        .is_retriable());
    }

    #[test]
    fn test_not_found_message_lists_suggestions() {
        let err = McpError::ToolNotFound {
            name: "store_valu".into(),
            suggestions: vec!["memory.store_value".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("store_valu"));
        assert!(msg.contains("did you mean: memory.store_value?"));

        let bare = McpError::ToolNotFound {
            name: "x".into(),
            suggestions: vec![],
        };
        assert_eq!(bare.to_string(), "unknown tool: 'x'");
    }

    #[test]
    fn test_ambiguous_message_lists_candidates() {
        let err = McpError::AmbiguousTool {
            name: "search".into(),
            candidates: vec!["docs.search".into(), "web.search".into()],
        };
        assert!(err.to_string().contains("docs.search, web.search"));
    }
}
