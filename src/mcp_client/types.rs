//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the value types
//! that flow between the connection manager, registry, and execution engine.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::McpError;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    pub result: Option<serde_json::Value>,
    pub error: Option<JsonRpcError>,
    /// Present only when the peer sent a request of its own; such messages
    /// must never be routed to one of our waiters.
    #[serde(default)]
    pub method: Option<String>,
}

impl JsonRpcResponse {
    /// Build a success response (used by fake servers in tests and by the
    /// http transport when a server answers with a bare result).
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
            method: None,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision announced during `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default, alias = "outputSchema")]
    pub output_schema: Option<serde_json::Value>,
}

/// One page of a `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

// ─── Connection State ────────────────────────────────────────────────────────

/// Lifecycle state of one configured server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connected, but the most recent health probe failed.
    Degraded,
    /// Connect attempts or health probes exhausted; waits for reset/cooldown.
    Failed,
}

impl ConnectionState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (_, Disconnected)
                | (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connected, Degraded)
                | (Degraded, Connected)
                | (Degraded, Failed)
                | (Failed, Connecting)
        )
    }

    /// A transport exists and may still carry a retried request.
    pub fn has_transport(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ─── Tools ───────────────────────────────────────────────────────────────────

/// Immutable snapshot of one tool exposed by one server.
///
/// Refers to its server by name only; resolution to a live connection
/// happens at call time through the connection manager.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub server: String,
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    pub refreshed_at: DateTime<Utc>,
}

impl ToolDescriptor {
    /// Build a descriptor from a wire definition.
    pub fn from_definition(
        server: &str,
        def: McpToolDefinition,
        refreshed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            server: server.to_string(),
            name: def.name,
            description: def.description.unwrap_or_default(),
            input_schema: def.input_schema,
            output_schema: def.output_schema,
            refreshed_at,
        }
    }

    /// `server.tool` form, used in listings and ambiguity reports.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.server, self.name)
    }

    /// Names of the schema's required properties.
    pub fn required_params(&self) -> Vec<&str> {
        self.input_schema
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default()
    }

    /// Number of declared properties in the input schema.
    pub fn param_count(&self) -> usize {
        self.input_schema
            .get("properties")
            .and_then(|p| p.as_object())
            .map_or(0, |p| p.len())
    }
}

/// A single request to run a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    /// Target server; resolved through the registry when `None`.
    pub server: Option<String>,
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Overrides the server's configured invocation timeout.
    pub timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(tool: &str, params: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            tool: tool.to_string(),
            server: None,
            params,
            timeout: None,
        }
    }

    pub fn on_server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one invocation. Not persisted by the core.
#[derive(Debug)]
pub struct ToolResult {
    pub tool_name: String,
    /// Server that handled (or would have handled) the call.
    pub server_name: Option<String>,
    pub success: bool,
    pub result: Option<serde_json::Value>,
    pub error: Option<McpError>,
    pub execution_time_ms: u64,
    /// Dispatch attempts made; 0 when the call failed before dispatch.
    pub attempts: u32,
}

impl ToolResult {
    pub(crate) fn failure(
        tool_name: &str,
        server_name: Option<String>,
        error: McpError,
        execution_time_ms: u64,
        attempts: u32,
    ) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            server_name,
            success: false,
            result: None,
            error: Some(error),
            execution_time_ms,
            attempts,
        }
    }

    /// Collapse into a `Result`, discarding timing information.
    pub fn into_result(self) -> Result<serde_json::Value, McpError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }

    /// JSON rendering for CLI and batch output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tool": self.tool_name,
            "server": self.server_name,
            "success": self.success,
            "result": self.result,
            "error": self.error.as_ref().map(|e| e.to_string()),
            "execution_time_ms": self.execution_time_ms,
            "attempts": self.attempts,
        })
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
