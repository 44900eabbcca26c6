//! MCP Client — JSON-RPC tool client over pipe, socket and http transports.
//!
//! This module handles:
//! - Loading and validating the server configuration
//! - Opening transports and running the MCP handshake
//! - Per-server connection state, health probes and automatic reconnects
//! - Tool discovery, caching with a TTL, and lookup/search
//! - Tool call validation, retry and bounded-concurrency batches

pub mod backoff;
pub mod client;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod executor;
pub mod lifecycle;
pub(crate) mod locks;
pub mod registry;
pub mod transport;
pub mod types;
pub mod validation;

// Re-exports for convenience
pub use client::McpClient;
pub use config::{ClientSettings, McpConfig, RetryPolicy, ServerConfig, TransportConfig, TransportKind};
pub use errors::{ErrorKind, McpError};
pub use executor::{ExecutionEngine, ExecutionStats};
pub use lifecycle::{ConnectionManager, ConnectionSnapshot, StateChange};
pub use registry::ToolRegistry;
pub use types::{ConnectionState, ToolDescriptor, ToolInvocation, ToolResult};
