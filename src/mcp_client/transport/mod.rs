//! Transport abstraction.
//!
//! A closed set of transports, one per [`TransportConfig`] variant, behind a
//! single [`Transport`] contract:
//! - `open`: spawn/dial, then run the MCP `initialize` handshake
//! - `send`: write one JSON-RPC request
//! - `receive`: wait for the response correlated with a request id
//! - `close`: idempotent, releases the process/socket/pool
//!
//! Pipe and socket transports are full duplex and share [`duplex::DuplexChannel`]
//! for line framing and id correlation. Http is one POST per request.

pub mod duplex;
pub mod http;
pub mod pipe;
pub mod socket;

#[cfg(test)]
pub mod testing;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::config::{ServerConfig, TransportConfig, TransportKind};
use super::errors::McpError;
use super::types::{
    extract_result, InitializeResult, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
};

pub use http::HttpTransport;
pub use pipe::PipeTransport;
pub use socket::SocketTransport;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// One connection to one server.
///
/// All methods take `&self`; a transport is shared as `Arc<dyn Transport>`
/// between the connection manager, the registry, and in-flight invocations.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Name of the server this transport talks to.
    fn server_name(&self) -> &str;

    fn kind(&self) -> TransportKind;

    /// Establish the connection and complete the handshake.
    ///
    /// On failure every resource acquired so far is released before the
    /// error is returned.
    async fn open(&self) -> Result<InitializeResult, McpError>;

    /// Write a request. The response is collected with [`Transport::receive`].
    async fn send(&self, request: JsonRpcRequest) -> Result<(), McpError>;

    /// Write a notification (no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;

    /// Wait for the response to request `id`.
    ///
    /// A timeout abandons only this wait; the connection stays usable.
    async fn receive(&self, id: u64, timeout: Duration) -> Result<JsonRpcResponse, McpError>;

    /// Release the underlying resources. Safe to call more than once, and on
    /// a transport that never opened.
    async fn close(&self);

    fn is_open(&self) -> bool;
}

/// Send a request and wait for its response.
pub async fn request(
    transport: &dyn Transport,
    method: &str,
    params: Option<serde_json::Value>,
    timeout: Duration,
) -> Result<JsonRpcResponse, McpError> {
    let id = next_request_id();
    transport
        .send(JsonRpcRequest::new(id, method, params))
        .await?;
    transport.receive(id, timeout).await
}

/// Perform the MCP initialization handshake over an already-connected
/// transport.
pub(crate) async fn handshake(
    transport: &dyn Transport,
    timeout: Duration,
) -> Result<InitializeResult, McpError> {
    let params = serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = request(transport, "initialize", Some(params), timeout).await?;
    let server = transport.server_name();
    let result = extract_result(response).map_err(|e| {
        McpError::transport(server, format!("initialize rejected: {e}"))
    })?;

    let init: InitializeResult = serde_json::from_value(result).map_err(|e| {
        McpError::transport(server, format!("failed to parse initialize response: {e}"))
    })?;

    transport.notify("notifications/initialized", None).await?;

    tracing::debug!(
        server = %server,
        protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
        "handshake complete"
    );
    Ok(init)
}

// ─── Factory ─────────────────────────────────────────────────────────────────

/// Builds an unopened transport for a server.
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConfig) -> Arc<dyn Transport>;
}

/// Maps each [`TransportConfig`] variant onto its transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConfig) -> Arc<dyn Transport> {
        match &config.transport {
            TransportConfig::Stdio { .. } => Arc::new(PipeTransport::new(config.clone())),
            TransportConfig::Socket { .. } => Arc::new(SocketTransport::new(config.clone())),
            TransportConfig::Http { .. } => Arc::new(HttpTransport::new(config.clone())),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
