//! Socket transport: newline-delimited JSON-RPC over TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::duplex::DuplexChannel;
use super::{handshake, Transport};
use crate::mcp_client::config::{ServerConfig, TransportConfig, TransportKind};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{InitializeResult, JsonRpcRequest, JsonRpcResponse};

pub struct SocketTransport {
    config: ServerConfig,
    channel: Mutex<Option<Arc<DuplexChannel>>>,
}

impl SocketTransport {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            channel: Mutex::new(None),
        }
    }

    async fn dial(&self) -> Result<(), McpError> {
        let name = self.config.name.as_str();
        let TransportConfig::Socket { host, port } = &self.config.transport else {
            return Err(McpError::transport(name, "not a socket server"));
        };

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host.as_str(), *port)),
        )
        .await
        .map_err(|_| {
            McpError::transport(
                name,
                format!(
                    "connect to {host}:{port} timed out after {}ms",
                    self.config.connect_timeout.as_millis()
                ),
            )
        })?
        .map_err(|e| McpError::transport(name, format!("connect to {host}:{port} failed: {e}")))?;
        let _ = stream.set_nodelay(true);

        tracing::debug!(server = %name, "connected to {host}:{port}");
        let (reader, writer) = stream.into_split();
        *self.channel.lock().await = Some(Arc::new(DuplexChannel::spawn(name, reader, writer)));
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<DuplexChannel>, McpError> {
        self.channel
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::transport(&self.config.name, "not connected"))
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    async fn open(&self) -> Result<InitializeResult, McpError> {
        self.close().await;
        self.dial().await?;
        match handshake(self, self.config.connect_timeout).await {
            Ok(init) => Ok(init),
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<(), McpError> {
        self.channel().await?.send(&request).await
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.channel().await?.notify(method, params).await
    }

    async fn receive(&self, id: u64, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        self.channel().await?.receive(id, timeout).await
    }

    async fn close(&self) {
        let channel = self.channel.lock().await.take();
        if let Some(channel) = channel {
            channel.shutdown().await;
            tracing::debug!(server = %self.config.name, "socket closed");
        }
    }

    fn is_open(&self) -> bool {
        match self.channel.try_lock() {
            Ok(guard) => guard.as_ref().is_some_and(|c| !c.is_closed()),
            // Someone is mid-open/close; report the conservative answer.
            Err(_) => false,
        }
    }
}
