//! MCP Client — high-level interface for tool execution.
//!
//! Wires the connection manager, tool registry and execution engine
//! together. This is the API the CLI is built on.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use super::config::McpConfig;
use super::errors::McpError;
use super::executor::{ExecutionEngine, ExecutionStats};
use super::lifecycle::{ConnectionManager, ConnectionSnapshot, StateChange};
use super::registry::ToolRegistry;
use super::transport::{DefaultTransportFactory, TransportFactory};
use super::types::{ToolDescriptor, ToolInvocation, ToolResult};

// ─── McpClient ───────────────────────────────────────────────────────────────

/// High-level MCP client that manages multiple servers and routes tool calls.
pub struct McpClient {
    config: McpConfig,
    manager: ConnectionManager,
    engine: ExecutionEngine,
}

impl McpClient {
    /// Build a client over the real pipe/socket/http transports.
    pub fn from_config(config: McpConfig) -> Self {
        Self::with_factory(config, Arc::new(DefaultTransportFactory))
    }

    pub fn with_factory(config: McpConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let registry = Arc::new(ToolRegistry::new(config.settings.tool_cache_ttl));
        let manager = ConnectionManager::new(&config, registry, factory);
        let engine = ExecutionEngine::new(manager.clone());
        Self {
            config,
            manager,
            engine,
        }
    }

    /// Load a config file and build a client from it.
    pub fn load(path: &Path) -> Result<Self, McpError> {
        Ok(Self::from_config(McpConfig::load(path)?))
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.manager.registry()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.manager.subscribe()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every configured server concurrently.
    ///
    /// Returns the servers that failed (partial startup is OK).
    pub async fn connect_all(&self) -> Vec<(String, McpError)> {
        self.manager
            .connect_all()
            .await
            .into_iter()
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect()
    }

    pub async fn connect(&self, name: &str) -> Result<(), McpError> {
        self.manager.connect(name).await
    }

    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        self.manager.disconnect(name).await
    }

    pub async fn disconnect_all(&self) {
        self.manager.disconnect_all().await;
    }

    pub fn status(&self) -> Vec<ConnectionSnapshot> {
        self.manager.snapshots()
    }

    /// Connect `name` if it has no transport yet, then probe it once.
    pub async fn test_server(&self, name: &str) -> Result<ConnectionSnapshot, McpError> {
        if !self.manager.state(name)?.has_transport() {
            self.manager.connect(name).await?;
        }
        self.manager.check_health(name).await?;
        self.manager.snapshot(name)
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Tools of one server, or of every connected server. Stale sets are
    /// returned as-is while a background refresh runs.
    pub fn tools(&self, server: Option<&str>) -> Vec<ToolDescriptor> {
        self.refresh_stale(server);
        self.registry().list(server)
    }

    pub fn search(&self, query: &str) -> Vec<ToolDescriptor> {
        self.manager.refresh_stale();
        self.registry().search(query)
    }

    pub fn describe(&self, tool: &str, server: Option<&str>) -> Result<ToolDescriptor, McpError> {
        self.refresh_stale(server);
        self.registry().resolve(tool, server)
    }

    fn refresh_stale(&self, server: Option<&str>) {
        match server {
            Some(name) => {
                self.manager.refresh_if_stale(name);
            }
            None => {
                self.manager.refresh_stale();
            }
        }
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    pub async fn invoke(&self, invocation: ToolInvocation) -> ToolResult {
        self.engine.invoke(invocation).await
    }

    pub async fn batch_invoke(&self, invocations: Vec<ToolInvocation>) -> Vec<ToolResult> {
        self.engine.batch_invoke(invocations).await
    }

    pub async fn test_tool(&self, tool: &str, server: Option<&str>) -> ToolResult {
        self.engine.test_tool(tool, server).await
    }

    pub fn stats(&self) -> ExecutionStats {
        self.engine.stats()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
