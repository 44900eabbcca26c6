//! Connection lifecycle management.
//!
//! One state machine per configured server:
//!
//! ```text
//! Disconnected ──connect──▶ Connecting ──open ok──▶ Connected ◀──probe ok── Degraded
//!                               │                      │                      │
//!                               └──N attempts failed──▶ Failed ◀─K failures───┘
//!                                                        │
//!                              cooldown / manual reset ──┘──▶ Connecting
//! ```
//!
//! Any state moves to `Disconnected` on an explicit disconnect. Reconnects
//! for one server are serialized through a per-server gate: explicit
//! connects wait on it, automatic reconnects skip when it is held. Tool
//! discovery runs under the same gate, after `Connected` is reached.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::backoff::Backoff;
use super::config::{ClientSettings, McpConfig, RetryPolicy, ServerConfig, TransportKind};
use super::discovery::discover_tools;
use super::errors::McpError;
use super::locks::{lock, read, write};
use super::registry::ToolRegistry;
use super::transport::{request, Transport, TransportFactory};
use super::types::ConnectionState;

/// Capacity of the state-change broadcast channel.
const EVENT_CAPACITY: usize = 64;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A state transition, as broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    pub server: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Point-in-time view of one connection, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSnapshot {
    pub name: String,
    pub kind: TransportKind,
    pub endpoint: String,
    pub state: ConnectionState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub last_connected: Option<DateTime<Utc>>,
    pub tool_count: usize,
}

// ─── ManagedConnection ───────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ServerStatus {
    state: ConnectionState,
    last_error: Option<String>,
    /// Failed round-trips (probes or invocations) since the last success.
    consecutive_failures: u32,
    last_connected: Option<DateTime<Utc>>,
}

struct ManagedConnection {
    config: ServerConfig,
    retry: RetryPolicy,
    status: RwLock<ServerStatus>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    /// Held for the duration of any connect or discovery.
    gate: tokio::sync::Mutex<()>,
    backoff: Mutex<Backoff>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedConnection {
    fn state(&self) -> ConnectionState {
        read(&self.status).state
    }

    fn take_transport(&self) -> Option<Arc<dyn Transport>> {
        write(&self.transport).take()
    }
}

struct Inner {
    settings: ClientSettings,
    connections: BTreeMap<String, ManagedConnection>,
    registry: Arc<ToolRegistry>,
    factory: Arc<dyn TransportFactory>,
    events: broadcast::Sender<StateChange>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for conn in self.connections.values() {
            if let Some(handle) = lock(&conn.supervisor).take() {
                handle.abort();
            }
        }
    }
}

// ─── ConnectionManager ───────────────────────────────────────────────────────

/// Owns every server's connection state. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        config: &McpConfig,
        registry: Arc<ToolRegistry>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let connections = config
            .servers
            .iter()
            .map(|(name, server)| {
                let retry = server.retry_policy(&config.settings);
                let conn = ManagedConnection {
                    config: server.clone(),
                    retry,
                    status: RwLock::new(ServerStatus::default()),
                    transport: RwLock::new(None),
                    gate: tokio::sync::Mutex::new(()),
                    backoff: Mutex::new(Backoff::from_policy(&retry)),
                    supervisor: Mutex::new(None),
                };
                (name.clone(), conn)
            })
            .collect();

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings: config.settings.clone(),
                connections,
                registry,
                factory,
                events,
            }),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.inner.registry
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    pub fn server_names(&self) -> Vec<String> {
        self.inner.connections.keys().cloned().collect()
    }

    pub fn server_config(&self, name: &str) -> Result<&ServerConfig, McpError> {
        Ok(&self.conn(name)?.config)
    }

    /// Retry policy in force for a server.
    pub fn retry_policy(&self, name: &str) -> Result<RetryPolicy, McpError> {
        Ok(self.conn(name)?.retry)
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.inner.events.subscribe()
    }

    pub fn state(&self, name: &str) -> Result<ConnectionState, McpError> {
        Ok(self.conn(name)?.state())
    }

    pub fn snapshot(&self, name: &str) -> Result<ConnectionSnapshot, McpError> {
        let conn = self.conn(name)?;
        let status = read(&conn.status);
        Ok(ConnectionSnapshot {
            name: name.to_string(),
            kind: conn.config.kind(),
            endpoint: conn.config.endpoint(),
            state: status.state,
            last_error: status.last_error.clone(),
            consecutive_failures: status.consecutive_failures,
            last_connected: status.last_connected,
            tool_count: self
                .inner
                .registry
                .tool_set(name)
                .map_or(0, |set| set.len()),
        })
    }

    /// Snapshots for every server, in name order.
    pub fn snapshots(&self) -> Vec<ConnectionSnapshot> {
        self.inner
            .connections
            .keys()
            .filter_map(|name| self.snapshot(name).ok())
            .collect()
    }

    /// Transport of a `Connected` server.
    pub fn connected_transport(&self, name: &str) -> Result<Arc<dyn Transport>, McpError> {
        self.transport_if(name, |state| state == ConnectionState::Connected)
    }

    /// Transport of a server that still has one (`Connected` or `Degraded`).
    pub fn usable_transport(&self, name: &str) -> Result<Arc<dyn Transport>, McpError> {
        self.transport_if(name, ConnectionState::has_transport)
    }

    fn transport_if(
        &self,
        name: &str,
        accept: impl Fn(ConnectionState) -> bool,
    ) -> Result<Arc<dyn Transport>, McpError> {
        let conn = self.conn(name)?;
        let state = conn.state();
        let unavailable = || McpError::ServerUnavailable {
            name: name.to_string(),
            state,
        };
        if !accept(state) {
            return Err(unavailable());
        }
        read(&conn.transport).clone().ok_or_else(unavailable)
    }

    fn conn(&self, name: &str) -> Result<&ManagedConnection, McpError> {
        self.inner
            .connections
            .get(name)
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })
    }

    // ─── Connect / Disconnect ────────────────────────────────────────────

    /// Connect a server, retrying with backoff. Waits for any connect
    /// already in flight for the same server. A no-op when the server
    /// already has a transport.
    pub async fn connect(&self, name: &str) -> Result<(), McpError> {
        let conn = self.conn(name)?;
        let _gate = conn.gate.lock().await;
        let result = self.connect_locked(conn).await;
        self.ensure_supervisor(name);
        result
    }

    /// Connect every configured server concurrently. Partial success is
    /// fine; each server's outcome is reported.
    pub async fn connect_all(&self) -> Vec<(String, Result<(), McpError>)> {
        let names = self.server_names();
        let results =
            futures::future::join_all(names.iter().map(|name| self.connect(name))).await;
        names.into_iter().zip(results).collect()
    }

    /// Manually reset a server: drop whatever connection it has and connect
    /// again. This is the way out of `Failed`.
    pub async fn reset(&self, name: &str) -> Result<(), McpError> {
        if self.state(name)? != ConnectionState::Failed {
            self.disconnect(name).await?;
        }
        self.connect(name).await
    }

    async fn connect_locked(&self, conn: &ManagedConnection) -> Result<(), McpError> {
        let name = conn.config.name.as_str();
        let state = conn.state();
        if state.has_transport() {
            return Ok(());
        }
        self.transition(conn, ConnectionState::Connecting);

        let max_attempts = conn.retry.max_attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=max_attempts {
            let transport = self.inner.factory.create(&conn.config);
            match transport.open().await {
                Ok(init) => {
                    lock(&conn.backoff).reset();
                    *write(&conn.transport) = Some(transport.clone());
                    {
                        let mut status = write(&conn.status);
                        status.consecutive_failures = 0;
                        status.last_error = None;
                        status.last_connected = Some(Utc::now());
                    }
                    tracing::info!(
                        server = %name,
                        attempt,
                        server_info = ?init.server_info.as_ref().and_then(|s| s.name.as_deref()),
                        "connected"
                    );
                    self.transition(conn, ConnectionState::Connected);

                    // Left without a tool set; the next lookup or probe retries discovery.
                    if let Err(e) = self.discover(conn, transport.as_ref()).await {
                        tracing::warn!(server = %name, error = %e, "tool discovery failed");
                        write(&conn.status).last_error = Some(e.to_string());
                    }
                    return Ok(());
                }
                Err(e) => {
                    transport.close().await;
                    last_reason = match &e {
                        McpError::Transport { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    };
                    write(&conn.status).last_error = Some(last_reason.clone());
                    let delay = lock(&conn.backoff).next_delay();
                    if attempt < max_attempts {
                        tracing::warn!(
                            server = %name,
                            attempt,
                            max_attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %last_reason,
                            "connect failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        tracing::error!(server = %name, attempts = max_attempts, error = %last_reason, "giving up on server");
        self.transition(conn, ConnectionState::Failed);
        Err(McpError::ReconnectExhausted {
            name: name.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }

    /// Move a server to `Disconnected` and close its transport. Idempotent.
    pub async fn disconnect(&self, name: &str) -> Result<(), McpError> {
        let conn = self.conn(name)?;
        if let Some(handle) = lock(&conn.supervisor).take() {
            handle.abort();
        }
        let _gate = conn.gate.lock().await;
        self.transition(conn, ConnectionState::Disconnected);
        if let Some(transport) = conn.take_transport() {
            transport.close().await;
            tracing::info!(server = %name, "transport closed");
        }
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let names = self.server_names();
        futures::future::join_all(names.iter().map(|name| self.disconnect(name))).await;
    }

    // ─── State Machine ───────────────────────────────────────────────────

    /// Apply a transition if the state machine allows it. Leaving
    /// `Connected` evicts the server's tools under the same lock that
    /// guards publishing.
    fn transition(&self, conn: &ManagedConnection, to: ConnectionState) -> bool {
        let name = conn.config.name.as_str();
        let from = {
            let mut status = write(&conn.status);
            let from = status.state;
            if from == to {
                return true;
            }
            if !from.can_transition_to(to) {
                tracing::warn!(server = %name, %from, %to, "rejected invalid state transition");
                return false;
            }
            status.state = to;
            if from == ConnectionState::Connected {
                self.inner.registry.evict(name);
            }
            from
        };

        tracing::info!(server = %name, %from, %to, "connection state changed");
        let _ = self.inner.events.send(StateChange {
            server: name.to_string(),
            from,
            to,
        });
        true
    }

    /// Count a failed round-trip. `Connected` becomes `Degraded`; a
    /// `Degraded` server that reaches the failure threshold becomes `Failed`
    /// and loses its transport.
    pub(crate) async fn record_failure(&self, name: &str, reason: &str) {
        let Ok(conn) = self.conn(name) else {
            return;
        };
        let failures = {
            let mut status = write(&conn.status);
            status.consecutive_failures = status.consecutive_failures.saturating_add(1);
            status.last_error = Some(reason.to_string());
            status.consecutive_failures
        };

        match conn.state() {
            ConnectionState::Connected => {
                tracing::warn!(server = %name, failures, error = %reason, "round-trip failed");
                self.transition(conn, ConnectionState::Degraded);
            }
            ConnectionState::Degraded if failures >= self.inner.settings.health_failure_threshold => {
                tracing::error!(server = %name, failures, error = %reason, "failure threshold reached");
                if self.transition(conn, ConnectionState::Failed) {
                    if let Some(transport) = conn.take_transport() {
                        transport.close().await;
                    }
                }
            }
            _ => {}
        }
    }

    /// Count a successful round-trip. A `Degraded` server recovers to
    /// `Connected` and its tools are re-discovered.
    pub(crate) async fn record_success(&self, name: &str) {
        let Ok(conn) = self.conn(name) else {
            return;
        };
        write(&conn.status).consecutive_failures = 0;

        if conn.state() == ConnectionState::Degraded && self.transition(conn, ConnectionState::Connected) {
            if let Err(e) = self.refresh(name).await {
                tracing::warn!(server = %name, error = %e, "re-discovery after recovery failed");
            }
        }
    }

    // ─── Discovery ───────────────────────────────────────────────────────

    /// Run discovery and publish the result if the server is still
    /// `Connected`. Caller holds the gate.
    async fn discover(
        &self,
        conn: &ManagedConnection,
        transport: &dyn Transport,
    ) -> Result<usize, McpError> {
        let tools = discover_tools(transport, conn.config.call_timeout).await?;
        let count = tools.len();

        let status = read(&conn.status);
        if status.state == ConnectionState::Connected {
            self.inner.registry.publish(&conn.config.name, tools);
            Ok(count)
        } else {
            tracing::debug!(server = %conn.config.name, state = %status.state, "discarding discovery result");
            Ok(0)
        }
    }

    /// Re-discover one server's tools now. Skips (returning `Ok(0)`) when a
    /// connect or another refresh of the same server is in flight.
    pub async fn refresh(&self, name: &str) -> Result<usize, McpError> {
        let conn = self.conn(name)?;
        let Some(_claim) = self.inner.registry.begin_refresh(name) else {
            return Ok(0);
        };
        let Ok(_gate) = conn.gate.try_lock() else {
            return Ok(0);
        };
        let transport = self.connected_transport(name)?;
        self.discover(conn, transport.as_ref()).await
    }

    /// Spawn a background refresh for every server that needs one. Readers
    /// keep the stale set until the new one lands.
    pub fn refresh_stale(&self) -> Vec<JoinHandle<()>> {
        self.inner
            .connections
            .values()
            .filter(|conn| self.needs_refresh(conn))
            .map(|conn| self.spawn_refresh(conn.config.name.clone()))
            .collect()
    }

    /// Spawn a background refresh for `name` if it needs one.
    pub fn refresh_if_stale(&self, name: &str) -> Option<JoinHandle<()>> {
        let conn = self.conn(name).ok()?;
        self.needs_refresh(conn)
            .then(|| self.spawn_refresh(name.to_string()))
    }

    /// A `Connected` server needs discovery when its set outlived the TTL,
    /// or when it has no set at all because the last discovery failed.
    fn needs_refresh(&self, conn: &ManagedConnection) -> bool {
        let name = conn.config.name.as_str();
        conn.state() == ConnectionState::Connected
            && (self.inner.registry.tool_set(name).is_none() || self.inner.registry.is_stale(name))
    }

    fn spawn_refresh(&self, name: String) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager.refresh(&name).await {
                Ok(count) => tracing::debug!(server = %name, count, "ttl refresh done"),
                Err(e) => tracing::warn!(server = %name, error = %e, "ttl refresh failed"),
            }
        })
    }

    // ─── Health ──────────────────────────────────────────────────────────

    /// Send one `ping` and feed the outcome into the state machine.
    /// Servers without a transport are left alone.
    pub async fn check_health(&self, name: &str) -> Result<ConnectionState, McpError> {
        let conn = self.conn(name)?;
        let Ok(transport) = self.usable_transport(name) else {
            return Ok(conn.state());
        };

        match request(transport.as_ref(), "ping", None, conn.config.call_timeout).await {
            // Any reply, even a JSON-RPC error, proves the peer is alive.
            Ok(_) => self.record_success(name).await,
            Err(e) => {
                let reason = format!("health check failed: {e}");
                self.record_failure(name, &reason).await;
            }
        }
        Ok(conn.state())
    }

    /// Probe every server that has a transport.
    pub async fn check_all(&self) -> Vec<(String, ConnectionState)> {
        let names = self.server_names();
        let states =
            futures::future::join_all(names.iter().map(|name| self.check_health(name))).await;
        names
            .into_iter()
            .zip(states)
            .filter_map(|(name, state)| state.ok().map(|s| (name, s)))
            .collect()
    }

    /// Cooldown retry out of `Failed`. Skips if a connect is in flight.
    async fn auto_reconnect(&self, name: &str) {
        let Ok(conn) = self.conn(name) else {
            return;
        };
        let Ok(_gate) = conn.gate.try_lock() else {
            tracing::debug!(server = %name, "reconnect already in flight");
            return;
        };
        if conn.state() != ConnectionState::Failed {
            return;
        }
        tracing::info!(server = %name, "cooldown elapsed, reconnecting");
        if let Err(e) = self.connect_locked(conn).await {
            tracing::warn!(server = %name, error = %e, "scheduled reconnect failed");
        }
    }

    fn ensure_supervisor(&self, name: &str) {
        let Ok(conn) = self.conn(name) else {
            return;
        };
        let mut slot = lock(&conn.supervisor);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *slot = Some(tokio::spawn(supervise(
            Arc::downgrade(&self.inner),
            name.to_string(),
            self.inner.settings.health_check_interval,
            self.inner.settings.reconnect_cooldown,
        )));
    }
}

/// Per-server background loop: probes health while a transport exists,
/// retries after a cooldown while `Failed`. Holds only a weak reference so
/// it never keeps the manager alive.
async fn supervise(inner: Weak<Inner>, name: String, interval: Duration, cooldown: Duration) {
    loop {
        let wait = {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match inner.connections.get(&name).map(ManagedConnection::state) {
                Some(ConnectionState::Failed) => cooldown,
                Some(_) => interval,
                None => return,
            }
        };
        tokio::time::sleep(wait).await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let manager = ConnectionManager { inner };
        match manager.state(&name) {
            Ok(ConnectionState::Connected | ConnectionState::Degraded) => {
                if let Ok(state) = manager.check_health(&name).await {
                    tracing::debug!(server = %name, %state, "health probe");
                }
                manager.refresh_if_stale(&name);
            }
            Ok(ConnectionState::Failed) => manager.auto_reconnect(&name).await,
            Ok(ConnectionState::Disconnected | ConnectionState::Connecting) => {}
            Err(_) => return,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::transport::testing::{test_config, ScriptedFactory, ScriptedTransport};
    use serde_json::json;

    fn memory_transport() -> Arc<ScriptedTransport> {
        Arc::new(
            ScriptedTransport::new("memory")
                .with_tool("store_value", "Store a value", json!({"type": "object"}))
                .with_tool("get_value", "Read a value", json!({"type": "object"})),
        )
    }

    fn manager_with(
        transport: Arc<ScriptedTransport>,
        overrides: serde_json::Value,
    ) -> ConnectionManager {
        let config = test_config(&["memory"], overrides);
        let registry = Arc::new(ToolRegistry::new(config.settings.tool_cache_ttl));
        let factory = Arc::new(ScriptedFactory::new().with(transport));
        ConnectionManager::new(&config, registry, factory)
    }

    #[tokio::test]
    async fn test_connect_publishes_tools() {
        let t = memory_transport();
        let m = manager_with(t.clone(), json!({}));
        let mut events = m.subscribe();

        m.connect("memory").await.unwrap();
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Connected);
        assert_eq!(m.registry().tool_set("memory").unwrap().len(), 2);
        assert_eq!(t.opens(), 1);

        let first = events.recv().await.unwrap();
        assert_eq!(
            (first.from, first.to),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
        );
        let second = events.recv().await.unwrap();
        assert_eq!(second.to, ConnectionState::Connected);

        let snap = m.snapshot("memory").unwrap();
        assert_eq!(snap.tool_count, 2);
        assert!(snap.last_connected.is_some());
    }

    #[tokio::test]
    async fn test_connect_exhausts_attempts() {
        let t = memory_transport();
        t.fail_opens(5);
        let m = manager_with(t.clone(), json!({"retry_attempts": 3}));

        match m.connect("memory").await {
            Err(McpError::ReconnectExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ReconnectExhausted, got {other:?}"),
        }
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Failed);
        assert_eq!(t.opens(), 3);
        // Every failed open is closed.
        assert_eq!(t.closes(), 3);
        assert!(m.registry().is_empty());
        assert!(m.snapshot("memory").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_connect_recovers_within_attempts() {
        let t = memory_transport();
        t.fail_opens(2);
        let m = manager_with(t.clone(), json!({"retry_attempts": 3}));

        m.connect("memory").await.unwrap();
        assert_eq!(t.opens(), 3);
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Connected);
        assert_eq!(lock(&m.conn("memory").unwrap().backoff).failures(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_connects_are_serialized() {
        let t = memory_transport();
        let m = manager_with(t.clone(), json!({}));

        let (a, b) = tokio::join!(m.connect("memory"), m.connect("memory"));
        a.unwrap();
        b.unwrap();
        assert_eq!(t.opens(), 1);
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let m = manager_with(memory_transport(), json!({}));
        assert!(matches!(
            m.connect("nope").await,
            Err(McpError::UnknownServer { .. })
        ));
    }

    #[tokio::test]
    async fn test_health_degrades_and_recovers() {
        let t = memory_transport();
        let m = manager_with(t.clone(), json!({}));
        m.connect("memory").await.unwrap();

        t.set_healthy(false);
        assert_eq!(m.check_health("memory").await.unwrap(), ConnectionState::Degraded);
        // Tools leave the queryable set as soon as the server is not Connected.
        assert!(m.registry().tool_set("memory").is_none());
        assert!(m.connected_transport("memory").is_err());
        assert!(m.usable_transport("memory").is_ok());

        t.set_healthy(true);
        assert_eq!(m.check_health("memory").await.unwrap(), ConnectionState::Connected);
        assert_eq!(m.registry().tool_set("memory").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_consecutive_failures_reach_failed() {
        let t = memory_transport();
        let m = manager_with(t.clone(), json!({"health_failure_threshold": 3}));
        m.connect("memory").await.unwrap();

        t.set_healthy(false);
        m.check_health("memory").await.unwrap();
        m.check_health("memory").await.unwrap();
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Degraded);
        m.check_health("memory").await.unwrap();
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Failed);

        assert_eq!(t.closes(), 1);
        assert!(m.usable_transport("memory").is_err());
        assert_eq!(m.registry().last_known("memory").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reset_leaves_failed() {
        let t = memory_transport();
        t.fail_opens(3);
        let m = manager_with(t.clone(), json!({"retry_attempts": 3}));
        assert!(m.connect("memory").await.is_err());

        m.reset("memory").await.unwrap();
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_disconnect_closes_and_evicts() {
        let t = memory_transport();
        let m = manager_with(t.clone(), json!({}));
        m.connect("memory").await.unwrap();

        m.disconnect("memory").await.unwrap();
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Disconnected);
        assert_eq!(t.closes(), 1);
        assert!(m.registry().tool_set("memory").is_none());

        m.disconnect("memory").await.unwrap();
        assert_eq!(t.closes(), 1);
    }

    #[tokio::test]
    async fn test_refresh_swaps_tool_set() {
        let t = memory_transport();
        let m = manager_with(t.clone(), json!({}));
        m.connect("memory").await.unwrap();

        t.set_tools(vec![json!({"name": "delete_value", "inputSchema": {"type": "object"}})]);
        assert_eq!(m.refresh("memory").await.unwrap(), 1);
        let set = m.registry().tool_set("memory").unwrap();
        assert_eq!(set.tools[0].name, "delete_value");
    }

    #[tokio::test]
    async fn test_failed_discovery_is_retried() {
        let t = memory_transport();
        t.fail_lists(1);
        let m = manager_with(t.clone(), json!({}));

        m.connect("memory").await.unwrap();
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Connected);
        assert!(m.registry().tool_set("memory").is_none());
        assert!(m.snapshot("memory").unwrap().last_error.is_some());

        let handles = m.refresh_stale();
        assert_eq!(handles.len(), 1);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(m.registry().tool_set("memory").unwrap().len(), 2);
        // Once published, the set is fresh again.
        assert!(m.refresh_if_stale("memory").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_retries_failed_discovery() {
        let t = memory_transport();
        t.fail_lists(1);
        let m = manager_with(t.clone(), json!({"health_check_interval": 1}));

        m.connect("memory").await.unwrap();
        assert!(m.registry().tool_set("memory").is_none());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Connected);
        assert_eq!(m.registry().tool_set("memory").unwrap().len(), 2);
        assert!(m.registry().resolve("store_value", None).is_ok());
    }

    #[tokio::test]
    async fn test_refresh_stale_uses_ttl() {
        let t = memory_transport();
        let config = test_config(&["memory"], json!({}));
        let registry = Arc::new(ToolRegistry::new(Duration::ZERO));
        let m = ConnectionManager::new(
            &config,
            registry,
            Arc::new(ScriptedFactory::new().with(t.clone())),
        );
        m.connect("memory").await.unwrap();

        t.set_tools(vec![json!({"name": "fresh_tool"})]);
        for handle in m.refresh_stale() {
            handle.await.unwrap();
        }
        assert!(m.registry().resolve("fresh_tool", None).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_fails_then_reconnects_after_cooldown() {
        let t = memory_transport();
        let m = manager_with(
            t.clone(),
            json!({
                "health_check_interval": 1,
                "health_failure_threshold": 2,
                "reconnect_cooldown": 2
            }),
        );
        m.connect("memory").await.unwrap();
        t.set_healthy(false);

        // Probes at t=1s (Degraded) and t=2s (Failed).
        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Failed);

        // Cooldown ends at t=4s.
        t.set_healthy(true);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(m.state("memory").unwrap(), ConnectionState::Connected);
        assert_eq!(t.opens(), 2);
    }
}
