//! Execution engine — resolves, validates and dispatches tool calls.
//!
//! `invoke` never returns `Err`: every outcome, including resolution and
//! validation failures, comes back as a [`ToolResult`] so batch callers can
//! correlate by index. Only transport faults are retried; timeouts, JSON-RPC
//! errors and tool-reported failures go straight back to the caller.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use super::backoff::Backoff;
use super::errors::McpError;
use super::lifecycle::ConnectionManager;
use super::locks::lock;
use super::transport::{request, Transport};
use super::types::{
    extract_result, ConnectionState, ToolDescriptor, ToolInvocation, ToolResult,
};
use super::validation::{sample_params, validate_params};

// ─── Stats ───────────────────────────────────────────────────────────────────

/// In-memory invocation counters. Not persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_time_ms: u64,
    pub by_server: BTreeMap<String, u64>,
    pub by_tool: BTreeMap<String, u64>,
}

impl ExecutionStats {
    pub fn average_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_time_ms as f64 / self.total as f64
        }
    }

    fn record(&mut self, result: &ToolResult) {
        self.total += 1;
        if result.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_time_ms += result.execution_time_ms;
        if let Some(server) = &result.server_name {
            *self.by_server.entry(server.clone()).or_default() += 1;
        }
        *self.by_tool.entry(result.tool_name.clone()).or_default() += 1;
    }
}

// ─── ExecutionEngine ─────────────────────────────────────────────────────────

pub struct ExecutionEngine {
    manager: ConnectionManager,
    max_concurrency: usize,
    stats: Mutex<ExecutionStats>,
}

impl ExecutionEngine {
    pub fn new(manager: ConnectionManager) -> Self {
        let max_concurrency = manager.settings().max_concurrency.max(1);
        Self {
            manager,
            max_concurrency,
            stats: Mutex::new(ExecutionStats::default()),
        }
    }

    pub fn stats(&self) -> ExecutionStats {
        lock(&self.stats).clone()
    }

    /// Run one invocation to completion.
    pub async fn invoke(&self, invocation: ToolInvocation) -> ToolResult {
        let start = Instant::now();
        let result = self.run(&invocation, start).await;

        if result.success {
            tracing::info!(
                tool = %result.tool_name,
                server = result.server_name.as_deref().unwrap_or("-"),
                attempts = result.attempts,
                elapsed_ms = result.execution_time_ms,
                "tool call succeeded"
            );
        } else {
            tracing::warn!(
                tool = %result.tool_name,
                server = result.server_name.as_deref().unwrap_or("-"),
                attempts = result.attempts,
                elapsed_ms = result.execution_time_ms,
                error = %result.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                "tool call failed"
            );
        }
        lock(&self.stats).record(&result);
        result
    }

    async fn run(&self, invocation: &ToolInvocation, start: Instant) -> ToolResult {
        let tool = invocation.tool.as_str();
        let elapsed = || start.elapsed().as_millis() as u64;

        // 1. Resolve
        let descriptor = match self.resolve(invocation) {
            Ok(d) => d,
            Err(e) => return ToolResult::failure(tool, invocation.server.clone(), e, elapsed(), 0),
        };
        let server = descriptor.server.clone();
        if let Err(e) = self.manager.connected_transport(&server) {
            return ToolResult::failure(tool, Some(server), e, elapsed(), 0);
        }

        // 2. Validate, before any transport traffic
        if let Err(e) = validate_params(&descriptor, &invocation.params) {
            return ToolResult::failure(tool, Some(server), e, elapsed(), 0);
        }
        self.manager.refresh_if_stale(&server);

        let (timeout, policy) = match (
            self.manager.server_config(&server),
            self.manager.retry_policy(&server),
        ) {
            (Ok(config), Ok(policy)) => (invocation.timeout.unwrap_or(config.call_timeout), policy),
            (Err(e), _) | (_, Err(e)) => {
                return ToolResult::failure(tool, Some(server), e, elapsed(), 0)
            }
        };

        // 3-4. Dispatch, retrying transport faults only
        let mut backoff = Backoff::from_policy(&policy);
        let mut attempts = 0;
        let outcome = loop {
            let transport = match self.manager.usable_transport(&server) {
                Ok(t) => t,
                Err(e) => break Err(e),
            };
            attempts += 1;

            match call_once(transport.as_ref(), &descriptor.name, &invocation.params, timeout).await {
                Ok(payload) => {
                    self.manager.record_success(&server).await;
                    break Ok(payload);
                }
                Err(McpError::Timeout { timeout_ms, .. }) => {
                    break Err(McpError::ExecutionTimeout {
                        tool: descriptor.name.clone(),
                        timeout_ms,
                    });
                }
                Err(e) if e.is_retriable() => {
                    self.manager.record_failure(&server, &e.to_string()).await;
                    if attempts >= policy.max_attempts {
                        break Err(e);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        tool = %descriptor.name,
                        server = %server,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // The server answered; the connection is fine.
                    self.manager.record_success(&server).await;
                    break Err(e);
                }
            }
        };

        // 5. Result
        match outcome {
            Ok(payload) if is_tool_error(&payload) => {
                let error = McpError::ToolFailed {
                    tool: descriptor.name.clone(),
                    message: content_text(&payload),
                };
                let mut result = ToolResult::failure(tool, Some(server), error, elapsed(), attempts);
                result.result = Some(payload);
                result
            }
            Ok(payload) => ToolResult {
                tool_name: tool.to_string(),
                server_name: Some(server),
                success: true,
                result: Some(payload),
                error: None,
                execution_time_ms: elapsed(),
                attempts,
            },
            Err(e) => ToolResult::failure(tool, Some(server), e, elapsed(), attempts),
        }
    }

    /// Resolve through the registry. A tool that is only known from an
    /// evicted set reports its server as unavailable instead of missing.
    fn resolve(&self, invocation: &ToolInvocation) -> Result<ToolDescriptor, McpError> {
        let registry = self.manager.registry();
        let pinned = invocation.server.as_deref();

        match registry.resolve(&invocation.tool, pinned) {
            Err(McpError::ToolNotFound { name, suggestions }) => {
                let owner = match pinned {
                    Some(server) => {
                        self.manager.state(server)?;
                        Some(server.to_string())
                    }
                    None => registry.last_known_owner(&invocation.tool, None),
                };
                if let Some(owner) = owner {
                    let state = self.manager.state(&owner)?;
                    if state != ConnectionState::Connected {
                        return Err(McpError::ServerUnavailable { name: owner, state });
                    }
                }
                Err(McpError::ToolNotFound { name, suggestions })
            }
            other => other,
        }
    }

    /// Run invocations concurrently, at most `max_concurrency` at a time.
    /// Results come back in input order.
    pub async fn batch_invoke(&self, invocations: Vec<ToolInvocation>) -> Vec<ToolResult> {
        let batch_id = Uuid::new_v4();
        let size = invocations.len();
        let span = tracing::info_span!("batch", batch_id = %batch_id, size);

        async move {
            tracing::info!(concurrency = self.max_concurrency, "batch started");
            // Results arrive in completion order.
            let mut finished: Vec<(usize, ToolResult)> =
                futures::stream::iter(invocations.into_iter().enumerate())
                    .map(|(index, invocation)| async move { (index, self.invoke(invocation).await) })
                    .buffer_unordered(self.max_concurrency)
                    .collect()
                    .await;
            finished.sort_by_key(|(index, _)| *index);
            let results: Vec<ToolResult> = finished.into_iter().map(|(_, r)| r).collect();
            let failed = results.iter().filter(|r| !r.success).count();
            tracing::info!(failed, "batch finished");
            results
        }
        .instrument(span)
        .await
    }

    /// Smoke-test a tool with parameters generated from its schema.
    pub async fn test_tool(&self, tool: &str, server: Option<&str>) -> ToolResult {
        let params = self
            .manager
            .registry()
            .resolve(tool, server)
            .map(|d| sample_params(&d.input_schema))
            .unwrap_or_default();

        let mut invocation = ToolInvocation::new(tool, params);
        if let Some(server) = server {
            invocation = invocation.on_server(server);
        }
        self.invoke(invocation).await
    }
}

async fn call_once(
    transport: &dyn Transport,
    tool: &str,
    params: &Map<String, Value>,
    timeout: Duration,
) -> Result<Value, McpError> {
    let body = serde_json::json!({
        "name": tool,
        "arguments": params,
    });
    let response = request(transport, "tools/call", Some(body), timeout).await?;
    extract_result(response)
}

fn is_tool_error(payload: &Value) -> bool {
    payload.get("isError").and_then(Value::as_bool) == Some(true)
}

/// Text parts of an MCP `content` array, joined; the raw payload otherwise.
fn content_text(payload: &Value) -> String {
    let texts: Vec<&str> = payload
        .get("content")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|i| i.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|i| i.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if texts.is_empty() {
        payload.to_string()
    } else {
        texts.join("\n")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
