//! In-memory scripted transport for unit tests.
//!
//! Answers `initialize`, `ping`, `tools/list` and `tools/call` without any
//! I/O, replays scripted outcomes for tool calls and counts every
//! open/send/call/close so tests can assert on transport traffic.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Transport, TransportFactory};
use crate::mcp_client::config::{McpConfig, ServerConfig, TransportKind};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{
    error_codes, InitializeResult, JsonRpcError, JsonRpcRequest, JsonRpcResponse, PROTOCOL_VERSION,
};

/// What a scripted `tools/call` does.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// Reply with this `result` payload.
    Ok(Value),
    /// Fail the write, as a broken pipe would.
    TransportFailure(String),
    /// Never reply.
    Hang,
    /// Reply with `result` after a delay.
    Delay(Duration, Value),
    /// Reply with a JSON-RPC error object.
    RpcError(i32, String),
    /// Reply with `isError: true` and this text.
    ToolError(String),
}

enum Pending {
    Reply(JsonRpcResponse),
    Hang,
    Delay(Duration, JsonRpcResponse),
}

pub struct ScriptedTransport {
    name: String,
    open: AtomicBool,
    healthy: AtomicBool,
    opens: AtomicU32,
    sends: AtomicU32,
    calls: AtomicU32,
    closes: AtomicU32,
    open_failures: Mutex<VecDeque<String>>,
    list_failures: AtomicU32,
    tools: Mutex<Vec<Value>>,
    page_size: Mutex<Option<usize>>,
    script: Mutex<VecDeque<CallOutcome>>,
    methods: Mutex<Vec<String>>,
    pending: Mutex<HashMap<u64, (String, Pending)>>,
}

impl ScriptedTransport {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            open: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            opens: AtomicU32::new(0),
            sends: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            open_failures: Mutex::new(VecDeque::new()),
            list_failures: AtomicU32::new(0),
            tools: Mutex::new(Vec::new()),
            page_size: Mutex::new(None),
            script: Mutex::new(VecDeque::new()),
            methods: Mutex::new(Vec::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Add a tool with the given input schema to the `tools/list` reply.
    pub fn with_tool(self, name: &str, description: &str, schema: Value) -> Self {
        self.tools.lock().unwrap().push(json!({
            "name": name,
            "description": description,
            "inputSchema": schema,
        }));
        self
    }

    /// Serve `tools/list` in pages of `size`.
    pub fn with_page_size(self, size: usize) -> Self {
        *self.page_size.lock().unwrap() = Some(size);
        self
    }

    /// Replace the advertised tool list (raw `tools/list` entries).
    pub fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().unwrap() = tools;
    }

    /// Queue outcomes for the next `tools/call` requests, in order.
    pub fn script_calls(&self, outcomes: impl IntoIterator<Item = CallOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    /// Make the next `n` opens fail.
    pub fn fail_opens(&self, n: usize) {
        let mut failures = self.open_failures.lock().unwrap();
        for i in 0..n {
            failures.push_back(format!("scripted open failure {}", i + 1));
        }
    }

    /// Make the next `n` `tools/list` requests fail at the write.
    pub fn fail_lists(&self, n: u32) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    /// Whether `ping` succeeds.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    /// Number of `tools/call` requests sent.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    /// Methods of every request and notification, in send order.
    pub fn methods(&self) -> Vec<String> {
        self.methods.lock().unwrap().clone()
    }

    fn list_tools(&self, params: Option<&Value>) -> Value {
        let tools = self.tools.lock().unwrap().clone();
        let Some(size) = *self.page_size.lock().unwrap() else {
            return json!({ "tools": tools });
        };
        let offset = params
            .and_then(|p| p.get("cursor"))
            .and_then(Value::as_str)
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        let end = (offset + size).min(tools.len());
        let page = tools[offset.min(end)..end].to_vec();
        if end < tools.len() {
            json!({ "tools": page, "nextCursor": end.to_string() })
        } else {
            json!({ "tools": page })
        }
    }

    fn call_tool(&self, id: u64, params: Option<&Value>) -> Result<Pending, McpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let tool = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            CallOutcome::Ok(json!({
                "content": [{"type": "text", "text": format!("called {tool}")}],
                "arguments": params.and_then(|p| p.get("arguments")).cloned(),
            }))
        });

        Ok(match outcome {
            CallOutcome::Ok(result) => Pending::Reply(JsonRpcResponse::success(id, result)),
            CallOutcome::TransportFailure(reason) => {
                return Err(McpError::transport(&self.name, reason));
            }
            CallOutcome::Hang => Pending::Hang,
            CallOutcome::Delay(d, result) => Pending::Delay(d, JsonRpcResponse::success(id, result)),
            CallOutcome::RpcError(code, message) => Pending::Reply(error_response(id, code, &message)),
            CallOutcome::ToolError(text) => Pending::Reply(JsonRpcResponse::success(
                id,
                json!({"content": [{"type": "text", "text": text}], "isError": true}),
            )),
        })
    }
}

fn error_response(id: u64, code: i32, message: &str) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0".into(),
        id,
        result: None,
        error: Some(JsonRpcError {
            code,
            message: message.to_string(),
            data: None,
        }),
        method: None,
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn server_name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<InitializeResult, McpError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.open_failures.lock().unwrap().pop_front() {
            return Err(McpError::transport(&self.name, reason));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(InitializeResult {
            protocol_version: Some(PROTOCOL_VERSION.into()),
            capabilities: json!({"tools": {}}),
            server_info: None,
        })
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<(), McpError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        self.methods.lock().unwrap().push(request.method.clone());
        let id = request.id;
        let params = request.params.as_ref();

        let pending = match request.method.as_str() {
            "initialize" => Pending::Reply(JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {"tools": {}},
                    "serverInfo": {"name": self.name, "version": "test"},
                }),
            )),
            "ping" => {
                if !self.healthy.load(Ordering::SeqCst) {
                    return Err(McpError::transport(&self.name, "ping failed"));
                }
                Pending::Reply(JsonRpcResponse::success(id, json!({})))
            }
            "tools/list" => {
                let failing = self
                    .list_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Err(McpError::transport(&self.name, "tools/list failed"));
                }
                Pending::Reply(JsonRpcResponse::success(id, self.list_tools(params)))
            }
            "tools/call" => self.call_tool(id, params)?,
            other => Pending::Reply(error_response(
                id,
                error_codes::METHOD_NOT_FOUND,
                &format!("method not found: {other}"),
            )),
        };
        self.pending
            .lock()
            .unwrap()
            .insert(id, (request.method, pending));
        Ok(())
    }

    async fn notify(&self, method: &str, _params: Option<Value>) -> Result<(), McpError> {
        self.methods.lock().unwrap().push(method.to_string());
        Ok(())
    }

    async fn receive(&self, id: u64, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let entry = self.pending.lock().unwrap().remove(&id);
        let Some((method, pending)) = entry else {
            return Err(McpError::transport(&self.name, format!("no request in flight with id {id}")));
        };
        let timed_out = || McpError::Timeout {
            server: self.name.clone(),
            method: method.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match pending {
            Pending::Reply(resp) => Ok(resp),
            Pending::Hang => {
                tokio::time::sleep(timeout).await;
                Err(timed_out())
            }
            Pending::Delay(delay, resp) => {
                if delay >= timeout {
                    tokio::time::sleep(timeout).await;
                    Err(timed_out())
                } else {
                    tokio::time::sleep(delay).await;
                    Ok(resp)
                }
            }
        }
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Hands out pre-built scripted transports by server name. Unknown names get
/// a fresh transport with no tools.
#[derive(Default)]
pub struct ScriptedFactory {
    transports: HashMap<String, Arc<ScriptedTransport>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, transport: Arc<ScriptedTransport>) -> Self {
        self.transports
            .insert(transport.server_name().to_string(), transport);
        self
    }
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, config: &ServerConfig) -> Arc<dyn Transport> {
        match self.transports.get(&config.name) {
            Some(t) => t.clone(),
            None => Arc::new(ScriptedTransport::new(&config.name)),
        }
    }
}

/// Config with one stdio entry per name and fast timings for tests.
/// `overrides` is merged into the top level (e.g. `{"retry_attempts": 2}`).
pub fn test_config(names: &[&str], overrides: Value) -> McpConfig {
    let mut doc = json!({
        "default_timeout": 500,
        "connect_timeout": 500,
        "retry_attempts": 3,
        "retry_delay_ms": 1,
        "retry_max_delay_ms": 4,
        "tool_cache_ttl": 300,
        "health_check_interval": 3600,
        "health_failure_threshold": 3,
        "reconnect_cooldown": 3600,
        "servers": {},
    });
    for name in names {
        doc["servers"][*name] = json!({"type": "stdio", "command": format!("{name}-server")});
    }
    if let Value::Object(extra) = overrides {
        for (k, v) in extra {
            doc[k] = v;
        }
    }
    McpConfig::from_json_str(&doc.to_string()).unwrap()
}
