//! HTTP transport: one JSON-RPC request per POST.
//!
//! Every request is single-shot, so no id correlation is needed. `send`
//! starts the POST in a task; `receive` collects that task's result. The
//! reqwest client carries the configured headers (credentials) and its
//! connection pool; dropping it on `close` releases the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{handshake, Transport};
use crate::mcp_client::config::{ServerConfig, TransportConfig, TransportKind};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{InitializeResult, JsonRpcRequest, JsonRpcResponse};

/// Longest body excerpt quoted in an HTTP error.
const ERROR_BODY_MAX_CHARS: usize = 500;

struct InFlight {
    method: String,
    task: JoinHandle<Result<JsonRpcResponse, McpError>>,
}

pub struct HttpTransport {
    config: ServerConfig,
    client: Mutex<Option<reqwest::Client>>,
    /// Set once the handshake succeeds, cleared on close.
    open: AtomicBool,
    inflight: Mutex<HashMap<u64, InFlight>>,
}

impl HttpTransport {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            open: AtomicBool::new(false),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    fn url(&self) -> Result<&str, McpError> {
        match &self.config.transport {
            TransportConfig::Http { url, .. } => Ok(url),
            _ => Err(McpError::transport(&self.config.name, "not an http server")),
        }
    }

    fn build_client(&self) -> Result<reqwest::Client, McpError> {
        let name = self.config.name.as_str();
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        if let TransportConfig::Http { headers: extra, .. } = &self.config.transport {
            for (key, value) in extra {
                let header = HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| McpError::transport(name, format!("invalid header name '{key}': {e}")))?;
                let mut value = HeaderValue::from_str(value)
                    .map_err(|e| McpError::transport(name, format!("invalid value for header '{key}': {e}")))?;
                value.set_sensitive(true);
                headers.insert(header, value);
            }
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .connect_timeout(self.config.connect_timeout)
            .build()
            .map_err(|e| McpError::transport(name, format!("failed to build HTTP client: {e}")))
    }

    async fn client(&self) -> Result<reqwest::Client, McpError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| McpError::transport(&self.config.name, "not connected"))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn open(&self) -> Result<InitializeResult, McpError> {
        self.close().await;
        let client = self.build_client()?;
        *self.client.lock().await = Some(client);

        match handshake(self, self.config.connect_timeout).await {
            Ok(init) => {
                self.open.store(true, Ordering::Release);
                Ok(init)
            }
            Err(e) => {
                self.close().await;
                Err(e)
            }
        }
    }

    async fn send(&self, request: JsonRpcRequest) -> Result<(), McpError> {
        let client = self.client().await?;
        let url = self.url()?.to_string();
        let id = request.id;
        let method = request.method.clone();
        let task = tokio::spawn(post(self.config.name.clone(), client, url, request));
        self.inflight.lock().await.insert(id, InFlight { method, task });
        Ok(())
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let client = self.client().await?;
        let mut body = serde_json::json!({"jsonrpc": "2.0", "method": method});
        if let Some(params) = params {
            body["params"] = params;
        }
        let resp = client
            .post(self.url()?)
            .timeout(self.config.call_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| McpError::transport(&self.config.name, format!("notification failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(McpError::transport(
                &self.config.name,
                format!("notification rejected: HTTP {}", resp.status()),
            ));
        }
        Ok(())
    }

    async fn receive(&self, id: u64, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let InFlight { method, mut task } =
            self.inflight.lock().await.remove(&id).ok_or_else(|| {
                McpError::transport(&self.config.name, format!("no request in flight with id {id}"))
            })?;

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(McpError::transport(
                &self.config.name,
                format!("request task ended abnormally: {e}"),
            )),
            Err(_) => {
                task.abort();
                Err(McpError::Timeout {
                    server: self.config.name.clone(),
                    method,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::Release);
        let client = self.client.lock().await.take();
        for (_, inflight) in self.inflight.lock().await.drain() {
            inflight.task.abort();
        }
        if client.is_some() {
            tracing::debug!(server = %self.config.name, "http client released");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

async fn post(
    server: String,
    client: reqwest::Client,
    url: String,
    request: JsonRpcRequest,
) -> Result<JsonRpcResponse, McpError> {
    let resp = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .map_err(|e| McpError::transport(&server, format!("request failed: {e}")))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(ERROR_BODY_MAX_CHARS).collect();
        return Err(McpError::transport(
            &server,
            format!("HTTP {status}: {}", excerpt.trim()),
        ));
    }

    resp.json::<JsonRpcResponse>()
        .await
        .map_err(|e| McpError::transport(&server, format!("invalid JSON-RPC response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::config::McpConfig;
    use crate::mcp_client::transport::request;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn http_config(port: u16) -> ServerConfig {
        let doc = serde_json::json!({
            "servers": {"api": {
                "type": "http",
                "url": format!("http://127.0.0.1:{port}/mcp"),
                "headers": {"Authorization": "Bearer test-token"},
                "connect_timeout": 2000
            }}
        });
        McpConfig::from_json_str(&doc.to_string())
            .unwrap()
            .server("api")
            .unwrap()
            .clone()
    }

    fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
        haystack.windows(needle.len()).position(|w| w == needle)
    }

    /// Reads one HTTP request; returns (lower-cased head, body).
    async fn read_request(stream: &mut TcpStream) -> Option<(String, serde_json::Value)> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let (body_start, len) = loop {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                break (pos + 4, len);
            }
        };
        while buf.len() < body_start + len {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let head = String::from_utf8_lossy(&buf[..body_start]).to_ascii_lowercase();
        let body = serde_json::from_slice(&buf[body_start..body_start + len]).ok()?;
        Some((head, body))
    }

    async fn write_response(stream: &mut TcpStream, status: &str, body: &str) {
        let text = format!(
            "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(text.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    /// Fake MCP endpoint. `fail_status` makes every request fail with that
    /// status; method `slow` sleeps before answering.
    async fn spawn_fake_server(fail_status: Option<&'static str>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let Some((head, body)) = read_request(&mut stream).await else {
                        return;
                    };
                    if let Some(status) = fail_status {
                        write_response(&mut stream, status, "{\"detail\":\"boom\"}").await;
                        return;
                    }
                    assert!(head.contains("authorization: bearer test-token"));
                    let Some(id) = body.get("id").cloned() else {
                        write_response(&mut stream, "202 Accepted", "").await;
                        return;
                    };
                    if body["method"] == "slow" {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                    let result = if body["method"] == "initialize" {
                        serde_json::json!({"protocolVersion": "2024-11-05", "capabilities": {}})
                    } else {
                        serde_json::json!({"echo": body["method"]})
                    };
                    let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
                    write_response(&mut stream, "200 OK", &reply.to_string()).await;
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_open_request_close() {
        let port = spawn_fake_server(None).await;
        let t = HttpTransport::new(http_config(port));
        t.open().await.unwrap();
        assert!(t.is_open());

        let resp = request(&t, "tools/list", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(resp.result.unwrap()["echo"], "tools/list");

        t.close().await;
        t.close().await;
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_is_open_while_client_is_in_use() {
        let port = spawn_fake_server(None).await;
        let t = HttpTransport::new(http_config(port));
        assert!(!t.is_open());
        t.open().await.unwrap();

        {
            let _busy = t.client.lock().await;
            assert!(t.is_open());
        }

        t.close().await;
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_non_success_status_is_transport_error() {
        let port = spawn_fake_server(Some("500 Internal Server Error")).await;
        let t = HttpTransport::new(http_config(port));
        match t.open().await {
            Err(McpError::Transport { reason, .. }) => assert!(reason.contains("500"), "{reason}"),
            other => panic!("expected Transport error, got {other:?}"),
        }
        assert!(!t.is_open());
    }

    #[tokio::test]
    async fn test_timeout_only_abandons_that_call() {
        let port = spawn_fake_server(None).await;
        let t = HttpTransport::new(http_config(port));
        t.open().await.unwrap();

        let err = request(&t, "slow", None, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));

        let resp = request(&t, "ping", None, Duration::from_secs(2)).await.unwrap();
        assert_eq!(resp.result.unwrap()["echo"], "ping");
        t.close().await;
    }
}
