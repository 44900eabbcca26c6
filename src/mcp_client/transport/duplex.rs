//! Newline-delimited JSON-RPC over a full-duplex byte stream.
//!
//! Shared by the pipe and socket transports. Writes are serialized through a
//! mutex; a single background task reads whole lines and hands each response
//! to the waiter registered under its id, so concurrent requests may
//! complete in any order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{JsonRpcRequest, JsonRpcResponse};

type Delivery = Result<JsonRpcResponse, String>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Delivery>>>>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Waiter {
    method: String,
    rx: oneshot::Receiver<Delivery>,
}

/// A framed, id-correlated JSON-RPC channel.
pub struct DuplexChannel {
    server: String,
    writer: Mutex<Option<BoxedWriter>>,
    /// Senders the reader task delivers into.
    pending: PendingMap,
    /// Receivers collected by `receive`.
    waiters: Mutex<HashMap<u64, Waiter>>,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl DuplexChannel {
    /// Start the reader task over `reader` and take ownership of `writer`.
    pub fn spawn<R, W>(server: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            server.to_string(),
            BufReader::new(reader),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            server: server.to_string(),
            writer: Mutex::new(Some(Box::new(writer))),
            pending,
            waiters: Mutex::new(HashMap::new()),
            closed,
            reader_task,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register a waiter for `request.id` and write the request. A failed
    /// send leaves nothing registered.
    pub async fn send(&self, request: &JsonRpcRequest) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let line = serde_json::to_string(request).map_err(|e| {
            McpError::transport(&self.server, format!("failed to serialize request: {e}"))
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request.id, tx);
        self.waiters.lock().await.insert(
            request.id,
            Waiter {
                method: request.method.clone(),
                rx,
            },
        );

        // The reader may have hit EOF between the check above and the insert.
        if self.is_closed() {
            self.forget(request.id).await;
            return Err(self.closed_error());
        }

        if let Err(e) = self.write_line(line).await {
            self.forget(request.id).await;
            return Err(e);
        }
        Ok(())
    }

    /// Write a notification. Nothing is registered.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let mut notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
        });
        if let Some(params) = params {
            notification["params"] = params;
        }
        let line = serde_json::to_string(&notification).map_err(|e| {
            McpError::transport(&self.server, format!("failed to serialize notification: {e}"))
        })?;
        self.write_line(line).await
    }

    /// Wait for the response to `id`. On timeout only this waiter is dropped.
    pub async fn receive(&self, id: u64, timeout: Duration) -> Result<JsonRpcResponse, McpError> {
        let waiter = self.waiters.lock().await.remove(&id).ok_or_else(|| {
            McpError::transport(&self.server, format!("no request in flight with id {id}"))
        })?;

        match tokio::time::timeout(timeout, waiter.rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(McpError::transport(&self.server, reason)),
            Ok(Err(_)) => Err(McpError::transport(
                &self.server,
                "connection closed before a response arrived",
            )),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(McpError::Timeout {
                    server: self.server.clone(),
                    method: waiter.method,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Drop the writer, stop the reader and fail every outstanding waiter.
    pub async fn shutdown(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        self.closed.store(true, Ordering::Release);
        self.reader_task.abort();

        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err("connection closed".into()));
        }
        self.waiters.lock().await.clear();
    }

    async fn write_line(&self, mut line: String) -> Result<(), McpError> {
        line.push('\n');
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or_else(|| self.closed_error())?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::transport(&self.server, format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::transport(&self.server, format!("flush failed: {e}")))
    }

    async fn forget(&self, id: u64) {
        self.pending.lock().await.remove(&id);
        self.waiters.lock().await.remove(&id);
    }

    fn closed_error(&self) -> McpError {
        McpError::transport(&self.server, "connection is closed")
    }
}

impl Drop for DuplexChannel {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

async fn read_loop<R>(server: String, mut reader: R, pending: PendingMap, closed: Arc<AtomicBool>)
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let reason = loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break "connection closed by server".to_string(),
            Ok(_) => {}
            Err(e) => break format!("read failed: {e}"),
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }

        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(response) if response.method.is_none() => {
                let id = response.id;
                match pending.lock().await.remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(Ok(response));
                    }
                    None => tracing::debug!(server = %server, id, "dropping unmatched response"),
                }
            }
            Ok(response) => {
                tracing::debug!(
                    server = %server,
                    method = response.method.as_deref().unwrap_or_default(),
                    "ignoring server-initiated request"
                );
            }
            // Log output or notifications on the protocol stream.
            Err(_) => tracing::trace!(server = %server, line = %trimmed, "skipping non-response line"),
        }
    };

    tracing::debug!(server = %server, reason = %reason, "reader stopped");
    closed.store(true, Ordering::Release);
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(reason.clone()));
    }
}
