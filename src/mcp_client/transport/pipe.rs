//! Pipe transport: a child process speaking JSON-RPC on stdin/stdout.
//!
//! Stderr is drained continuously into a short ring of recent lines so a
//! server that dies during startup can explain itself in the error.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::duplex::DuplexChannel;
use super::{handshake, Transport};
use crate::mcp_client::config::{ServerConfig, TransportConfig, TransportKind};
use crate::mcp_client::errors::McpError;
use crate::mcp_client::types::{InitializeResult, JsonRpcRequest, JsonRpcResponse};

/// Grace period for the child to exit after stdin closes before it is killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the stderr drain to finish after the child exits.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const STDERR_TAIL_LINES: usize = 20;

/// Cap on the stderr text attached to an error message.
const STDERR_SUFFIX_MAX_CHARS: usize = 2000;

struct PipeSession {
    child: Child,
    channel: Arc<DuplexChannel>,
    stderr_task: Option<JoinHandle<()>>,
}

/// JSON-RPC over a child process's stdio.
pub struct PipeTransport {
    config: ServerConfig,
    session: Mutex<Option<PipeSession>>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    open: AtomicBool,
}

impl PipeTransport {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            stderr_tail: Arc::default(),
            open: AtomicBool::new(false),
        }
    }

    async fn spawn(&self) -> Result<(), McpError> {
        let name = self.config.name.as_str();
        let TransportConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } = &self.config.transport
        else {
            return Err(McpError::transport(name, "not a stdio server"));
        };

        let mut cmd = Command::new(command);
        cmd.args(args);
        cmd.envs(env);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::transport(name, format!("failed to spawn '{command}': {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::transport(name, "failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::transport(name, "failed to capture stdout"))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(drain_stderr(name.to_string(), stderr, self.stderr_tail.clone())));

        tracing::debug!(server = %name, pid = ?child.id(), command = %command, "spawned server process");

        let channel = Arc::new(DuplexChannel::spawn(name, stdout, stdin));
        *self.session.lock().await = Some(PipeSession {
            child,
            channel,
            stderr_task,
        });
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn channel(&self) -> Result<Arc<DuplexChannel>, McpError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or_else(|| McpError::transport(&self.config.name, "not connected"))
    }

    /// Recent stderr lines formatted as an error-message suffix.
    async fn stderr_suffix(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        if tail.is_empty() {
            return String::new();
        }
        let mut text = tail.iter().cloned().collect::<Vec<_>>().join("\n");
        if text.len() > STDERR_SUFFIX_MAX_CHARS {
            let mut cut = STDERR_SUFFIX_MAX_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...(truncated)");
        }
        format!(" | stderr: {}", text.trim())
    }
}

#[async_trait]
impl Transport for PipeTransport {
    fn server_name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn open(&self) -> Result<InitializeResult, McpError> {
        self.close().await;
        self.stderr_tail.lock().await.clear();
        self.spawn().await?;

        match handshake(self, self.config.connect_timeout).await {
            Ok(init) => Ok(init),
            Err(e) => {
                self.close().await;
                let reason = match e {
                    McpError::Transport { reason, .. } => reason,
                    McpError::Timeout { timeout_ms, .. } => {
                        format!("initialization timed out after {timeout_ms}ms")
                    }
                    other => other.to_string(),
                };
                let suffix = self.stderr_suffix().await;
                if !suffix.is_empty() {
                    tracing::warn!(server = %self.config.name, "server stderr captured on failure");
                }
                Err(McpError::transport(&self.config.name, format!("{reason}{suffix}")))
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
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };
        self.open.store(false, Ordering::Release);

        // Closing stdin is the shutdown signal for stdio servers.
        session.channel.shutdown().await;
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, session.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.config.name, %status, "server process exited");
            }
            _ => {
                tracing::warn!(server = %self.config.name, "server did not exit, killing");
                let _ = session.child.kill().await;
            }
        }

        if let Some(mut task) = session.stderr_task.take() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

async fn drain_stderr(server: String, stderr: ChildStderr, tail: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(server = %server, "stderr: {line}");
        let mut tail = tail.lock().await;
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
}
