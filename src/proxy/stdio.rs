//! Child-process MCP transport: newline-delimited JSON-RPC over stdio.
//!
//! A single reader task owns the child's stdout. It splits the byte stream
//! on `\n`, parses each complete line, and dispatches responses to waiting
//! callers through a pending map keyed by JSON-RPC id. Objects without an
//! `id` are server-initiated notifications and go to a side-channel.
//! stderr is drained for logging only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::mcp::{McpMessage, McpResponse};

use super::{BackendProxy, ProxyError, REQUEST_TIMEOUT_SECS, STOP_GRACE_SECS};

pub struct StdioProxy {
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    /// In-flight requests keyed by the JSON rendering of their id.
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    /// Server-initiated notifications (requests from the child with no id).
    notifications: broadcast::Sender<Value>,
    running: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl StdioProxy {
    pub fn new(command: String, args: Vec<String>, env: HashMap<String, String>) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            command,
            args,
            env,
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            pending: Arc::new(Mutex::new(HashMap::new())),
            notifications,
            running: Arc::new(AtomicBool::new(false)),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Subscribe to server-initiated notifications from the child.
    pub fn notifications(&self) -> broadcast::Receiver<Value> {
        self.notifications.subscribe()
    }

    async fn write_line(&self, line: &str) -> Result<(), ProxyError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProxyError::NotStarted)?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn round_trip(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        if !self.is_running() {
            return Err(ProxyError::NotStarted);
        }
        let line = serde_json::to_string(request)?;

        // Notifications are fire-and-forget: write and synthesize an empty
        // result for the caller.
        let Some(id) = &request.id else {
            self.write_line(&line).await?;
            return Ok(McpResponse::ok(Value::Null, serde_json::json!({})));
        };

        let id_key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id_key.clone(), tx);

        if let Err(e) = self.write_line(&line).await {
            self.pending.lock().await.remove(&id_key);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
            // Sender dropped: the child exited and the reader drained the map.
            Ok(Err(_)) => Err(ProxyError::BackendGone),
            Err(_) => {
                self.pending.lock().await.remove(&id_key);
                Err(ProxyError::Timeout(self.request_timeout.as_secs()))
            }
        }
    }
}

/// Dispatch loop over the child's stdout. Lives until the pipe closes, then
/// rejects every pending request by dropping its sender.
fn spawn_reader(
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    notifications: broadcast::Sender<Value>,
    running: Arc<AtomicBool>,
    command: String,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = match serde_json::from_str(line) {
                        Ok(v) => v,
                        Err(e) => {
                            debug!(cmd = %command, err = %e, "skipping unparseable line from backend");
                            continue;
                        }
                    };
                    match value.get("id") {
                        Some(id) if !id.is_null() => {
                            let key = id.to_string();
                            let sender = pending.lock().await.remove(&key);
                            match sender {
                                Some(tx) => {
                                    let _ = tx.send(value);
                                }
                                None => {
                                    debug!(cmd = %command, id = %key, "response for unknown request id")
                                }
                            }
                        }
                        // No id: a server-initiated notification.
                        _ => {
                            let _ = notifications.send(value);
                        }
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        running.store(false, Ordering::SeqCst);
        let dropped = {
            let mut map = pending.lock().await;
            let n = map.len();
            map.clear();
            n
        };
        if dropped > 0 {
            warn!(cmd = %command, dropped, "backend exited with requests in flight");
        } else {
            debug!(cmd = %command, "backend stdout closed");
        }
    });
}

fn spawn_stderr_drain(stderr: tokio::process::ChildStderr, command: String) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(cmd = %command, "backend stderr: {line}");
        }
    });
}

#[async_trait::async_trait]
impl BackendProxy for StdioProxy {
    async fn start(&self) -> Result<(), ProxyError> {
        let mut child_guard = self.child.lock().await;
        if child_guard.is_some() && self.is_running() {
            return Ok(());
        }

        let mut cmd = tokio::process::Command::new(&self.command);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ProxyError::Spawn(format!("{}: {e}", self.command)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProxyError::Spawn("child stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProxyError::Spawn("child stdout not available".into()))?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_drain(stderr, self.command.clone());
        }

        info!(cmd = %self.command, pid = child.id(), "backend spawned");
        self.running.store(true, Ordering::SeqCst);
        *self.stdin.lock().await = Some(stdin);
        spawn_reader(
            stdout,
            Arc::clone(&self.pending),
            self.notifications.clone(),
            Arc::clone(&self.running),
            self.command.clone(),
        );
        *child_guard = Some(child);
        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Closing stdin gives well-behaved servers an EOF to exit on.
        self.stdin.lock().await.take();

        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };

        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // SIGTERM first; SIGKILL after the grace period below.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        match tokio::time::timeout(Duration::from_secs(STOP_GRACE_SECS), child.wait()).await {
            Ok(Ok(status)) => debug!(cmd = %self.command, %status, "backend exited"),
            Ok(Err(e)) => warn!(cmd = %self.command, err = %e, "failed to reap backend"),
            Err(_) => {
                warn!(cmd = %self.command, "backend ignored SIGTERM — killing");
                let _ = child.kill().await;
            }
        }
        self.pending.lock().await.clear();
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn forward(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        self.round_trip(request).await
    }

    async fn forward_ungated(&self, request: &McpMessage) -> Result<McpResponse, ProxyError> {
        self.round_trip(request).await
    }
}
