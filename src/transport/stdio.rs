//! Stdio transport implementation (subprocess)

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace, warn};

use super::{OutboundHeaders, Transport, initialize_params, into_result};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RequestId};
use crate::{Error, Result};

/// Stdio transport for subprocess MCP servers
pub struct StdioTransport {
    backend_id: String,
    child: Mutex<Option<Child>>,
    writer: Mutex<Option<ChildStdin>>,
    /// Requests waiting for a response line, keyed by id
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    request_id: AtomicI64,
    connected: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the process and run `initialize`.
    ///
    /// `command` is split with shell quoting rules; `args` are appended.
    pub async fn spawn(
        backend_id: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&str>,
    ) -> Result<Arc<Self>> {
        let mut parts = shlex::split(command)
            .ok_or_else(|| Error::Config(format!("Backend '{backend_id}' has an unparsable command")))?;
        if parts.is_empty() {
            return Err(Error::Config(format!("Backend '{backend_id}' has an empty command")));
        }
        let program = parts.remove(0);

        let mut cmd = Command::new(&program);
        cmd.args(&parts)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::unreachable(backend_id, format!("Failed to spawn '{program}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("Child stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("Child stdout not captured".to_string()))?;

        let transport = Arc::new(Self {
            backend_id: backend_id.to_string(),
            child: Mutex::new(Some(child)),
            writer: Mutex::new(Some(stdin)),
            pending: Arc::new(DashMap::new()),
            request_id: AtomicI64::new(1),
            connected: Arc::new(AtomicBool::new(true)),
        });

        // The reader holds no reference to the transport: dropping it kills
        // the child, which ends the reader
        let reader = LineReader {
            backend_id: backend_id.to_string(),
            pending: Arc::clone(&transport.pending),
            connected: Arc::clone(&transport.connected),
        };
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                reader.handle_line(&line);
            }
            reader.connected.store(false, Ordering::Relaxed);
            // Wake every waiter: their senders drop here
            reader.pending.clear();
            debug!(backend = %reader.backend_id, "Stdio reader task ended");
        });

        if let Err(e) = transport.initialize().await {
            let _ = transport.close().await;
            return Err(e);
        }
        Ok(transport)
    }

    async fn initialize(&self) -> Result<()> {
        into_result(
            self.request("initialize", Some(initialize_params()), &OutboundHeaders::new())
                .await?,
        )
        .map_err(|e| Error::backend_protocol(&self.backend_id, format!("Initialize failed: {e:?}")))?;
        self.notify("notifications/initialized", None).await?;
        debug!(backend = %self.backend_id, "Stdio transport initialized");
        Ok(())
    }

    async fn write_message(&self, message: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let stdin = writer
            .as_mut()
            .ok_or_else(|| Error::unreachable(&self.backend_id, "stdin closed"))?;
        let io_err = |e: std::io::Error| Error::unreachable(&self.backend_id, e);
        stdin.write_all(message.as_bytes()).await.map_err(io_err)?;
        stdin.write_all(b"\n").await.map_err(io_err)?;
        stdin.flush().await.map_err(io_err)?;
        Ok(())
    }

    fn next_id(&self) -> RequestId {
        RequestId::Number(self.request_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// Routes response lines to their waiting requests
struct LineReader {
    backend_id: String,
    pending: Arc<DashMap<String, oneshot::Sender<JsonRpcResponse>>>,
    connected: Arc<AtomicBool>,
}

impl LineReader {
    fn handle_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        match serde_json::from_str::<JsonRpcResponse>(line) {
            Ok(response) => {
                let Some(id) = response.id.as_ref().map(ToString::to_string) else {
                    trace!(backend = %self.backend_id, "Ignoring backend notification");
                    return;
                };
                if let Some((_, sender)) = self.pending.remove(&id) {
                    let _ = sender.send(response);
                }
            }
            Err(e) => warn!(backend = %self.backend_id, error = %e, "Unparsable line from backend"),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    /// Credentials for subprocess backends come from their environment, so
    /// per-call headers are not forwarded.
    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        _headers: &OutboundHeaders,
    ) -> Result<JsonRpcResponse> {
        let id = self.next_id();
        let key = id.to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(key.clone(), tx);

        let message = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        if let Err(e) = self.write_message(&message).await {
            self.pending.remove(&key);
            return Err(e);
        }

        // The caller bounds the wait; a dropped sender means the process exited
        rx.await
            .map_err(|_| Error::unreachable(&self.backend_id, "process exited before responding"))
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.write_message(&message).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::Relaxed);
        *self.writer.lock().await = None;
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.kill().await;
        }
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_command_is_config_error() {
        let result = StdioTransport::spawn("srv", "   ", &[], &HashMap::new(), None).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn missing_program_is_unreachable() {
        let result = StdioTransport::spawn(
            "srv",
            "/nonexistent/mcp-server-binary --stdio",
            &[],
            &HashMap::new(),
            None,
        )
        .await;
        assert!(matches!(result, Err(Error::BackendUnreachable { .. })));
    }
}
