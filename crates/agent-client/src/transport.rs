//! Stdio transport to the agent subprocess.
//!
//! Spawns the child process and runs one reader task over its stdout.
//! Responses are demuxed to waiting callers by request id; notifications are
//! parsed into [`AgentEvent`]s and pushed onto the event channel consumed by
//! the gateway's event pipeline. The event channel closing is the crash
//! signal: when stdout reaches EOF every pending request fails and the
//! receiver sees end-of-stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};

use cb_domain::config::AgentLaunchConfig;

use crate::protocol::{AgentEvent, AgentRequest, AgentRpcError};

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// The subprocess exited or its stdout closed; state is unknown.
    #[error("agent subprocess has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    /// The subprocess answered with a JSON-RPC error object.
    #[error("{0}")]
    Rpc(AgentRpcError),
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, AgentRpcError>>>>>;

/// Event channel capacity; the pipeline consumer keeps up with one handle.
const EVENT_CHANNEL_SIZE: usize = 256;

/// Default per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Stdio transport: one child process, newline-delimited JSON-RPC.
pub struct StdioTransport {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: tokio::sync::Mutex<Child>,
    pending: PendingMap,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
}

impl StdioTransport {
    /// Spawn the subprocess and return the transport plus the event stream.
    pub fn spawn(
        config: &AgentLaunchConfig,
        cwd: &str,
    ) -> Result<(Self, mpsc::Receiver<AgentEvent>), TransportError> {
        let mut cmd = tokio::process::Command::new(&config.command);
        cmd.args(&config.args)
            .current_dir(cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);

        tokio::spawn(reader_loop(
            BufReader::new(stdout),
            pending.clone(),
            alive.clone(),
            event_tx,
        ));

        Ok((
            Self {
                stdin: tokio::sync::Mutex::new(stdin),
                child: tokio::sync::Mutex::new(child),
                pending,
                next_id: AtomicU64::new(1),
                alive,
            },
            event_rx,
        ))
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.request_with_timeout(method, params, REQUEST_TIMEOUT)
            .await
    }

    /// Send a request with an explicit response deadline.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let req = AgentRequest::new(id, method, params);
        let json = serde_json::to_string(&req)?;
        tracing::debug!(id, method, "sending agent request");

        if let Err(e) = self.write_line(&json).await {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(rpc_err))) => Err(TransportError::Rpc(rpc_err)),
            // Sender dropped: reader loop exited.
            Ok(Err(_)) => Err(TransportError::ProcessExited),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let json = serde_json::to_string(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        }))?;
        self.write_line(&json).await
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.is_alive() {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Shut down the subprocess: close stdin, wait briefly, then kill.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing agent stdin");
            }
        }
        let mut child = self.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "agent subprocess exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for agent subprocess");
            }
            Err(_) => {
                tracing::warn!("agent subprocess did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill agent subprocess");
                }
            }
        }
    }
}

/// Reader task: demux stdout lines into responses and events.
async fn reader_loop(
    mut stdout: BufReader<tokio::process::ChildStdout>,
    pending: PendingMap,
    alive: Arc<AtomicBool>,
    event_tx: mpsc::Sender<AgentEvent>,
) {
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line).await {
            Ok(0) => break, // EOF: subprocess gone.
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "agent stdout read error");
                break;
            }
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || !trimmed.starts_with('{') {
            // Tolerate stray logging on stdout.
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "skipping unparseable agent line");
                continue;
            }
        };

        // Response: has an id and a result or error.
        if let Some(id) = value.get("id").and_then(Value::as_u64) {
            if value.get("result").is_some() || value.get("error").is_some() {
                let outcome = match value.get("error") {
                    Some(err) => match serde_json::from_value::<AgentRpcError>(err.clone()) {
                        Ok(rpc_err) => Err(rpc_err),
                        Err(_) => Err(AgentRpcError {
                            code: -32603,
                            message: "unparseable error object".into(),
                            data: None,
                        }),
                    },
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                match pending.lock().remove(&id) {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => {
                        tracing::warn!(id, "response for unknown agent request");
                    }
                }
                continue;
            }
        }

        // Notification: has a method.
        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let params = value.get("params").cloned().unwrap_or(Value::Null);
            let event = AgentEvent::parse(method, params);
            if event_tx.send(event).await.is_err() {
                // Pipeline consumer gone; stop reading.
                break;
            }
            continue;
        }

        tracing::debug!("ignoring agent message that is neither response nor notification");
    }

    // Teardown: dropping the senders fails every in-flight request with a
    // ProcessExited (not a synthetic RPC error — transport death must not
    // look like a candidate failure), and dropping event_tx closes the
    // stream for the pipeline.
    alive.store(false, Ordering::SeqCst);
    pending.lock().clear();
    tracing::debug!("agent reader loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    // Transport-level behavior against a real child process, using /bin/sh as
    // a stand-in agent that echoes canned JSON-RPC frames.

    fn sh_config(script: &str) -> AgentLaunchConfig {
        AgentLaunchConfig {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
            launch_timeout_sec: 5,
            resume_timeout_sec: 5,
        }
    }

    #[tokio::test]
    async fn response_resolves_request() {
        // Reads one request line, answers id 1.
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}\n'"#;
        let (transport, _events) = StdioTransport::spawn(&sh_config(script), ".").unwrap();
        let result = transport.request("session/new", None).await.unwrap();
        assert_eq!(result["ok"], true);
    }

    #[tokio::test]
    async fn rpc_error_surfaces() {
        let script = r#"read line; printf '{"jsonrpc":"2.0","id":1,"error":{"code":-32001,"message":"no rollout for id"}}\n'"#;
        let (transport, _events) = StdioTransport::spawn(&sh_config(script), ".").unwrap();
        match transport.request("session/resume", None).await {
            Err(TransportError::Rpc(e)) => assert_eq!(e.message, "no rollout for id"),
            other => panic!("expected Rpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn notifications_become_events() {
        let script = r#"printf '{"jsonrpc":"2.0","method":"turn/started","params":{"turnId":"t9"}}\n'; sleep 1"#;
        let (_transport, mut events) = StdioTransport::spawn(&sh_config(script), ".").unwrap();
        let event = events.recv().await.unwrap();
        assert_eq!(event, AgentEvent::TurnStarted { turn_id: "t9".into() });
    }

    #[tokio::test]
    async fn eof_fails_pending_and_closes_events() {
        // Exits immediately without answering.
        let script = "exit 0";
        let (transport, mut events) = StdioTransport::spawn(&sh_config(script), ".").unwrap();
        // Event stream closes on EOF.
        assert!(events.recv().await.is_none());
        // Subsequent requests see the dead process.
        match transport.request("turn/submit", None).await {
            Err(TransportError::ProcessExited) => {}
            other => panic!("expected ProcessExited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_stdout_lines_skipped() {
        let script = r#"echo "starting up"; read line; printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'"#;
        let (transport, _events) = StdioTransport::spawn(&sh_config(script), ".").unwrap();
        assert!(transport.request("session/new", None).await.is_ok());
    }
}
