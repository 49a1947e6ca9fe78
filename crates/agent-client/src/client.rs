//! The agent handle: one live subprocess plus the session/turn state the
//! gateway tracks for it.
//!
//! Failure taxonomy matters here. Resume failures split into
//! [`CandidateError`] (a data problem — try the next candidate),
//! [`AgentError::ProcessCrash`] (transport death — state unknown, the handle
//! must be stopped), and [`AgentError::NoActiveTurn`] (interrupt with nothing
//! to interrupt — success-equivalent for callers).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use cb_domain::config::AgentLaunchConfig;

use crate::protocol::{AgentEvent, SlashVerb};
use crate::transport::{StdioTransport, TransportError};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A recoverable per-candidate resume failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateError {
    NoRollout,
    RolloutLoadFailed,
    EmptyThreadId,
    InvalidId,
}

impl std::fmt::Display for CandidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoRollout => "no rollout for id",
            Self::RolloutLoadFailed => "failed to load rollout",
            Self::EmptyThreadId => "empty thread id",
            Self::InvalidId => "invalid id",
        };
        f.write_str(s)
    }
}

/// Errors surfaced by handle operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Recoverable: the caller should try the next resume candidate.
    #[error("candidate error: {0}")]
    Candidate(CandidateError),

    /// Abnormal transport closure; the handle is dead.
    #[error("agent process crashed: {0}")]
    ProcessCrash(String),

    /// Interrupt rejected because nothing is running.
    #[error("no active turn")]
    NoActiveTurn,

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Classify a transport failure into the ensure-ready taxonomy.
    fn classify(err: TransportError) -> Self {
        match err {
            TransportError::Rpc(rpc) => {
                let msg = rpc.message.to_ascii_lowercase();
                if msg.contains("no rollout") {
                    Self::Candidate(CandidateError::NoRollout)
                } else if msg.contains("failed to load rollout") {
                    Self::Candidate(CandidateError::RolloutLoadFailed)
                } else if msg.contains("empty thread id") {
                    Self::Candidate(CandidateError::EmptyThreadId)
                } else if msg.contains("invalid id") {
                    Self::Candidate(CandidateError::InvalidId)
                } else if msg.contains("no active turn") {
                    Self::NoActiveTurn
                } else {
                    Self::Other(rpc.to_string())
                }
            }
            TransportError::ProcessExited => Self::ProcessCrash("agent subprocess exited".into()),
            TransportError::Io(e) => Self::ProcessCrash(format!("transport I/O: {e}")),
            TransportError::Timeout => Self::Timeout("agent request timed out".into()),
            TransportError::Json(e) => Self::Other(format!("JSON: {e}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handle state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HandleState {
    Starting,
    Idle,
    Busy,
    Stopping,
    Stopped,
}

impl HandleState {
    /// Wire spelling used in status rows and list responses.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

/// State shared between the handle and its event relay task.
pub(crate) struct HandleShared {
    pub agent_id: String,
    pub backend_session_id: RwLock<Option<String>>,
    pub active_turn_id: RwLock<Option<String>>,
    pub state: RwLock<HandleState>,
    pub last_activity: RwLock<DateTime<Utc>>,
    pub session_lost: AtomicBool,
    /// Set by `stop()`; lets observers tell a deliberate stop from a crash
    /// when the event stream closes.
    pub stop_requested: AtomicBool,
}

impl HandleShared {
    fn new(agent_id: String) -> Self {
        Self {
            agent_id,
            backend_session_id: RwLock::new(None),
            active_turn_id: RwLock::new(None),
            state: RwLock::new(HandleState::Starting),
            last_activity: RwLock::new(Utc::now()),
            session_lost: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }
    }
}

/// Update handle bookkeeping from one inbound event, before the event is
/// forwarded to the pipeline.
pub(crate) fn apply_event(shared: &HandleShared, event: &AgentEvent) {
    *shared.last_activity.write() = Utc::now();
    match event {
        AgentEvent::SessionConfigured { session_id, .. } => {
            *shared.backend_session_id.write() = Some(session_id.clone());
        }
        AgentEvent::TurnStarted { turn_id } => {
            *shared.active_turn_id.write() = Some(turn_id.clone());
            *shared.state.write() = HandleState::Busy;
        }
        AgentEvent::TurnCompleted { .. } => {
            *shared.active_turn_id.write() = None;
            let mut state = shared.state.write();
            if *state == HandleState::Busy {
                *state = HandleState::Idle;
            }
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentClient
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Control handle for one agent subprocess.
pub struct AgentClient {
    shared: Arc<HandleShared>,
    transport: Arc<StdioTransport>,
    resume_timeout: Duration,
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("agent_id", &self.shared.agent_id)
            .field("state", &*self.shared.state.read())
            .field("backend_session_id", &*self.shared.backend_session_id.read())
            .finish_non_exhaustive()
    }
}

impl AgentClient {
    /// Spawn the subprocess, run the handshake, and return the handle plus
    /// the event stream for the pipeline.
    ///
    /// The returned receiver yields every subprocess event in arrival order;
    /// it closes when the subprocess dies.
    pub async fn spawn(
        agent_id: &str,
        cwd: &str,
        config: &AgentLaunchConfig,
    ) -> Result<(Arc<Self>, mpsc::Receiver<AgentEvent>), AgentError> {
        let (transport, mut raw_rx) =
            StdioTransport::spawn(config, cwd).map_err(AgentError::classify)?;
        let transport = Arc::new(transport);
        let shared = Arc::new(HandleShared::new(agent_id.to_owned()));

        // Relay task: apply handle bookkeeping, then forward to the pipeline.
        let (event_tx, event_rx) = mpsc::channel(256);
        let relay_shared = shared.clone();
        tokio::spawn(async move {
            while let Some(event) = raw_rx.recv().await {
                apply_event(&relay_shared, &event);
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }
            let mut state = relay_shared.state.write();
            if *state != HandleState::Stopping {
                *state = HandleState::Stopped;
            }
        });

        let client = Arc::new(Self {
            shared,
            transport,
            resume_timeout: Duration::from_secs(config.resume_timeout_sec),
        });

        // Handshake; starting → idle.
        client
            .transport
            .request_with_timeout(
                "initialize",
                Some(json!({ "cwd": cwd })),
                Duration::from_secs(config.launch_timeout_sec),
            )
            .await
            .map_err(AgentError::classify)?;
        *client.shared.state.write() = HandleState::Idle;

        tracing::info!(agent_id = %agent_id, cwd = %cwd, "agent subprocess ready");
        Ok((client, event_rx))
    }

    pub fn agent_id(&self) -> &str {
        &self.shared.agent_id
    }

    pub fn state(&self) -> HandleState {
        *self.shared.state.read()
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Backend session id; refreshed on each session-configured event.
    pub fn backend_session_id(&self) -> Option<String> {
        self.shared.backend_session_id.read().clone()
    }

    /// Backend turn id of the in-flight turn, if any.
    pub fn active_turn_id(&self) -> Option<String> {
        self.shared.active_turn_id.read().clone()
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.shared.last_activity.read()
    }

    /// Mark that every resume candidate failed; future events are treated as
    /// belonging to a fresh session.
    pub fn mark_session_lost(&self) {
        self.shared.session_lost.store(true, Ordering::SeqCst);
    }

    pub fn session_lost(&self) -> bool {
        self.shared.session_lost.load(Ordering::SeqCst)
    }

    /// Clear the session-lost flag once a fresh binding has been persisted.
    pub fn clear_session_lost(&self) {
        self.shared.session_lost.store(false, Ordering::SeqCst);
    }

    /// Attach this subprocess to a historical backend session.
    pub async fn resume(&self, backend_session_id: &str, cwd: &str) -> Result<(), AgentError> {
        let result = self
            .transport
            .request_with_timeout(
                "session/resume",
                Some(json!({ "sessionId": backend_session_id, "cwd": cwd })),
                self.resume_timeout,
            )
            .await
            .map_err(AgentError::classify)?;

        // A successful resume confirms the session id even before the next
        // session-configured event.
        let confirmed = result
            .get("sessionId")
            .and_then(Value::as_str)
            .unwrap_or(backend_session_id);
        *self.shared.backend_session_id.write() = Some(confirmed.to_owned());
        tracing::debug!(
            agent_id = %self.shared.agent_id,
            backend_session_id = %confirmed,
            "resume succeeded"
        );
        Ok(())
    }

    /// Enqueue a prompt; events arrive asynchronously on the event stream.
    pub async fn submit(
        &self,
        prompt: &str,
        images: &[String],
        files: &[String],
        output_schema: Option<Value>,
    ) -> Result<(), AgentError> {
        let mut params = json!({
            "prompt": prompt,
            "images": images,
            "files": files,
        });
        if let Some(schema) = output_schema {
            params["outputSchema"] = schema;
        }
        self.transport
            .request("turn/submit", Some(params))
            .await
            .map_err(AgentError::classify)?;
        *self.shared.state.write() = HandleState::Busy;
        Ok(())
    }

    /// Add input to the active turn without starting a new one.
    pub async fn steer(
        &self,
        prompt: &str,
        images: &[String],
        files: &[String],
    ) -> Result<(), AgentError> {
        self.transport
            .request(
                "turn/steer",
                Some(json!({ "prompt": prompt, "images": images, "files": files })),
            )
            .await
            .map_err(AgentError::classify)?;
        Ok(())
    }

    /// Run a built-in slash verb.
    pub async fn send_command(&self, verb: SlashVerb, args: Value) -> Result<Value, AgentError> {
        self.transport
            .request(
                "session/command",
                Some(json!({ "verb": verb.as_str(), "args": args })),
            )
            .await
            .map_err(AgentError::classify)
    }

    /// Whether `stop()` has been requested on this handle.
    pub fn stop_requested(&self) -> bool {
        self.shared.stop_requested.load(Ordering::SeqCst)
    }

    /// Stop the subprocess.
    pub async fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        *self.shared.state.write() = HandleState::Stopping;
        self.transport.shutdown().await;
        *self.shared.state.write() = HandleState::Stopped;
        tracing::info!(agent_id = %self.shared.agent_id, "agent subprocess stopped");
    }
}
