//! Per-thread turn lifecycle tracking.
//!
//! One [`TrackedTurn`] per thread, from `turn/start` to a terminal state.
//! Invariant: at most one non-terminal turn per thread. Terminal transitions
//! notify waiters and remove the record, so a missing entry means "no active
//! turn". A background watchdog fails turns that stop producing events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;

use cb_agent_client::SlashVerb;
use cb_domain::config::TurnsConfig;
use cb_domain::error::CoreError;
use cb_protocol::notify;
use cb_store::PreferenceStore;

use crate::connections::registry::ConnectionRegistry;
use crate::runtime::manager::AgentManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// States
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum TurnState {
    InProgress,
    InterruptRequested,
    Completed,
    Interrupted,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Failed)
    }

    /// Wire spelling used in responses and notifications.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InProgress => "inProgress",
            Self::InterruptRequested => "interruptRequested",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalOutcome {
    pub status: TurnState,
    pub reason: Option<String>,
}

/// Result of waiting for a terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome {
    Terminal(TerminalOutcome),
    NoActiveTurn,
    Timeout,
}

struct TrackedTurn {
    turn_id: String,
    started_at: DateTime<Utc>,
    last_event_at: DateTime<Utc>,
    status: TurnState,
    interrupt_requested: bool,
    terminal_tx: watch::Sender<Option<TerminalOutcome>>,
}

/// Snapshot for UI state composition.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveTurnInfo {
    pub thread_id: String,
    pub turn_id: String,
    pub status: TurnState,
    pub started_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TurnTracker {
    turns: Mutex<HashMap<String, TrackedTurn>>,
}

impl Default for TurnTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnTracker {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(HashMap::new()),
        }
    }

    /// Start tracking a turn. Synthesizes a turn id when the backend has not
    /// yet emitted one.
    pub fn begin_turn(
        &self,
        thread_id: &str,
        backend_turn_id: Option<&str>,
    ) -> Result<String, CoreError> {
        let mut turns = self.turns.lock();
        if turns.contains_key(thread_id) {
            return Err(CoreError::InvalidInput(format!(
                "turn already in progress for thread {thread_id}"
            )));
        }
        let turn_id = backend_turn_id
            .map(str::to_owned)
            .unwrap_or_else(|| format!("turn-{}", uuid::Uuid::new_v4()));
        let (terminal_tx, _) = watch::channel(None);
        let now = Utc::now();
        turns.insert(
            thread_id.to_owned(),
            TrackedTurn {
                turn_id: turn_id.clone(),
                started_at: now,
                last_event_at: now,
                status: TurnState::InProgress,
                interrupt_requested: false,
                terminal_tx,
            },
        );
        Ok(turn_id)
    }

    /// Drop a just-begun turn without notifying anyone (failed submit: the
    /// caller returns an error and no `turn/completed` may be emitted).
    pub fn abort(&self, thread_id: &str) {
        self.turns.lock().remove(thread_id);
    }

    /// Record event activity for the stall watchdog.
    pub fn touch(&self, thread_id: &str) {
        if let Some(turn) = self.turns.lock().get_mut(thread_id) {
            turn.last_event_at = Utc::now();
        }
    }

    /// Adopt the backend's turn id once `turn/started` arrives.
    pub fn set_backend_turn_id(&self, thread_id: &str, turn_id: &str) {
        if let Some(turn) = self.turns.lock().get_mut(thread_id) {
            turn.turn_id = turn_id.to_owned();
        }
    }

    /// Transition `inProgress → interruptRequested`. Returns false when no
    /// turn is active.
    pub fn mark_interrupt_requested(&self, thread_id: &str) -> bool {
        match self.turns.lock().get_mut(thread_id) {
            Some(turn) => {
                turn.status = TurnState::InterruptRequested;
                turn.interrupt_requested = true;
                true
            }
            None => false,
        }
    }

    pub fn status_of(&self, thread_id: &str) -> Option<TurnState> {
        self.turns.lock().get(thread_id).map(|t| t.status)
    }

    pub fn turn_id_of(&self, thread_id: &str) -> Option<String> {
        self.turns.lock().get(thread_id).map(|t| t.turn_id.clone())
    }

    /// Terminal transition: notify waiters, remove the record, return the
    /// outcome. `None` when no turn was active (already terminal).
    pub fn complete(
        &self,
        thread_id: &str,
        status: TurnState,
        reason: Option<&str>,
    ) -> Option<TerminalOutcome> {
        debug_assert!(status.is_terminal());
        let turn = self.turns.lock().remove(thread_id)?;
        let outcome = TerminalOutcome {
            status,
            reason: reason.map(str::to_owned),
        };
        let _ = turn.terminal_tx.send(Some(outcome.clone()));
        tracing::debug!(
            thread_id = %thread_id,
            turn_id = %turn.turn_id,
            status = status.as_str(),
            reason = reason.unwrap_or(""),
            "turn terminal"
        );
        Some(outcome)
    }

    /// Subscribe to the active turn's terminal channel, for callers that
    /// must register before triggering the transition.
    pub fn subscribe(&self, thread_id: &str) -> Option<watch::Receiver<Option<TerminalOutcome>>> {
        self.turns
            .lock()
            .get(thread_id)
            .map(|turn| turn.terminal_tx.subscribe())
    }

    /// Wait for the active turn to reach a terminal.
    pub async fn wait_terminal(&self, thread_id: &str, timeout: Duration) -> WaitOutcome {
        match self.subscribe(thread_id) {
            Some(rx) => Self::wait_on(rx, timeout).await,
            None => WaitOutcome::NoActiveTurn,
        }
    }

    /// Wait on an already-subscribed terminal channel.
    pub async fn wait_on(
        mut rx: watch::Receiver<Option<TerminalOutcome>>,
        timeout: Duration,
    ) -> WaitOutcome {
        let wait = async {
            loop {
                if let Some(outcome) = rx.borrow().clone() {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    // Sender dropped; final value is whatever is borrowed.
                    if let Some(outcome) = rx.borrow().clone() {
                        return outcome;
                    }
                    // Aborted without a terminal.
                    return TerminalOutcome {
                        status: TurnState::Failed,
                        reason: Some("aborted".into()),
                    };
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => WaitOutcome::Terminal(outcome),
            Err(_) => WaitOutcome::Timeout,
        }
    }

    /// Threads whose turns have gone quiet for longer than `threshold`.
    pub fn stalled(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        self.turns
            .lock()
            .iter()
            .filter(|(_, turn)| {
                let silence = now.signed_duration_since(turn.last_event_at);
                silence.num_milliseconds() > threshold.as_millis() as i64
            })
            .map(|(thread_id, _)| thread_id.clone())
            .collect()
    }

    /// Snapshot of all active turns.
    pub fn active(&self) -> Vec<ActiveTurnInfo> {
        self.turns
            .lock()
            .iter()
            .map(|(thread_id, turn)| ActiveTurnInfo {
                thread_id: thread_id.clone(),
                turn_id: turn.turn_id.clone(),
                status: turn.status,
                started_at: turn.started_at,
                last_event_at: turn.last_event_at,
            })
            .collect()
    }

    #[cfg(test)]
    fn backdate_last_event(&self, thread_id: &str, by: Duration) {
        if let Some(turn) = self.turns.lock().get_mut(thread_id) {
            turn.last_event_at = Utc::now() - chrono::Duration::from_std(by).unwrap();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stall watchdog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Periodic watchdog: fails turns that stop producing events, sends a
/// best-effort `/interrupt` to the subprocess, and notifies the UI.
///
/// Thresholds are re-read from preferences each tick, so
/// `stallThresholdSec` / `stallHeartbeatSec` changes apply without restart.
pub async fn run_stall_watchdog(
    tracker: Arc<TurnTracker>,
    manager: Arc<AgentManager>,
    registry: Arc<ConnectionRegistry>,
    prefs: Arc<PreferenceStore>,
    defaults: TurnsConfig,
) {
    loop {
        let heartbeat = prefs
            .stall_heartbeat_sec()
            .unwrap_or(defaults.stall_heartbeat_sec);
        let threshold = prefs
            .stall_threshold_sec()
            .unwrap_or(defaults.stall_threshold_sec);
        tokio::time::sleep(Duration::from_secs(heartbeat)).await;

        for thread_id in tracker.stalled(Duration::from_secs(threshold)) {
            let Some(_) = tracker.complete(&thread_id, TurnState::Failed, Some("stall")) else {
                continue;
            };
            tracing::warn!(
                thread_id = %thread_id,
                threshold_sec = threshold,
                "turn stalled, failing"
            );
            registry.broadcast(&notify::turn_completed(&thread_id, "failed", Some("stall")));
            registry.broadcast(&notify::ui_state_changed(
                "stall",
                Some(&thread_id),
                serde_json::json!({}),
            ));

            // Best-effort interrupt; NoActiveTurn is fine.
            if let Some(client) = manager.get(&thread_id) {
                tokio::spawn(async move {
                    if let Err(e) = client
                        .send_command(SlashVerb::Interrupt, serde_json::Value::Null)
                        .await
                    {
                        tracing::debug!(error = %e, "stall interrupt ignored");
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_and_complete() {
        let tracker = TurnTracker::new();
        let turn_id = tracker.begin_turn("t1", None).unwrap();
        assert!(turn_id.starts_with("turn-"));
        assert_eq!(tracker.status_of("t1"), Some(TurnState::InProgress));

        let outcome = tracker.complete("t1", TurnState::Completed, None).unwrap();
        assert_eq!(outcome.status, TurnState::Completed);
        // Terminal removes the record.
        assert!(tracker.status_of("t1").is_none());
        // A second completion is a no-op.
        assert!(tracker.complete("t1", TurnState::Completed, None).is_none());
    }

    #[test]
    fn one_non_terminal_turn_per_thread() {
        let tracker = TurnTracker::new();
        tracker.begin_turn("t1", Some("backend-1")).unwrap();
        assert!(matches!(
            tracker.begin_turn("t1", None),
            Err(CoreError::InvalidInput(_))
        ));
        // A different thread is fine.
        tracker.begin_turn("t2", None).unwrap();
    }

    #[test]
    fn backend_turn_id_adopted() {
        let tracker = TurnTracker::new();
        tracker.begin_turn("t1", None).unwrap();
        tracker.set_backend_turn_id("t1", "backend-7");
        assert_eq!(tracker.turn_id_of("t1").as_deref(), Some("backend-7"));
    }

    #[test]
    fn interrupt_request_transition() {
        let tracker = TurnTracker::new();
        tracker.begin_turn("t1", None).unwrap();
        assert!(tracker.mark_interrupt_requested("t1"));
        assert_eq!(tracker.status_of("t1"), Some(TurnState::InterruptRequested));
        assert!(!tracker.mark_interrupt_requested("ghost"));
    }

    #[test]
    fn abort_is_silent() {
        let tracker = TurnTracker::new();
        tracker.begin_turn("t1", None).unwrap();
        tracker.abort("t1");
        assert!(tracker.status_of("t1").is_none());
    }

    #[tokio::test]
    async fn wait_terminal_sees_completion() {
        let tracker = Arc::new(TurnTracker::new());
        tracker.begin_turn("t1", None).unwrap();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_terminal("t1", Duration::from_secs(2))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.complete("t1", TurnState::Interrupted, Some("user"));

        match waiter.await.unwrap() {
            WaitOutcome::Terminal(outcome) => {
                assert_eq!(outcome.status, TurnState::Interrupted);
                assert_eq!(outcome.reason.as_deref(), Some("user"));
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wait_terminal_no_active_turn() {
        let tracker = TurnTracker::new();
        assert_eq!(
            tracker.wait_terminal("idle", Duration::from_millis(10)).await,
            WaitOutcome::NoActiveTurn
        );
    }

    #[tokio::test]
    async fn wait_terminal_times_out() {
        let tracker = TurnTracker::new();
        tracker.begin_turn("t1", None).unwrap();
        assert_eq!(
            tracker.wait_terminal("t1", Duration::from_millis(50)).await,
            WaitOutcome::Timeout
        );
    }

    #[test]
    fn stalled_detection() {
        let tracker = TurnTracker::new();
        tracker.begin_turn("fresh", None).unwrap();
        tracker.begin_turn("quiet", None).unwrap();
        tracker.backdate_last_event("quiet", Duration::from_secs(60));

        let stalled = tracker.stalled(Duration::from_secs(30));
        assert_eq!(stalled, vec!["quiet".to_string()]);

        // Touching resets the clock.
        tracker.touch("quiet");
        assert!(tracker.stalled(Duration::from_secs(30)).is_empty());
    }

    #[tokio::test]
    async fn watchdog_fails_stalled_turn() {
        let dir = tempfile::TempDir::new().unwrap();
        let tracker = Arc::new(TurnTracker::new());
        let manager = Arc::new(AgentManager::new(cb_domain::config::AgentLaunchConfig {
            command: "/bin/false".into(),
            ..Default::default()
        }));
        let registry = Arc::new(ConnectionRegistry::new(10, 16, 2));
        let prefs = Arc::new(PreferenceStore::new(dir.path()).unwrap());
        prefs.set_stall_threshold_sec(1).unwrap();
        prefs.set_stall_heartbeat_sec(1).unwrap();

        let (_conn, mut rx, _cancel) = registry.register().unwrap();

        tracker.begin_turn("t1", None).unwrap();
        tracker.backdate_last_event("t1", Duration::from_secs(10));

        let watchdog = tokio::spawn(run_stall_watchdog(
            tracker.clone(),
            manager,
            registry.clone(),
            prefs,
            TurnsConfig::default(),
        ));

        // Within ~3s the watchdog must fail the turn and notify.
        let frame = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("watchdog notification")
            .unwrap();
        assert!(frame.contains("turn/completed"));
        assert!(frame.contains("\"failed\""));
        assert!(frame.contains("stall"));
        assert!(tracker.status_of("t1").is_none());

        watchdog.abort();
    }
}
