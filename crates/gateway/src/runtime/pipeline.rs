//! Event pipeline: one consumer task per subprocess handle.
//!
//! Consumes the handle's event stream in arrival order, maintains the
//! per-thread timeline snapshot, feeds the turn tracker's activity clock,
//! persists session bindings as they are (re)configured, and fans
//! notifications out to every connection. Fine-grained events broadcast
//! immediately; the aggregated `ui/state/changed` snapshot is throttled per
//! key with coalescing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use cb_agent_client::{AgentClient, AgentEvent, TurnStatus};
use cb_protocol::jsonrpc::RpcNotification;
use cb_protocol::notify;
use cb_store::{AgentStatusStore, BindingStore};

use crate::connections::registry::ConnectionRegistry;
use crate::runtime::manager::AgentManager;
use crate::runtime::tracker::{TurnState, TurnTracker};

/// Minimum interval between `ui/state/changed` broadcasts per throttle key.
const STATE_CHANGE_THROTTLE: Duration = Duration::from_millis(500);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Timeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One entry of a thread's timeline snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimelineEntry {
    pub id: String,
    /// `user`, `assistant_delta`, `tool_call`, `attachment`, ...
    pub kind: String,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

#[derive(Default)]
struct Timeline {
    entries: Vec<TimelineEntry>,
    /// Record ids already present, for hydration dedup.
    seen: HashSet<String>,
}

impl Timeline {
    fn append(&mut self, entry: TimelineEntry) -> bool {
        if !self.seen.insert(entry.id.clone()) {
            return false;
        }
        self.entries.push(entry);
        true
    }
}

/// Accumulated token usage per agent, fed by subprocess usage events.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

struct Throttle {
    last_sent: tokio::time::Instant,
    pending: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pipeline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct EventPipeline {
    timelines: RwLock<HashMap<String, Timeline>>,
    usage: RwLock<HashMap<String, TokenUsage>>,
    /// Shared with trailing-flush tasks, hence its own Arc.
    throttles: Arc<Mutex<HashMap<String, Throttle>>>,
    registry: Arc<ConnectionRegistry>,
    tracker: Arc<TurnTracker>,
    bindings: Arc<BindingStore>,
    statuses: Arc<AgentStatusStore>,
    manager: Arc<AgentManager>,
}

impl EventPipeline {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<TurnTracker>,
        bindings: Arc<BindingStore>,
        statuses: Arc<AgentStatusStore>,
        manager: Arc<AgentManager>,
    ) -> Self {
        Self {
            timelines: RwLock::new(HashMap::new()),
            usage: RwLock::new(HashMap::new()),
            throttles: Arc::new(Mutex::new(HashMap::new())),
            registry,
            tracker,
            bindings,
            statuses,
            manager,
        }
    }

    /// Start the consumer task for a freshly launched handle.
    pub fn spawn_consumer(
        self: &Arc<Self>,
        agent_id: String,
        client: Arc<AgentClient>,
        mut events: mpsc::Receiver<AgentEvent>,
    ) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                pipeline.handle_event(&agent_id, &client, event).await;
            }
            pipeline.handle_stream_closed(&agent_id, &client).await;
        });
    }

    /// Process one subprocess event.
    pub async fn handle_event(&self, agent_id: &str, client: &Arc<AgentClient>, event: AgentEvent) {
        self.tracker.touch(agent_id);

        match event {
            AgentEvent::SessionConfigured {
                session_id,
                rollout_path,
            } => {
                // The binding write is best-effort: a store failure must not
                // disturb the in-flight turn.
                if self
                    .bindings
                    .bind(agent_id, &session_id, rollout_path.as_deref().unwrap_or(""))
                    .is_ok()
                    && client.session_lost()
                {
                    // Fresh-session binding persisted after candidate
                    // exhaustion; the handle is whole again.
                    client.clear_session_lost();
                }
                self.statuses
                    .upsert(agent_id, Some(&session_id), client.state().wire_name());
                self.notify_state_changed(agent_id, "session_configured");
            }

            AgentEvent::TurnStarted { turn_id } => {
                self.tracker.set_backend_turn_id(agent_id, &turn_id);
                self.statuses
                    .upsert(agent_id, client.backend_session_id().as_deref(), "busy");
                self.registry.broadcast(&RpcNotification::new(
                    "turn/started",
                    json!({ "threadId": agent_id, "turnId": turn_id }),
                ));
                self.notify_state_changed(agent_id, "turn_started");
            }

            AgentEvent::AssistantDelta { turn_id, text } => {
                self.append_entry(
                    agent_id,
                    TimelineEntry {
                        id: uuid::Uuid::new_v4().to_string(),
                        kind: "assistant_delta".into(),
                        payload: json!({ "text": text, "turnId": turn_id }),
                        at: Utc::now(),
                    },
                );
                self.registry.broadcast(&RpcNotification::new(
                    "assistant/delta",
                    json!({ "threadId": agent_id, "turnId": turn_id, "text": text }),
                ));
            }

            AgentEvent::ToolCall {
                call_id,
                tool_name,
                payload,
            } => {
                self.append_entry(
                    agent_id,
                    TimelineEntry {
                        id: call_id.clone(),
                        kind: "tool_call".into(),
                        payload: payload.clone(),
                        at: Utc::now(),
                    },
                );
                let mut params = json!({ "threadId": agent_id, "callId": call_id, "tool": tool_name });
                merge_object(&mut params, payload);
                self.registry
                    .broadcast(&RpcNotification::new("tool/call", params));
            }

            AgentEvent::Attachment { record_id, payload } => {
                self.append_entry(
                    agent_id,
                    TimelineEntry {
                        id: record_id.clone(),
                        kind: "attachment".into(),
                        payload: payload.clone(),
                        at: Utc::now(),
                    },
                );
                let mut params = json!({ "threadId": agent_id, "recordId": record_id });
                merge_object(&mut params, payload);
                self.registry
                    .broadcast(&RpcNotification::new("attachment", params));
            }

            AgentEvent::TurnCompleted { status, reason, .. } => {
                let terminal = match status {
                    TurnStatus::Completed => TurnState::Completed,
                    TurnStatus::Interrupted => TurnState::Interrupted,
                    TurnStatus::Failed => TurnState::Failed,
                };
                // None when the tracker already went terminal (stall,
                // force-complete); the single notification was sent then.
                if let Some(outcome) =
                    self.tracker.complete(agent_id, terminal, reason.as_deref())
                {
                    self.registry.broadcast(&notify::turn_completed(
                        agent_id,
                        outcome.status.as_str(),
                        outcome.reason.as_deref(),
                    ));
                }
                self.statuses
                    .upsert(agent_id, client.backend_session_id().as_deref(), "idle");
                self.notify_state_changed(agent_id, "turn_terminal");
            }

            AgentEvent::Other { method, params } => {
                if method == "token/usage" {
                    self.record_usage(agent_id, &params);
                }
                // Forward verbatim under the original method name, with the
                // thread id injected for client-side routing.
                let mut forwarded = json!({ "threadId": agent_id });
                merge_object(&mut forwarded, params);
                self.registry
                    .broadcast(&RpcNotification::new(method, forwarded));
            }
        }
    }

    /// The handle's event stream closed: deliberate stop or crash.
    async fn handle_stream_closed(&self, agent_id: &str, client: &Arc<AgentClient>) {
        let deliberate = client.stop_requested();
        // Remove before anyone is notified so `get` misses from here on.
        self.manager.remove(agent_id);
        self.statuses
            .upsert(agent_id, client.backend_session_id().as_deref(), "offline");

        if deliberate {
            tracing::debug!(agent_id = %agent_id, "event stream closed after stop");
            return;
        }

        tracing::warn!(agent_id = %agent_id, "agent subprocess died");
        if let Some(outcome) =
            self.tracker
                .complete(agent_id, TurnState::Failed, Some("process_crash"))
        {
            self.registry.broadcast(&notify::turn_completed(
                agent_id,
                outcome.status.as_str(),
                outcome.reason.as_deref(),
            ));
        }
        self.registry.broadcast(&notify::ui_state_changed(
            "process_exit",
            Some(agent_id),
            json!({}),
        ));
    }

    fn record_usage(&self, agent_id: &str, params: &Value) {
        let mut usage = self.usage.write();
        let entry = usage.entry(agent_id.to_owned()).or_default();
        entry.input_tokens += params.get("inputTokens").and_then(Value::as_u64).unwrap_or(0);
        entry.output_tokens += params
            .get("outputTokens")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        entry.total_tokens += params.get("totalTokens").and_then(Value::as_u64).unwrap_or(0);
    }

    // ── Timeline access ──────────────────────────────────────────────

    fn append_entry(&self, agent_id: &str, entry: TimelineEntry) {
        self.timelines
            .write()
            .entry(agent_id.to_owned())
            .or_default()
            .append(entry);
    }

    /// Append a gateway-originated entry (e.g. the user message on submit).
    pub fn append_local(&self, agent_id: &str, id: &str, kind: &str, payload: Value) {
        self.append_entry(
            agent_id,
            TimelineEntry {
                id: id.to_owned(),
                kind: kind.to_owned(),
                payload,
                at: Utc::now(),
            },
        );
    }

    /// Replace a thread's timeline with a hydration snapshot.
    pub fn replace_timeline(&self, agent_id: &str, entries: Vec<TimelineEntry>) {
        let mut timeline = Timeline::default();
        for entry in entries {
            timeline.append(entry);
        }
        self.timelines
            .write()
            .insert(agent_id.to_owned(), timeline);
    }

    /// Append hydrated records, skipping ids already present.
    /// Returns how many were actually added.
    pub fn append_hydrated(&self, agent_id: &str, entries: Vec<TimelineEntry>) -> usize {
        let mut timelines = self.timelines.write();
        let timeline = timelines.entry(agent_id.to_owned()).or_default();
        entries
            .into_iter()
            .filter(|entry| timeline.append(entry.clone()))
            .count()
    }

    pub fn timeline(&self, agent_id: &str) -> Vec<TimelineEntry> {
        self.timelines
            .read()
            .get(agent_id)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    pub fn usage_of(&self, agent_id: &str) -> TokenUsage {
        self.usage.read().get(agent_id).copied().unwrap_or_default()
    }

    // ── Aggregated state notifications ───────────────────────────────

    /// Throttled `ui/state/changed`: at most one broadcast per key per
    /// throttle window; bursts coalesce into one trailing flush.
    pub fn notify_state_changed(&self, throttle_key: &str, source: &str) {
        let now = tokio::time::Instant::now();
        let mut throttles = self.throttles.lock();
        let entry = throttles.entry(throttle_key.to_owned()).or_insert(Throttle {
            last_sent: now - STATE_CHANGE_THROTTLE,
            pending: false,
        });

        if now.duration_since(entry.last_sent) >= STATE_CHANGE_THROTTLE {
            entry.last_sent = now;
            self.registry.broadcast(&notify::ui_state_changed(
                source,
                Some(throttle_key),
                json!({}),
            ));
            return;
        }

        if entry.pending {
            return; // Coalesced into the scheduled flush.
        }
        entry.pending = true;
        let delay = STATE_CHANGE_THROTTLE - now.duration_since(entry.last_sent);
        drop(throttles);

        let registry = self.registry.clone();
        let throttles = self.throttles.clone();
        let key = throttle_key.to_owned();
        let source = source.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut throttles = throttles.lock();
                if let Some(entry) = throttles.get_mut(&key) {
                    entry.pending = false;
                    entry.last_sent = tokio::time::Instant::now();
                }
            }
            registry.broadcast(&notify::ui_state_changed(&source, Some(&key), json!({})));
        });
    }

    /// Immediate `ui/state/changed`, bypassing the throttle (warnings).
    pub fn notify_state_changed_now(&self, source: &str, agent_id: Option<&str>, extra: Value) {
        self.registry
            .broadcast(&notify::ui_state_changed(source, agent_id, extra));
    }
}

/// Merge `extra`'s fields into `target` when both are objects.
fn merge_object(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        for (k, v) in extra {
            target.entry(k).or_insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cb_domain::config::AgentLaunchConfig;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        pipeline: Arc<EventPipeline>,
        registry: Arc<ConnectionRegistry>,
        tracker: Arc<TurnTracker>,
        manager: Arc<AgentManager>,
        bindings: Arc<BindingStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(ConnectionRegistry::new(10, 64, 8));
        let tracker = Arc::new(TurnTracker::new());
        let bindings = Arc::new(BindingStore::new(dir.path()).unwrap());
        let statuses = Arc::new(AgentStatusStore::new(dir.path()).unwrap());
        let manager = Arc::new(AgentManager::new(AgentLaunchConfig {
            command: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'; sleep 2"#.into(),
            ],
            ..Default::default()
        }));
        let pipeline = Arc::new(EventPipeline::new(
            registry.clone(),
            tracker.clone(),
            bindings.clone(),
            statuses,
            manager.clone(),
        ));
        Fixture {
            _dir: dir,
            pipeline,
            registry,
            tracker,
            manager,
            bindings,
        }
    }

    async fn live_client(fx: &Fixture) -> Arc<AgentClient> {
        fx.manager.launch("thread-1", ".").await.unwrap().client
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn session_configured_persists_binding() {
        let fx = fixture();
        let client = live_client(&fx).await;

        fx.pipeline
            .handle_event(
                "thread-1",
                &client,
                AgentEvent::SessionConfigured {
                    session_id: "deadbeef-0000-4000-8000-000000000001".into(),
                    rollout_path: Some("/r/1.jsonl".into()),
                },
            )
            .await;

        let row = fx.bindings.find_by_agent("thread-1").unwrap();
        assert_eq!(row.backend_session_id, "deadbeef-0000-4000-8000-000000000001");
        assert_eq!(row.rollout_hint, "/r/1.jsonl");
    }

    #[tokio::test]
    async fn fresh_session_clears_session_lost() {
        let fx = fixture();
        let client = live_client(&fx).await;
        client.mark_session_lost();

        fx.pipeline
            .handle_event(
                "thread-1",
                &client,
                AgentEvent::SessionConfigured {
                    session_id: "cafebabe-0000-4000-8000-000000000002".into(),
                    rollout_path: None,
                },
            )
            .await;

        assert!(!client.session_lost());
        assert!(fx.bindings.find_by_agent("thread-1").is_some());
    }

    #[tokio::test]
    async fn deltas_append_timeline_and_broadcast() {
        let fx = fixture();
        let client = live_client(&fx).await;
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();

        fx.pipeline
            .handle_event(
                "thread-1",
                &client,
                AgentEvent::AssistantDelta {
                    turn_id: Some("t1".into()),
                    text: "hel".into(),
                },
            )
            .await;

        let timeline = fx.pipeline.timeline("thread-1");
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].kind, "assistant_delta");

        let frames = drain(&mut rx);
        assert!(frames.iter().any(|f| f.contains("assistant/delta")));
    }

    #[tokio::test]
    async fn terminal_event_notifies_exactly_once() {
        let fx = fixture();
        let client = live_client(&fx).await;
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();
        fx.tracker.begin_turn("thread-1", None).unwrap();

        let terminal = AgentEvent::TurnCompleted {
            turn_id: Some("t1".into()),
            status: TurnStatus::Completed,
            reason: None,
        };
        fx.pipeline
            .handle_event("thread-1", &client, terminal.clone())
            .await;
        // Duplicate terminal from the subprocess: tracker already cleared.
        fx.pipeline.handle_event("thread-1", &client, terminal).await;

        let frames = drain(&mut rx);
        let completions = frames
            .iter()
            .filter(|f| f.contains("turn/completed"))
            .count();
        assert_eq!(completions, 1);
        assert!(fx.tracker.status_of("thread-1").is_none());
    }

    #[tokio::test]
    async fn hydration_dedups_by_record_id() {
        let fx = fixture();

        fx.pipeline.replace_timeline(
            "thread-1",
            vec![TimelineEntry {
                id: "m1".into(),
                kind: "user".into(),
                payload: json!({"text": "hello"}),
                at: Utc::now(),
            }],
        );

        let added = fx.pipeline.append_hydrated(
            "thread-1",
            vec![
                TimelineEntry {
                    id: "m1".into(),
                    kind: "user".into(),
                    payload: json!({"text": "hello"}),
                    at: Utc::now(),
                },
                TimelineEntry {
                    id: "m2".into(),
                    kind: "assistant".into(),
                    payload: json!({"text": "hi"}),
                    at: Utc::now(),
                },
            ],
        );

        assert_eq!(added, 1);
        assert_eq!(fx.pipeline.timeline("thread-1").len(), 2);
    }

    #[tokio::test]
    async fn state_change_bursts_coalesce() {
        let fx = fixture();
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();

        for _ in 0..5 {
            fx.pipeline.notify_state_changed("thread-1", "update");
        }
        // Leading edge only.
        assert_eq!(drain(&mut rx).len(), 1);

        // The coalesced trailing flush arrives within the throttle window.
        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("trailing flush")
            .unwrap();
        assert!(frame.contains("ui/state/changed"));
        // And nothing beyond that single flush.
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn crash_fails_active_turn_and_removes_handle() {
        let fx = fixture();
        let (_id, mut rx, _cancel) = fx.registry.register().unwrap();

        // Agent that exits right after handshake.
        let manager = Arc::new(AgentManager::new(AgentLaunchConfig {
            command: "/bin/sh".into(),
            args: vec![
                "-c".into(),
                r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'"#.into(),
            ],
            ..Default::default()
        }));
        let launched = manager.launch("thread-9", ".").await.unwrap();
        // Rebuild a pipeline over this manager so removal is observable.
        let pipeline = Arc::new(EventPipeline::new(
            fx.registry.clone(),
            fx.tracker.clone(),
            fx.bindings.clone(),
            Arc::new(AgentStatusStore::new(fx._dir.path()).unwrap()),
            manager.clone(),
        ));

        fx.tracker.begin_turn("thread-9", None).unwrap();
        pipeline.spawn_consumer(
            "thread-9".into(),
            launched.client.clone(),
            launched.events.unwrap(),
        );

        let frame = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let frame = rx.recv().await.unwrap();
                if frame.contains("turn/completed") {
                    return frame;
                }
            }
        })
        .await
        .expect("crash notification");
        assert!(frame.contains("process_crash"));
        assert!(manager.get("thread-9").is_none());
        assert!(fx.tracker.status_of("thread-9").is_none());
    }
}
