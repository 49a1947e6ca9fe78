//! Turn-level RPC handlers: start, steer, interrupt, force-complete.

use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Value};

use cb_agent_client::{AgentError, HandleState, SlashVerb};
use cb_domain::error::{CoreError, Result};
use cb_protocol::input::{TurnPayload, UserInput};
use cb_protocol::notify;

use crate::runtime::tracker::{TurnState, WaitOutcome};
use crate::state::AppState;

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// turn/start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct TurnStartParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    input: Vec<UserInput>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default, rename = "outputSchema")]
    output_schema: Option<Value>,
}

pub async fn turn_start(state: AppState, params: Value) -> Result<Value> {
    let params: TurnStartParams = parse(params)?;
    let thread_id = params.thread_id.trim().to_owned();
    if thread_id.is_empty() {
        return Err(CoreError::InvalidInput("threadId must not be empty".into()));
    }

    let payload = TurnPayload::from_inputs(&params.input);
    if payload.is_empty() {
        return Err(CoreError::InvalidInput("input must not be empty".into()));
    }

    let client = state
        .ensure_ready
        .ensure_ready(&thread_id, params.cwd.as_deref())
        .await?;

    let turn_id = state.tracker.begin_turn(&thread_id, None)?;

    // Record the user message before submit so history and timeline agree.
    let metadata = match client.backend_session_id() {
        Some(session_id) => json!({ "backendSessionId": session_id }),
        None => json!({}),
    };
    let stored = state
        .messages
        .append(&thread_id, "user", &payload.prompt, metadata);
    match &stored {
        Ok(message) => state.pipeline.append_local(
            &thread_id,
            &message.id,
            "user",
            json!({ "text": payload.prompt }),
        ),
        Err(e) => tracing::warn!(error = %e, "failed to persist user message"),
    }

    if let Err(e) = client
        .submit(
            &payload.prompt,
            &payload.images,
            &payload.files,
            params.output_schema,
        )
        .await
    {
        // Failed start: no tracker record, no turn/completed.
        state.tracker.abort(&thread_id);
        return Err(CoreError::Upstream(format!("submit: {e}")));
    }

    state
        .statuses
        .upsert(&thread_id, client.backend_session_id().as_deref(), "busy");
    state.pipeline.notify_state_changed(&thread_id, "turn_started");

    Ok(json!({ "turn": { "id": turn_id, "status": "inProgress" } }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// turn/steer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct TurnSteerParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    input: Vec<UserInput>,
}

/// Steering never creates a tracker record: it adds input to the active
/// turn, and is rejected when nothing is running.
pub async fn turn_steer(state: AppState, params: Value) -> Result<Value> {
    let params: TurnSteerParams = parse(params)?;
    let thread_id = params.thread_id.trim();

    if state.tracker.status_of(thread_id).is_none() {
        return Err(CoreError::NotFound(format!(
            "no active turn for thread {thread_id}"
        )));
    }
    let client = state
        .manager
        .get(thread_id)
        .ok_or_else(|| CoreError::NotFound(format!("no live agent for thread {thread_id}")))?;

    let payload = TurnPayload::from_inputs(&params.input);
    if payload.is_empty() {
        return Err(CoreError::InvalidInput("input must not be empty".into()));
    }

    client
        .steer(&payload.prompt, &payload.images, &payload.files)
        .await
        .map_err(|e| CoreError::Upstream(format!("steer: {e}")))?;
    Ok(json!({}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// turn/interrupt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ThreadIdParams {
    #[serde(rename = "threadId")]
    thread_id: String,
}

pub async fn turn_interrupt(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    let thread_id = params.thread_id.trim().to_owned();

    let client = state.manager.get(&thread_id);
    let tracked_before = state.tracker.status_of(&thread_id);
    let handle_active = client
        .as_ref()
        .map(|c| c.active_turn_id().is_some() || c.state() == HandleState::Busy)
        .unwrap_or(false);
    let active_observed = tracked_before.is_some() || handle_active;
    let state_before = tracked_before.map(TurnState::as_str).unwrap_or("idle");

    if !active_observed {
        return Ok(json!({
            "confirmed": false,
            "mode": "no_active_turn",
            "interruptSent": false,
            "stateBefore": state_before,
            "stateAfter": "idle",
            "waitedMs": 0,
            "activeObserved": false,
        }));
    }

    state.tracker.mark_interrupt_requested(&thread_id);
    // Register for the terminal before sending the interrupt so a fast
    // subprocess response cannot slip past the waiter.
    let terminal_rx = state.tracker.subscribe(&thread_id);

    let mut interrupt_sent = false;
    if let Some(client) = &client {
        match client.send_command(SlashVerb::Interrupt, Value::Null).await {
            Ok(_) => interrupt_sent = true,
            Err(AgentError::NoActiveTurn) => {
                // The subprocess has nothing running, yet we tracked a turn:
                // settle the tracker so the UI is not stuck.
                if tracked_before.is_some() {
                    if let Some(outcome) = state.tracker.complete(
                        &thread_id,
                        TurnState::Completed,
                        Some("interrupt_no_active_turn"),
                    ) {
                        state.registry.broadcast(&notify::turn_completed(
                            &thread_id,
                            outcome.status.as_str(),
                            outcome.reason.as_deref(),
                        ));
                    }
                    return Ok(json!({
                        "confirmed": true,
                        "mode": "no_active_turn",
                        "interruptSent": false,
                        "stateBefore": state_before,
                        "stateAfter": "idle",
                        "waitedMs": 0,
                        "activeObserved": true,
                    }));
                }
            }
            Err(e) => {
                tracing::warn!(thread_id = %thread_id, error = %e, "interrupt send failed");
            }
        }
    }

    let settle = Duration::from_secs(state.config.turns.interrupt_settle_sec);
    let started = Instant::now();
    let outcome = match terminal_rx {
        Some(rx) => crate::runtime::tracker::TurnTracker::wait_on(rx, settle).await,
        None => WaitOutcome::NoActiveTurn,
    };
    let waited_ms = started.elapsed().as_millis() as u64;

    let (confirmed, mode) = match &outcome {
        WaitOutcome::Terminal(terminal) => match terminal.status {
            TurnState::Interrupted => (true, "interrupt_confirmed"),
            TurnState::Completed => (true, "interrupt_terminal_completed"),
            _ => (true, "interrupt_terminal_failed"),
        },
        // The turn vanished between snapshot and wait; it reached terminal.
        WaitOutcome::NoActiveTurn => (true, "no_active_turn"),
        WaitOutcome::Timeout => (false, "interrupt_timeout"),
    };
    let state_after = state
        .tracker
        .status_of(&thread_id)
        .map(TurnState::as_str)
        .unwrap_or("idle");

    Ok(json!({
        "confirmed": confirmed,
        "mode": mode,
        "interruptSent": interrupt_sent,
        "stateBefore": state_before,
        "stateAfter": state_after,
        "waitedMs": waited_ms,
        "activeObserved": active_observed,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// turn/forceComplete
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unconditional: best-effort interrupt, settle the tracker, notify. Never
/// fails, and a second call is a no-op with the same response.
pub async fn turn_force_complete(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    let thread_id = params.thread_id.trim().to_owned();

    if let Some(client) = state.manager.get(&thread_id) {
        tokio::spawn(async move {
            if let Err(e) = client.send_command(SlashVerb::Interrupt, Value::Null).await {
                tracing::debug!(error = %e, "force-complete interrupt ignored");
            }
        });
    }

    if let Some(outcome) =
        state
            .tracker
            .complete(&thread_id, TurnState::Completed, Some("force_complete"))
    {
        state.registry.broadcast(&notify::turn_completed(
            &thread_id,
            outcome.status.as_str(),
            outcome.reason.as_deref(),
        ));
        state
            .statuses
            .upsert(&thread_id, None, "idle");
        state.pipeline.notify_state_changed(&thread_id, "force_complete");
    }

    Ok(json!({ "confirmed": true, "forceCompleted": true }))
}
