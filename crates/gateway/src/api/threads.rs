//! Thread-level RPC handlers.

use serde::Deserialize;
use serde_json::{json, Value};

use cb_agent_client::{AgentError, SlashVerb};
use cb_domain::error::{CoreError, Result};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

fn require_thread_id(thread_id: &str) -> Result<&str> {
    let trimmed = thread_id.trim();
    if trimmed.is_empty() {
        return Err(CoreError::InvalidInput("threadId must not be empty".into()));
    }
    Ok(trimmed)
}

/// Run a slash verb against a thread's subprocess.
///
/// Verbs that operate on session history (`compact`, `undo`) launch the
/// subprocess when needed; the rest require a live handle.
pub(crate) async fn run_slash(
    state: &AppState,
    thread_id: &str,
    verb: SlashVerb,
    args: Value,
) -> Result<Value> {
    let client = match state.manager.get(thread_id) {
        Some(client) => client,
        None if verb.auto_launches() => state.ensure_ready.ensure_ready(thread_id, None).await?,
        None => {
            return Err(CoreError::NotFound(format!(
                "no live agent for thread {thread_id}"
            )))
        }
    };

    match client.send_command(verb, args).await {
        Ok(result) => Ok(result),
        // Success-equivalent: nothing to act on.
        Err(AgentError::NoActiveTurn) => Ok(Value::Null),
        Err(e) => Err(CoreError::Upstream(format!("{} failed: {e}", verb.as_str()))),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// thread/start & thread/resume
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ThreadStartParams {
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default, rename = "approvalPolicy")]
    approval_policy: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default, rename = "modelProvider")]
    model_provider: Option<String>,
}

pub async fn thread_start(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadStartParams = parse(params)?;
    let cwd = params.cwd.clone().filter(|c| !c.is_empty()).unwrap_or_else(|| ".".into());

    let thread_id = state.mint_thread_id();
    state.statuses.upsert(&thread_id, None, "created");

    let launched = state
        .manager
        .launch(&thread_id, &cwd)
        .await
        .map_err(|e| CoreError::Upstream(format!("launch: {e}")))?;
    if let Some(events) = launched.events {
        state
            .pipeline
            .spawn_consumer(thread_id.clone(), launched.client.clone(), events);
    }
    state.statuses.upsert(&thread_id, None, "running");

    // Best-effort model selection; the thread is usable either way.
    if params.model.is_some() || params.model_provider.is_some() {
        let client = launched.client.clone();
        let args = json!({ "model": params.model, "provider": params.model_provider });
        tokio::spawn(async move {
            if let Err(e) = client.send_command(SlashVerb::Model, args).await {
                tracing::debug!(error = %e, "initial model set failed");
            }
        });
    }

    let mut response = json!({
        "thread": { "id": thread_id, "status": "running" },
        "cwd": cwd,
    });
    if let Some(policy) = params.approval_policy {
        response["approvalPolicy"] = json!(policy);
    }
    if let Some(model) = params.model {
        response["model"] = json!(model);
    }
    if let Some(provider) = params.model_provider {
        response["modelProvider"] = json!(provider);
    }
    Ok(response)
}

#[derive(Debug, Deserialize)]
struct ThreadResumeParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    model: Option<String>,
}

pub async fn thread_resume(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadResumeParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;
    let cwd = params.cwd.as_deref().or(params.path.as_deref());

    state.ensure_ready.ensure_ready(thread_id, cwd).await?;

    Ok(json!({
        "thread": { "id": thread_id, "status": "resumed" },
        "model": params.model,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// thread/fork
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ThreadForkParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default, rename = "turnIndex")]
    turn_index: Option<usize>,
}

pub async fn thread_fork(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadForkParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;
    if !state.resolver.has_history(thread_id) {
        return Err(CoreError::NotFound(format!("thread {thread_id}")));
    }

    let fork_id = state.mint_thread_id();

    // Copy history in chronological order, optionally truncated after the
    // n-th user turn.
    let page = state
        .messages
        .page(thread_id, state.config.hydration.max_records, 0)?;
    let mut chronological = page.messages;
    chronological.reverse();

    let mut user_turns = 0usize;
    for message in &chronological {
        if message.role == "user" {
            user_turns += 1;
            if let Some(turn_index) = params.turn_index {
                if user_turns > turn_index {
                    break;
                }
            }
        }
        state.messages.append(
            &fork_id,
            &message.role,
            &message.text,
            message.metadata.clone(),
        )?;
    }

    state.statuses.upsert(&fork_id, None, "created");
    tracing::info!(
        from = %thread_id,
        to = %fork_id,
        turn_index = ?params.turn_index,
        "thread forked"
    );

    Ok(json!({ "thread": { "id": fork_id, "forkedFrom": thread_id } }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Aliases, rollback, archive
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct ThreadNameParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    name: String,
}

pub async fn thread_name_set(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadNameParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;

    state.prefs.set_alias(thread_id, &params.name)?;

    // Best-effort rename inside the subprocess session.
    if let Some(client) = state.manager.get(thread_id) {
        let name = params.name.clone();
        tokio::spawn(async move {
            if let Err(e) = client
                .send_command(SlashVerb::Rename, json!({ "name": name }))
                .await
            {
                tracing::debug!(error = %e, "session rename failed");
            }
        });
    }
    state.pipeline.notify_state_changed(thread_id, "alias");
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct ThreadRollbackParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "turnIndex")]
    turn_index: u64,
}

pub async fn thread_rollback(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadRollbackParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;
    run_slash(
        &state,
        thread_id,
        SlashVerb::Undo,
        json!({ "turnIndex": params.turn_index }),
    )
    .await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct ThreadIdParams {
    #[serde(rename = "threadId")]
    thread_id: String,
}

pub async fn thread_archive(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;

    state.prefs.set_archived(thread_id, true)?;
    // Archived threads release their subprocess.
    state.manager.stop(thread_id).await;
    state.statuses.upsert(thread_id, None, "archived");
    state.pipeline.notify_state_changed(thread_id, "archive");
    Ok(json!({}))
}

pub async fn thread_unarchive(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;

    state.prefs.set_archived(thread_id, false)?;
    state.statuses.upsert(thread_id, None, "offline");
    state.pipeline.notify_state_changed(thread_id, "unarchive");
    Ok(json!({}))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Listing & resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn thread_list(state: AppState, _params: Value) -> Result<Value> {
    let aliases = state.prefs.aliases();
    let archived = state.prefs.archived();
    let live: std::collections::HashMap<String, String> = state
        .manager
        .list()
        .into_iter()
        .map(|info| (info.agent_id.clone(), info.state.wire_name().to_owned()))
        .collect();

    let threads: Vec<Value> = state
        .statuses
        .list()
        .into_iter()
        .map(|row| {
            let name = aliases
                .get(&row.agent_id)
                .cloned()
                .unwrap_or_else(|| row.agent_id.clone());
            let current = live.get(&row.agent_id).cloned().unwrap_or(row.state);
            json!({
                "id": row.agent_id,
                "name": name,
                "state": current,
                "archived": archived.contains(&row.agent_id),
            })
        })
        .collect();

    Ok(json!({ "threads": threads }))
}

pub async fn thread_loaded_list(state: AppState, _params: Value) -> Result<Value> {
    let aliases = state.prefs.aliases();
    let threads: Vec<Value> = state
        .manager
        .list()
        .into_iter()
        .map(|info| {
            let name = aliases
                .get(&info.agent_id)
                .cloned()
                .unwrap_or_else(|| info.agent_id.clone());
            json!({
                "id": info.agent_id,
                "name": name,
                "state": info.state.wire_name(),
            })
        })
        .collect();
    Ok(json!({ "threads": threads }))
}

pub async fn thread_resolve(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;

    let live = state.manager.get(thread_id);
    let backend_session_id = live
        .as_ref()
        .and_then(|c| c.backend_session_id())
        .or_else(|| {
            state
                .bindings
                .find_by_agent(thread_id)
                .map(|b| b.backend_session_id)
        });
    let status = live
        .map(|c| c.state().wire_name().to_owned())
        .or_else(|| state.statuses.get(thread_id).map(|r| r.state));

    Ok(json!({
        "threadId": thread_id,
        "codexThreadId": backend_session_id,
        "state": status,
        "hasHistory": state.resolver.has_history(thread_id),
    }))
}

#[derive(Debug, Deserialize)]
struct ThreadMessagesParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    before: Option<u64>,
}

pub async fn thread_messages(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadMessagesParams = parse(params)?;
    let thread_id = require_thread_id(&params.thread_id)?;

    let page = state.hydrator.get_page(
        thread_id,
        params.limit.unwrap_or(0),
        params.before.unwrap_or(0),
    )?;
    Ok(json!({ "messages": page.messages, "total": page.total }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slash passthroughs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn thread_compact_start(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::Compact,
        Value::Null,
    )
    .await?;
    Ok(json!({}))
}

pub async fn thread_undo(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::Undo,
        Value::Null,
    )
    .await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct ThreadModelParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    model: String,
    #[serde(default)]
    provider: Option<String>,
}

pub async fn thread_model_set(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadModelParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::Model,
        json!({ "model": params.model, "provider": params.provider }),
    )
    .await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct ThreadApprovalsParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    policy: String,
}

pub async fn thread_approvals_set(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadApprovalsParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::Approvals,
        json!({ "policy": params.policy }),
    )
    .await?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct ThreadPersonalityParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    personality: String,
}

pub async fn thread_personality_set(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadPersonalityParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::Personality,
        json!({ "personality": params.personality }),
    )
    .await?;
    Ok(json!({}))
}

pub async fn thread_mcp_list(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::McpList,
        Value::Null,
    )
    .await
}

pub async fn thread_skills_list(state: AppState, params: Value) -> Result<Value> {
    let params: ThreadIdParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::SkillsList,
        Value::Null,
    )
    .await
}

#[derive(Debug, Deserialize)]
struct ReviewStartParams {
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(default)]
    delivery: Option<String>,
}

pub async fn review_start(state: AppState, params: Value) -> Result<Value> {
    let params: ReviewStartParams = parse(params)?;
    run_slash(
        &state,
        require_thread_id(&params.thread_id)?,
        SlashVerb::Review,
        json!({ "delivery": params.delivery }),
    )
    .await?;
    Ok(json!({}))
}
