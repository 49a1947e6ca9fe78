//! `ui/state/get` — the composed snapshot the UI renders from.

use serde_json::{json, Map, Value};

use cb_domain::error::Result;

use crate::state::AppState;

/// Compose the full UI snapshot: thread list with aliases, active turn
/// statuses, timelines and token usage for live threads, agent runtime
/// info, and the resolved backend session ids.
pub async fn ui_state_get(state: AppState, _params: Value) -> Result<Value> {
    let aliases = state.prefs.aliases();
    let archived = state.prefs.archived();
    let agents = state.manager.list();

    let threads: Vec<Value> = state
        .statuses
        .list()
        .into_iter()
        .map(|row| {
            let name = aliases
                .get(&row.agent_id)
                .cloned()
                .unwrap_or_else(|| row.agent_id.clone());
            json!({
                "id": row.agent_id,
                "name": name,
                "state": row.state,
                "archived": archived.contains(&row.agent_id),
                "updatedAt": row.updated_at,
            })
        })
        .collect();

    let mut timelines = Map::new();
    let mut usage = Map::new();
    let mut resolved = Map::new();
    for info in &agents {
        timelines.insert(
            info.agent_id.clone(),
            serde_json::to_value(state.pipeline.timeline(&info.agent_id))?,
        );
        usage.insert(
            info.agent_id.clone(),
            serde_json::to_value(state.pipeline.usage_of(&info.agent_id))?,
        );
        if let Some(session_id) = &info.backend_session_id {
            resolved.insert(info.agent_id.clone(), json!(session_id));
        }
    }
    // Bindings resolve ids for offline threads too.
    for binding in state.bindings.list_all() {
        resolved
            .entry(binding.agent_id.clone())
            .or_insert_with(|| json!(binding.backend_session_id));
    }

    Ok(json!({
        "threads": threads,
        "activeTurns": state.tracker.active(),
        "timelines": timelines,
        "tokenUsage": usage,
        "agents": agents,
        "resolvedSessionIds": resolved,
        "connections": state.registry.len(),
    }))
}
