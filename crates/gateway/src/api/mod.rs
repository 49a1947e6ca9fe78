//! RPC method handlers and their registration.

pub mod config;
pub mod exec;
pub mod threads;
pub mod turns;
pub mod ui_state;

use std::future::Future;

use serde_json::{json, Value};

use cb_domain::error::Result;

use crate::rpc::dispatch::{Dispatcher, RequestCtx};
use crate::state::AppState;

/// Register a plain handler that does not need the request context.
fn route<F, Fut>(dispatcher: &Dispatcher, state: &AppState, method: &str, handler: F)
where
    F: Fn(AppState, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let state = state.clone();
    dispatcher.register(method, move |_ctx, params| handler(state.clone(), params));
}

/// Wire every method the gateway exposes onto the dispatcher.
pub fn register_all(state: &AppState) {
    let dispatcher = state.dispatcher.clone();

    // ── Handshake ─────────────────────────────────────────────────────
    {
        let state = state.clone();
        dispatcher.register("initialize", move |ctx, params| {
            let state = state.clone();
            async move { initialize(state, ctx, params).await }
        });
    }

    // ── Threads ───────────────────────────────────────────────────────
    route(&dispatcher, state, "thread/start", threads::thread_start);
    route(&dispatcher, state, "thread/resume", threads::thread_resume);
    route(&dispatcher, state, "thread/fork", threads::thread_fork);
    route(&dispatcher, state, "thread/name/set", threads::thread_name_set);
    route(&dispatcher, state, "thread/rollback", threads::thread_rollback);
    route(&dispatcher, state, "thread/list", threads::thread_list);
    route(
        &dispatcher,
        state,
        "thread/loaded/list",
        threads::thread_loaded_list,
    );
    route(&dispatcher, state, "thread/resolve", threads::thread_resolve);
    route(&dispatcher, state, "thread/messages", threads::thread_messages);
    route(&dispatcher, state, "thread/archive", threads::thread_archive);
    route(&dispatcher, state, "thread/unarchive", threads::thread_unarchive);

    // ── Slash passthroughs ────────────────────────────────────────────
    route(
        &dispatcher,
        state,
        "thread/compact/start",
        threads::thread_compact_start,
    );
    route(&dispatcher, state, "thread/undo", threads::thread_undo);
    route(&dispatcher, state, "thread/model/set", threads::thread_model_set);
    route(
        &dispatcher,
        state,
        "thread/approvals/set",
        threads::thread_approvals_set,
    );
    route(
        &dispatcher,
        state,
        "thread/personality/set",
        threads::thread_personality_set,
    );
    route(&dispatcher, state, "thread/mcp/list", threads::thread_mcp_list);
    route(
        &dispatcher,
        state,
        "thread/skills/list",
        threads::thread_skills_list,
    );
    route(&dispatcher, state, "review/start", threads::review_start);

    // ── Turns ─────────────────────────────────────────────────────────
    route(&dispatcher, state, "turn/start", turns::turn_start);
    route(&dispatcher, state, "turn/steer", turns::turn_steer);
    route(&dispatcher, state, "turn/interrupt", turns::turn_interrupt);
    route(
        &dispatcher,
        state,
        "turn/forceComplete",
        turns::turn_force_complete,
    );

    // ── UI state ──────────────────────────────────────────────────────
    route(&dispatcher, state, "ui/state/get", ui_state::ui_state_get);

    // ── Config & preferences ──────────────────────────────────────────
    route(
        &dispatcher,
        state,
        "config/value/write",
        config::config_value_write,
    );
    route(
        &dispatcher,
        state,
        "config/batchWrite",
        config::config_batch_write,
    );
    route(&dispatcher, state, "preference/write", config::preference_write);
    route(&dispatcher, state, "preference/read", config::preference_read);

    // ── Exec gate ─────────────────────────────────────────────────────
    route(&dispatcher, state, "command/exec", exec::command_exec);

    // ── Stubs for legacy clients ──────────────────────────────────────
    // External collaborators the core does not implement; structurally
    // valid placeholders instead of `method not found`.
    dispatcher.register_stub("dashboard/summary", json!({}));
    dispatcher.register_stub("log/query", json!({ "entries": [] }));
    dispatcher.register_stub("file/search/fuzzy", json!({ "results": [] }));
    dispatcher.register_stub("lsp/diagnostics", json!({ "diagnostics": [] }));
    dispatcher.register_stub("tools/registry/list", json!({ "tools": [] }));
    dispatcher.register_stub("workspace/runs/list", json!({ "runs": [] }));
    dispatcher.register_stub("skills/config/get", json!({ "skills": [] }));
}

/// `initialize`: handshake plus per-connection capability flags.
async fn initialize(state: AppState, ctx: RequestCtx, params: Value) -> Result<Value> {
    let receives_server_requests = params
        .get("capabilities")
        .and_then(|c| c.get("serverRequests"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    state
        .registry
        .set_receives_server_requests(ctx.conn_id, receives_server_requests);

    Ok(json!({
        "protocolVersion": "1.0",
        "serverInfo": {
            "name": "crewbridge",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": {
            "threads": true,
            "turns": true,
            "serverRequests": true,
        },
    }))
}
