//! Server→client notification names and constructors.

use serde_json::{json, Value};

use crate::jsonrpc::RpcNotification;

/// Emitted exactly once per successfully started turn.
pub const TURN_COMPLETED: &str = "turn/completed";
/// Emitted when background hydration for a thread finishes.
pub const THREAD_MESSAGES_PAGE: &str = "thread/messages/page";
/// Coarse aggregated UI snapshot; throttled per throttle key.
pub const UI_STATE_CHANGED: &str = "ui/state/changed";

/// Build a `turn/completed` notification.
pub fn turn_completed(thread_id: &str, status: &str, reason: Option<&str>) -> RpcNotification {
    let mut params = json!({
        "threadId": thread_id,
        "status": status,
    });
    if let Some(reason) = reason {
        params["reason"] = json!(reason);
    }
    RpcNotification::new(TURN_COMPLETED, params)
}

/// Build a `thread/messages/page` hydration-complete notification.
pub fn thread_messages_page(thread_id: &str, total_count: usize, pages: usize) -> RpcNotification {
    RpcNotification::new(
        THREAD_MESSAGES_PAGE,
        json!({
            "threadId": thread_id,
            "totalCount": total_count,
            "pages": pages,
        }),
    )
}

/// Build a `ui/state/changed` notification with a `source` marker and
/// arbitrary extra fields.
pub fn ui_state_changed(source: &str, agent_id: Option<&str>, extra: Value) -> RpcNotification {
    let mut params = json!({ "source": source });
    if let Some(agent_id) = agent_id {
        params["agent_id"] = json!(agent_id);
    }
    if let Value::Object(extra) = extra {
        if let Value::Object(obj) = &mut params {
            obj.extend(extra);
        }
    }
    RpcNotification::new(UI_STATE_CHANGED, params)
}
