//! Resume-candidate resolution.
//!
//! Given a logical agent id, produce the ordered list of backend session ids
//! to try on resume: the id itself when it is already backend-UUID-shaped,
//! then the binding store row, then agent status rows, then message metadata
//! (most-recent-first). Candidates are deduplicated by normalized form.
//! Only cheap reads happen here.

use std::sync::Arc;

use regex::Regex;
use std::sync::LazyLock;

use cb_store::{AgentStatusStore, BindingStore, MessageStore};

static BACKEND_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
    )
    .expect("backend id regex")
});

/// Normalize a candidate id: strip an optional `urn:uuid:` prefix and
/// lowercase. Returns `None` when the result is not backend-UUID-shaped.
pub fn normalize_backend_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let stripped = trimmed
        .strip_prefix("urn:uuid:")
        .or_else(|| trimmed.strip_prefix("URN:UUID:"))
        .unwrap_or(trimmed);
    if BACKEND_ID_RE.is_match(stripped) {
        Some(stripped.to_ascii_lowercase())
    } else {
        None
    }
}

pub struct SessionResolver {
    bindings: Arc<BindingStore>,
    statuses: Arc<AgentStatusStore>,
    messages: Arc<MessageStore>,
}

impl SessionResolver {
    pub fn new(
        bindings: Arc<BindingStore>,
        statuses: Arc<AgentStatusStore>,
        messages: Arc<MessageStore>,
    ) -> Self {
        Self {
            bindings,
            statuses,
            messages,
        }
    }

    /// Ordered, deduplicated resume candidates for an agent id.
    ///
    /// An empty list means the caller must start a fresh session.
    pub fn candidates(&self, agent_id: &str) -> Vec<String> {
        // 1. The id itself already names a backend session.
        if let Some(normalized) = normalize_backend_id(agent_id) {
            return vec![normalized];
        }

        let mut out: Vec<String> = Vec::new();
        let mut push = |raw: &str| {
            if let Some(normalized) = normalize_backend_id(raw) {
                if !out.contains(&normalized) {
                    out.push(normalized);
                }
            }
        };

        // 2. The durable binding.
        if let Some(binding) = self.bindings.find_by_agent(agent_id) {
            push(&binding.backend_session_id);
        }

        // 3. Agent status rows.
        if let Some(row) = self.statuses.get(agent_id) {
            if let Some(id) = row.backend_session_id.as_deref() {
                push(id);
            }
        }

        // 4. Message metadata, most-recent-first.
        for id in self.messages.recent_backend_ids(agent_id) {
            push(&id);
        }

        out
    }

    /// Whether the agent has any history at all: a binding, a status row,
    /// stored messages, or an id that is itself a backend UUID.
    pub fn has_history(&self, agent_id: &str) -> bool {
        normalize_backend_id(agent_id).is_some()
            || self.bindings.find_by_agent(agent_id).is_some()
            || self.statuses.get(agent_id).is_some()
            || self.messages.has_history(agent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const ID_A: &str = "DEADBEEF-0000-4000-8000-000000000001";
    const ID_B: &str = "cafebabe-0000-4000-8000-000000000002";
    const ID_C: &str = "0a0b0c0d-0000-4000-8000-000000000003";

    fn resolver(dir: &TempDir) -> SessionResolver {
        SessionResolver::new(
            Arc::new(BindingStore::new(dir.path()).unwrap()),
            Arc::new(AgentStatusStore::new(dir.path()).unwrap()),
            Arc::new(MessageStore::new(dir.path()).unwrap()),
        )
    }

    #[test]
    fn normalization() {
        assert_eq!(
            normalize_backend_id(ID_A).as_deref(),
            Some("deadbeef-0000-4000-8000-000000000001")
        );
        assert_eq!(
            normalize_backend_id("urn:uuid:DEADBEEF-0000-4000-8000-000000000001").as_deref(),
            Some("deadbeef-0000-4000-8000-000000000001")
        );
        assert!(normalize_backend_id("thread-1712-1").is_none());
        assert!(normalize_backend_id("").is_none());
        assert!(normalize_backend_id("deadbeef").is_none());
    }

    #[test]
    fn uuid_shaped_id_short_circuits() {
        let dir = TempDir::new().unwrap();
        let r = resolver(&dir);
        assert_eq!(
            r.candidates(ID_A),
            vec!["deadbeef-0000-4000-8000-000000000001"]
        );
        assert!(r.has_history(ID_A));
    }

    #[test]
    fn binding_first_then_status_then_messages() {
        let dir = TempDir::new().unwrap();
        let bindings = Arc::new(BindingStore::new(dir.path()).unwrap());
        let statuses = Arc::new(AgentStatusStore::new(dir.path()).unwrap());
        let messages = Arc::new(MessageStore::new(dir.path()).unwrap());

        bindings.bind("thread-1", ID_A, "").unwrap();
        statuses.upsert("thread-1", Some(ID_B), "idle");
        messages
            .append("thread-1", "user", "x", json!({"backendSessionId": ID_C}))
            .unwrap();

        let r = SessionResolver::new(bindings, statuses, messages);
        assert_eq!(
            r.candidates("thread-1"),
            vec![
                "deadbeef-0000-4000-8000-000000000001",
                "cafebabe-0000-4000-8000-000000000002",
                "0a0b0c0d-0000-4000-8000-000000000003",
            ]
        );
    }

    #[test]
    fn duplicates_collapse_by_normalized_form() {
        let dir = TempDir::new().unwrap();
        let bindings = Arc::new(BindingStore::new(dir.path()).unwrap());
        let statuses = Arc::new(AgentStatusStore::new(dir.path()).unwrap());
        let messages = Arc::new(MessageStore::new(dir.path()).unwrap());

        bindings.bind("thread-2", ID_A, "").unwrap();
        // Same id, different case and prefixed form.
        statuses.upsert("thread-2", Some(&ID_A.to_ascii_lowercase()), "idle");
        messages
            .append(
                "thread-2",
                "user",
                "x",
                json!({"backendSessionId": format!("urn:uuid:{ID_A}")}),
            )
            .unwrap();

        let r = SessionResolver::new(bindings, statuses, messages);
        assert_eq!(
            r.candidates("thread-2"),
            vec!["deadbeef-0000-4000-8000-000000000001"]
        );
    }

    #[test]
    fn no_history_is_empty() {
        let dir = TempDir::new().unwrap();
        let r = resolver(&dir);
        assert!(r.candidates("thread-ghost").is_empty());
        assert!(!r.has_history("thread-ghost"));
    }

    #[test]
    fn non_uuid_metadata_ignored() {
        let dir = TempDir::new().unwrap();
        let bindings = Arc::new(BindingStore::new(dir.path()).unwrap());
        let statuses = Arc::new(AgentStatusStore::new(dir.path()).unwrap());
        let messages = Arc::new(MessageStore::new(dir.path()).unwrap());
        messages
            .append("thread-3", "user", "x", json!({"backendSessionId": "garbage"}))
            .unwrap();

        let r = SessionResolver::new(bindings, statuses, messages);
        assert!(r.candidates("thread-3").is_empty());
        // Still counts as history: the thread has messages.
        assert!(r.has_history("thread-3"));
    }
}
