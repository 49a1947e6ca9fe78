//! Message history and agent status rows.
//!
//! Messages are append-only JSONL, one file per thread under
//! `messages/<thread_id>.jsonl`, in arrival order; paging reads are
//! newest-first. Agent status rows live in `statuses.json` and feed both the
//! resume-candidate resolver (secondary id source) and `thread/list`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cb_domain::error::{CoreError, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One historical message in a thread's timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadMessage {
    /// Record id, unique within the thread (used for hydration dedup).
    pub id: String,
    /// Monotonic per-thread sequence number, 1-based.
    pub seq: u64,
    pub thread_id: String,
    /// `user`, `assistant`, `tool`, or `attachment`.
    pub role: String,
    pub text: String,
    /// Free-form metadata; may carry `backendSessionId` for the resolver.
    #[serde(default)]
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

/// A newest-first page of messages.
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<ThreadMessage>,
    pub total: usize,
}

/// Append-only JSONL message store, one file per thread.
pub struct MessageStore {
    dir: PathBuf,
    /// Serializes appends per process; readers go straight to the file.
    write_lock: Mutex<()>,
}

impl MessageStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        let dir = state_path.join("messages");
        std::fs::create_dir_all(&dir).map_err(CoreError::Io)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        // Thread ids are gateway-minted (`thread-<ms>-<n>`) or UUIDs; strip
        // path separators defensively all the same.
        let safe: String = thread_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.dir.join(format!("{safe}.jsonl"))
    }

    /// Append a message, assigning its sequence number.
    pub fn append(
        &self,
        thread_id: &str,
        role: &str,
        text: &str,
        metadata: Value,
    ) -> Result<ThreadMessage> {
        let _guard = self.write_lock.lock();
        let seq = self.count(thread_id)? as u64 + 1;
        let message = ThreadMessage {
            id: uuid::Uuid::new_v4().to_string(),
            seq,
            thread_id: thread_id.to_owned(),
            role: role.to_owned(),
            text: text.to_owned(),
            metadata,
            created_at: Utc::now(),
        };

        let line = serde_json::to_string(&message).map_err(CoreError::Json)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.thread_path(thread_id))
            .map_err(CoreError::Io)?;
        writeln!(file, "{line}").map_err(CoreError::Io)?;
        Ok(message)
    }

    /// All messages for a thread in arrival order. Unparseable lines are
    /// skipped.
    fn load(&self, thread_id: &str) -> Result<Vec<ThreadMessage>> {
        let path = self.thread_path(thread_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path).map_err(CoreError::Io)?;
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }

    /// Number of messages in a thread.
    pub fn count(&self, thread_id: &str) -> Result<usize> {
        Ok(self.load(thread_id)?.len())
    }

    /// Whether the thread has any history at all.
    pub fn has_history(&self, thread_id: &str) -> bool {
        self.thread_path(thread_id).exists()
    }

    /// A newest-first page. `before == 0` starts from the newest message;
    /// `before > 0` returns messages with `seq < before`.
    pub fn page(&self, thread_id: &str, limit: usize, before: u64) -> Result<MessagePage> {
        let all = self.load(thread_id)?;
        let total = all.len();
        let mut messages: Vec<ThreadMessage> = all
            .into_iter()
            .filter(|m| before == 0 || m.seq < before)
            .collect();
        messages.sort_by(|a, b| b.seq.cmp(&a.seq));
        messages.truncate(limit);
        Ok(MessagePage { messages, total })
    }

    /// Backend session ids recorded in message metadata, most-recent-first,
    /// for the resume-candidate resolver.
    pub fn recent_backend_ids(&self, thread_id: &str) -> Vec<String> {
        let Ok(all) = self.load(thread_id) else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        for message in all.iter().rev() {
            if let Some(id) = message
                .metadata
                .get("backendSessionId")
                .and_then(Value::as_str)
            {
                if !ids.iter().any(|existing| existing == id) {
                    ids.push(id.to_owned());
                }
            }
        }
        ids
    }

    /// Thread ids that have message files on disk.
    pub fn list_threads(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().into_string().ok()?;
                name.strip_suffix(".jsonl").map(str::to_owned)
            })
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent status rows
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lightweight per-agent status, updated as the runtime observes activity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentStatusRow {
    pub agent_id: String,
    #[serde(default)]
    pub backend_session_id: Option<String>,
    /// Last observed handle state (`idle`, `busy`, ...), or `offline`.
    pub state: String,
    pub updated_at: DateTime<Utc>,
}

/// File-backed agent status table (`statuses.json`).
pub struct AgentStatusStore {
    path: PathBuf,
    rows: RwLock<HashMap<String, AgentStatusRow>>,
}

impl AgentStatusStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(CoreError::Io)?;
        let path = state_path.join("statuses.json");
        let rows: HashMap<String, AgentStatusRow> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(CoreError::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    pub fn upsert(&self, agent_id: &str, backend_session_id: Option<&str>, state: &str) {
        let row = AgentStatusRow {
            agent_id: agent_id.to_owned(),
            backend_session_id: backend_session_id.map(str::to_owned),
            state: state.to_owned(),
            updated_at: Utc::now(),
        };
        self.rows.write().insert(agent_id.to_owned(), row);
        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist agent statuses");
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentStatusRow> {
        self.rows.read().get(agent_id).cloned()
    }

    /// All rows, most-recently-updated first.
    pub fn list(&self) -> Vec<AgentStatusRow> {
        let mut rows: Vec<_> = self.rows.read().values().cloned().collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.rows.read().clone();
        let raw = serde_json::to_string_pretty(&snapshot).map_err(CoreError::Json)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(CoreError::Io)?;
        std::fs::rename(&tmp, &self.path).map_err(CoreError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, MessageStore) {
        let dir = TempDir::new().unwrap();
        let store = MessageStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn append_assigns_sequence() {
        let (_dir, store) = store();
        let m1 = store.append("thread-1", "user", "hello", json!({})).unwrap();
        let m2 = store.append("thread-1", "assistant", "hi", json!({})).unwrap();
        assert_eq!(m1.seq, 1);
        assert_eq!(m2.seq, 2);
        assert_eq!(store.count("thread-1").unwrap(), 2);
    }

    #[test]
    fn page_is_newest_first() {
        let (_dir, store) = store();
        for i in 0..5 {
            store
                .append("thread-1", "user", &format!("m{i}"), json!({}))
                .unwrap();
        }

        let page = store.page("thread-1", 2, 0).unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.messages[0].text, "m4");
        assert_eq!(page.messages[1].text, "m3");

        // Cursor: seq < 4 → m2, m1.
        let page = store.page("thread-1", 2, 4).unwrap();
        assert_eq!(page.messages[0].text, "m2");
        assert_eq!(page.messages[1].text, "m1");
    }

    #[test]
    fn page_of_unknown_thread_is_empty() {
        let (_dir, store) = store();
        let page = store.page("ghost", 10, 0).unwrap();
        assert!(page.messages.is_empty());
        assert_eq!(page.total, 0);
        assert!(!store.has_history("ghost"));
    }

    #[test]
    fn recent_backend_ids_most_recent_first_deduped() {
        let (_dir, store) = store();
        store
            .append("t", "user", "a", json!({"backendSessionId": "s-old"}))
            .unwrap();
        store
            .append("t", "user", "b", json!({"backendSessionId": "s-new"}))
            .unwrap();
        store
            .append("t", "user", "c", json!({"backendSessionId": "s-new"}))
            .unwrap();
        store.append("t", "user", "d", json!({})).unwrap();

        assert_eq!(store.recent_backend_ids("t"), vec!["s-new", "s-old"]);
    }

    #[test]
    fn status_rows_sorted_by_recency() {
        let dir = TempDir::new().unwrap();
        let statuses = AgentStatusStore::new(dir.path()).unwrap();
        statuses.upsert("a", Some("s1"), "idle");
        statuses.upsert("b", None, "busy");

        let rows = statuses.list();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].agent_id, "b");
        assert_eq!(statuses.get("a").unwrap().backend_session_id.as_deref(), Some("s1"));
    }
}
