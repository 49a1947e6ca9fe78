//! Durable agentId ↔ backendSessionId bindings.
//!
//! Persists the binding table in `bindings.json` under the state path. This
//! file is the single durable record of the 1:1 binding invariant: at most
//! one row per agent id, updates overwrite, rows are never deleted here.
//! Readers tolerate stale rows (the session may no longer be recoverable);
//! the ensure-ready path detects that and re-binds.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use cb_domain::error::{CoreError, Result};

/// One row of the binding table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentBinding {
    pub agent_id: String,
    pub backend_session_id: String,
    /// Path hint to the subprocess rollout file, when known.
    #[serde(default)]
    pub rollout_hint: String,
    pub updated_at: DateTime<Utc>,
}

/// File-backed binding store.
pub struct BindingStore {
    path: PathBuf,
    rows: RwLock<HashMap<String, AgentBinding>>,
}

impl BindingStore {
    /// Load or create the store at `state_path/bindings.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(CoreError::Io)?;
        let path = state_path.join("bindings.json");
        let rows: HashMap<String, AgentBinding> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(CoreError::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            bindings = rows.len(),
            path = %path.display(),
            "binding store loaded"
        );

        Ok(Self {
            path,
            rows: RwLock::new(rows),
        })
    }

    /// Current binding for an agent, if any.
    pub fn find_by_agent(&self, agent_id: &str) -> Option<AgentBinding> {
        self.rows.read().get(agent_id).cloned()
    }

    /// Upsert the binding for an agent.
    ///
    /// The in-memory row is always updated; a persistence failure is logged
    /// and returned, but callers in the turn path proceed regardless
    /// (degraded mode — the binding is re-persisted on the next bind).
    pub fn bind(
        &self,
        agent_id: &str,
        backend_session_id: &str,
        rollout_hint: &str,
    ) -> Result<()> {
        let row = AgentBinding {
            agent_id: agent_id.to_owned(),
            backend_session_id: backend_session_id.to_owned(),
            rollout_hint: rollout_hint.to_owned(),
            updated_at: Utc::now(),
        };
        self.rows.write().insert(agent_id.to_owned(), row);
        tracing::debug!(
            agent_id = %agent_id,
            backend_session_id = %backend_session_id,
            "binding updated"
        );

        if let Err(e) = self.persist() {
            tracing::warn!(error = %e, "failed to persist bindings (continuing in memory)");
            return Err(e);
        }
        Ok(())
    }

    /// All bindings, for restart recovery enumeration.
    pub fn list_all(&self) -> Vec<AgentBinding> {
        self.rows.read().values().cloned().collect()
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.rows.read().clone();
        let raw = serde_json::to_string_pretty(&snapshot).map_err(CoreError::Json)?;
        // Write-then-rename so readers never see a torn file.
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).map_err(CoreError::Io)?;
        std::fs::rename(&tmp, &self.path).map_err(CoreError::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn bind_and_find() {
        let dir = TempDir::new().unwrap();
        let store = BindingStore::new(dir.path()).unwrap();

        assert!(store.find_by_agent("thread-1").is_none());
        store
            .bind("thread-1", "deadbeef-0000-4000-8000-000000000001", "")
            .unwrap();

        let row = store.find_by_agent("thread-1").unwrap();
        assert_eq!(
            row.backend_session_id,
            "deadbeef-0000-4000-8000-000000000001"
        );
        assert_eq!(row.rollout_hint, "");
    }

    #[test]
    fn bind_overwrites_single_row() {
        let dir = TempDir::new().unwrap();
        let store = BindingStore::new(dir.path()).unwrap();

        store.bind("thread-1", "aaaaaaaa-0000-4000-8000-000000000001", "").unwrap();
        store.bind("thread-1", "bbbbbbbb-0000-4000-8000-000000000002", "/r/2").unwrap();

        // Exactly one row per agent id at all times.
        assert_eq!(store.list_all().len(), 1);
        let row = store.find_by_agent("thread-1").unwrap();
        assert_eq!(
            row.backend_session_id,
            "bbbbbbbb-0000-4000-8000-000000000002"
        );
        assert_eq!(row.rollout_hint, "/r/2");
    }

    #[test]
    fn survives_reload() {
        let dir = TempDir::new().unwrap();
        {
            let store = BindingStore::new(dir.path()).unwrap();
            store
                .bind("thread-9", "cafebabe-0000-4000-8000-000000000009", "")
                .unwrap();
        }
        let store = BindingStore::new(dir.path()).unwrap();
        let row = store.find_by_agent("thread-9").unwrap();
        assert_eq!(
            row.backend_session_id,
            "cafebabe-0000-4000-8000-000000000009"
        );
    }

    #[test]
    fn corrupt_file_degrades_to_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("bindings.json"), "not json").unwrap();
        let store = BindingStore::new(dir.path()).unwrap();
        assert!(store.list_all().is_empty());
    }
}
