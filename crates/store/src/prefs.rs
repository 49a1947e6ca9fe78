//! Preference key/value store.
//!
//! A flat KV table persisted as `prefs.json`; values are arbitrary JSON.
//! Thread aliases live under a single `threads.aliases` row as an
//! `{agentId: alias}` blob; the archived set under `threads.archived`.
//! Stall tuning (`stallThresholdSec`, `stallHeartbeatSec`) is validated
//! against hard floors before being accepted.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde_json::Value;

use cb_domain::config::{MIN_STALL_HEARTBEAT_SEC, MIN_STALL_THRESHOLD_SEC};
use cb_domain::error::{CoreError, Result};

const ALIASES_KEY: &str = "threads.aliases";
const ARCHIVED_KEY: &str = "threads.archived";
pub const STALL_THRESHOLD_KEY: &str = "stallThresholdSec";
pub const STALL_HEARTBEAT_KEY: &str = "stallHeartbeatSec";

/// File-backed preference store.
pub struct PreferenceStore {
    path: PathBuf,
    values: RwLock<HashMap<String, Value>>,
}

impl PreferenceStore {
    /// Load or create the store at `state_path/prefs.json`.
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(CoreError::Io)?;
        let path = state_path.join("prefs.json");
        let values: HashMap<String, Value> = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(CoreError::Io)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(keys = values.len(), path = %path.display(), "preference store loaded");

        Ok(Self {
            path,
            values: RwLock::new(values),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.write().insert(key.to_owned(), value);
        self.persist()
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.values.write().remove(key);
        self.persist()
    }

    // ── Thread aliases ───────────────────────────────────────────────

    /// The full alias map.
    pub fn aliases(&self) -> HashMap<String, String> {
        self.get(ALIASES_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Set or clear a thread alias. An empty alias, or one equal to the id
    /// itself, removes the entry.
    pub fn set_alias(&self, agent_id: &str, alias: &str) -> Result<()> {
        let mut aliases = self.aliases();
        if alias.is_empty() || alias == agent_id {
            aliases.remove(agent_id);
        } else {
            aliases.insert(agent_id.to_owned(), alias.to_owned());
        }
        self.set(ALIASES_KEY, serde_json::to_value(aliases).map_err(CoreError::Json)?)
    }

    pub fn alias_of(&self, agent_id: &str) -> Option<String> {
        self.aliases().remove(agent_id)
    }

    // ── Archive flags ────────────────────────────────────────────────

    pub fn archived(&self) -> HashSet<String> {
        self.get(ARCHIVED_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    pub fn set_archived(&self, agent_id: &str, archived: bool) -> Result<()> {
        let mut set = self.archived();
        if archived {
            set.insert(agent_id.to_owned());
        } else {
            set.remove(agent_id);
        }
        self.set(ARCHIVED_KEY, serde_json::to_value(set).map_err(CoreError::Json)?)
    }

    pub fn is_archived(&self, agent_id: &str) -> bool {
        self.archived().contains(agent_id)
    }

    // ── Stall tuning ─────────────────────────────────────────────────

    /// Set the stall threshold, rejecting values below the floor.
    pub fn set_stall_threshold_sec(&self, value: u64) -> Result<()> {
        if value < MIN_STALL_THRESHOLD_SEC {
            return Err(CoreError::InvalidInput(format!(
                "stallThresholdSec must be at least {MIN_STALL_THRESHOLD_SEC}"
            )));
        }
        self.set(STALL_THRESHOLD_KEY, Value::from(value))
    }

    /// Set the watchdog heartbeat, rejecting values below the floor.
    pub fn set_stall_heartbeat_sec(&self, value: u64) -> Result<()> {
        if value < MIN_STALL_HEARTBEAT_SEC {
            return Err(CoreError::InvalidInput(format!(
                "stallHeartbeatSec must be at least {MIN_STALL_HEARTBEAT_SEC}"
            )));
        }
        self.set(STALL_HEARTBEAT_KEY, Value::from(value))
    }

    pub fn stall_threshold_sec(&self) -> Option<u64> {
        self.get(STALL_THRESHOLD_KEY).and_then(|v| v.as_u64())
    }

    pub fn stall_heartbeat_sec(&self) -> Option<u64> {
        self.get(STALL_HEARTBEAT_KEY).and_then(|v| v.as_u64())
    }

    fn persist(&self) -> Result<()> {
        let snapshot = self.values.read().clone();
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
    use tempfile::TempDir;

    #[test]
    fn kv_round_trip() {
        let dir = TempDir::new().unwrap();
        let prefs = PreferenceStore::new(dir.path()).unwrap();
        prefs.set("a.b", serde_json::json!({"x": 1})).unwrap();
        assert_eq!(prefs.get("a.b").unwrap()["x"], 1);
        prefs.remove("a.b").unwrap();
        assert!(prefs.get("a.b").is_none());
    }

    #[test]
    fn alias_set_and_clear() {
        let dir = TempDir::new().unwrap();
        let prefs = PreferenceStore::new(dir.path()).unwrap();

        prefs.set_alias("thread-1", "my task").unwrap();
        assert_eq!(prefs.alias_of("thread-1").as_deref(), Some("my task"));

        // Empty alias removes the entry.
        prefs.set_alias("thread-1", "").unwrap();
        assert!(prefs.alias_of("thread-1").is_none());

        // Alias equal to the id also removes it.
        prefs.set_alias("thread-1", "again").unwrap();
        prefs.set_alias("thread-1", "thread-1").unwrap();
        assert!(prefs.alias_of("thread-1").is_none());
    }

    #[test]
    fn aliases_persist_across_reload() {
        let dir = TempDir::new().unwrap();
        {
            let prefs = PreferenceStore::new(dir.path()).unwrap();
            prefs.set_alias("thread-2", "research").unwrap();
        }
        let prefs = PreferenceStore::new(dir.path()).unwrap();
        assert_eq!(prefs.alias_of("thread-2").as_deref(), Some("research"));
    }

    #[test]
    fn archive_round_trip() {
        let dir = TempDir::new().unwrap();
        let prefs = PreferenceStore::new(dir.path()).unwrap();

        assert!(!prefs.is_archived("thread-3"));
        prefs.set_archived("thread-3", true).unwrap();
        assert!(prefs.is_archived("thread-3"));
        prefs.set_archived("thread-3", false).unwrap();
        assert!(!prefs.is_archived("thread-3"));
    }

    #[test]
    fn stall_floors_rejected() {
        let dir = TempDir::new().unwrap();
        let prefs = PreferenceStore::new(dir.path()).unwrap();

        assert!(prefs.set_stall_threshold_sec(0).is_err());
        assert!(prefs.set_stall_heartbeat_sec(0).is_err());
        assert!(prefs.stall_threshold_sec().is_none());

        prefs.set_stall_threshold_sec(2).unwrap();
        prefs.set_stall_heartbeat_sec(1).unwrap();
        assert_eq!(prefs.stall_threshold_sec(), Some(2));
        assert_eq!(prefs.stall_heartbeat_sec(), Some(1));
    }
}
