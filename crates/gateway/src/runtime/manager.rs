//! Agent manager — the pool of live subprocess handles.
//!
//! One handle per agent id. Launching is serialized per id with a keyed
//! semaphore so concurrent launch requests for the same agent coalesce onto
//! one subprocess; the race loser adopts the winner's handle.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};

use cb_agent_client::{AgentClient, AgentError, AgentEvent, HandleState};
use cb_domain::config::AgentLaunchConfig;

/// Summary info for list endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub state: HandleState,
    pub backend_session_id: Option<String>,
    pub last_activity_at: DateTime<Utc>,
}

/// Result of a launch: the handle, plus the event stream when this call
/// actually spawned the subprocess (the race winner wires it to the
/// pipeline; losers get `None`).
pub struct Launched {
    pub client: Arc<AgentClient>,
    pub events: Option<mpsc::Receiver<AgentEvent>>,
}

pub struct AgentManager {
    handles: RwLock<HashMap<String, Arc<AgentClient>>>,
    /// Per-agent launch locks (Semaphore(1) each).
    launch_locks: Mutex<HashMap<String, Arc<Semaphore>>>,
    launch_config: AgentLaunchConfig,
}

impl AgentManager {
    pub fn new(launch_config: AgentLaunchConfig) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            launch_locks: Mutex::new(HashMap::new()),
            launch_config,
        }
    }

    /// The live handle for an agent, if any.
    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentClient>> {
        self.handles.read().get(agent_id).cloned()
    }

    /// Launch a subprocess for the agent, coalescing concurrent launches.
    pub async fn launch(&self, agent_id: &str, cwd: &str) -> Result<Launched, AgentError> {
        let lock = {
            let mut locks = self.launch_locks.lock();
            locks
                .entry(agent_id.to_owned())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let _permit = lock
            .acquire()
            .await
            .map_err(|_| AgentError::Other("launch lock closed".into()))?;

        // A concurrent launcher may have won while we waited.
        if let Some(existing) = self.get(agent_id) {
            if existing.is_alive() {
                tracing::debug!(agent_id = %agent_id, "adopting existing handle");
                return Ok(Launched {
                    client: existing,
                    events: None,
                });
            }
            // Dead handle left behind; replace it.
            self.handles.write().remove(agent_id);
        }

        let (client, events) = AgentClient::spawn(agent_id, cwd, &self.launch_config).await?;
        self.handles
            .write()
            .insert(agent_id.to_owned(), client.clone());
        Ok(Launched {
            client,
            events: Some(events),
        })
    }

    /// Remove a handle without stopping it. Used on process crash so
    /// subsequent `get` calls miss before anyone is notified.
    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentClient>> {
        self.handles.write().remove(agent_id)
    }

    /// Stop and remove an agent's subprocess.
    pub async fn stop(&self, agent_id: &str) -> bool {
        match self.remove(agent_id) {
            Some(client) => {
                client.stop().await;
                true
            }
            None => false,
        }
    }

    /// Stop every subprocess (server shutdown).
    pub async fn stop_all(&self) {
        let handles: Vec<_> = {
            let mut map = self.handles.write();
            map.drain().map(|(_, v)| v).collect()
        };
        for client in handles {
            client.stop().await;
        }
    }

    /// Live handles, sorted by agent id.
    pub fn list(&self) -> Vec<AgentInfo> {
        let mut infos: Vec<AgentInfo> = self
            .handles
            .read()
            .values()
            .map(|c| AgentInfo {
                agent_id: c.agent_id().to_owned(),
                state: c.state(),
                backend_session_id: c.backend_session_id(),
                last_activity_at: c.last_activity(),
            })
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    pub fn len(&self) -> usize {
        self.handles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_manager(script: &str) -> AgentManager {
        AgentManager::new(AgentLaunchConfig {
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
            launch_timeout_sec: 5,
            resume_timeout_sec: 5,
        })
    }

    const HANDSHAKE: &str =
        r#"read line; printf '{"jsonrpc":"2.0","id":1,"result":{}}\n'; sleep 2"#;

    #[tokio::test]
    async fn launch_get_stop() {
        let manager = sh_manager(HANDSHAKE);
        let launched = manager.launch("a1", ".").await.unwrap();
        assert!(launched.events.is_some());
        assert_eq!(manager.len(), 1);
        assert!(manager.get("a1").is_some());

        assert!(manager.stop("a1").await);
        assert!(manager.is_empty());
        assert!(manager.get("a1").is_none());
        assert!(!manager.stop("a1").await);
    }

    #[tokio::test]
    async fn second_launch_adopts_existing() {
        let manager = sh_manager(HANDSHAKE);
        let first = manager.launch("a1", ".").await.unwrap();
        let second = manager.launch("a1", ".").await.unwrap();

        assert!(first.events.is_some());
        assert!(second.events.is_none());
        assert!(Arc::ptr_eq(&first.client, &second.client));
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_launches_coalesce() {
        let manager = Arc::new(sh_manager(HANDSHAKE));
        let m1 = manager.clone();
        let m2 = manager.clone();

        let (a, b) = tokio::join!(m1.launch("a1", "."), m2.launch("a1", "."));
        let a = a.unwrap();
        let b = b.unwrap();

        // Exactly one spawned the subprocess.
        assert_eq!(
            a.events.is_some() as u8 + b.events.is_some() as u8,
            1,
            "exactly one launcher should win"
        );
        assert!(Arc::ptr_eq(&a.client, &b.client));
    }

    #[tokio::test]
    async fn remove_hides_handle_immediately() {
        let manager = sh_manager(HANDSHAKE);
        manager.launch("a1", ".").await.unwrap();
        let removed = manager.remove("a1");
        assert!(removed.is_some());
        assert!(manager.get("a1").is_none());
    }
}
