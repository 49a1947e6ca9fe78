//! Ensure-ready: guarantee a live handle attached to the right session.
//!
//! For any turn request this path must produce a subprocess handle that is
//! alive and, when the agent has history, resumed onto the correct backend
//! session. Launch, resume, and every fallback run under one governing
//! deadline so the caller never waits longer than the configured budget.
//!
//! The candidate loop distinguishes two failure classes deliberately:
//! rollout problems ([`AgentError::Candidate`]) allow degraded continuation
//! on a fresh session, while transport death means subprocess state is
//! unknown and the error must surface instead of a pretend-success.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use cb_agent_client::{AgentClient, AgentError};
use cb_domain::error::{CoreError, Result};

use crate::runtime::manager::AgentManager;
use crate::runtime::pipeline::EventPipeline;
use crate::runtime::resolver::SessionResolver;
use cb_store::BindingStore;

pub struct EnsureReady {
    manager: Arc<AgentManager>,
    resolver: Arc<SessionResolver>,
    bindings: Arc<BindingStore>,
    pipeline: Arc<EventPipeline>,
    deadline: Duration,
}

impl EnsureReady {
    pub fn new(
        manager: Arc<AgentManager>,
        resolver: Arc<SessionResolver>,
        bindings: Arc<BindingStore>,
        pipeline: Arc<EventPipeline>,
        deadline: Duration,
    ) -> Self {
        Self {
            manager,
            resolver,
            bindings,
            pipeline,
            deadline,
        }
    }

    /// Produce a ready handle for `agent_id`, spawning and resuming as
    /// needed, within the configured deadline.
    pub async fn ensure_ready(
        &self,
        agent_id: &str,
        cwd: Option<&str>,
    ) -> Result<Arc<AgentClient>> {
        let agent_id = agent_id.trim().to_owned();
        if agent_id.is_empty() {
            return Err(CoreError::InvalidInput("agentId must not be empty".into()));
        }
        let cwd = cwd
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(".")
            .to_owned();

        match tokio::time::timeout(self.deadline, self.ensure_ready_inner(&agent_id, &cwd)).await
        {
            Ok(result) => result,
            Err(_) => Err(CoreError::Timeout(format!(
                "ensure-ready for {agent_id} exceeded {}s",
                self.deadline.as_secs()
            ))),
        }
    }

    async fn ensure_ready_inner(&self, agent_id: &str, cwd: &str) -> Result<Arc<AgentClient>> {
        // Fast path: a live handle already exists.
        if let Some(handle) = self.manager.get(agent_id) {
            if handle.is_alive() {
                // Best-effort resume refresh to re-arm a possibly stale event
                // listener; failures here must not block the caller.
                if let Some(session_id) = handle.backend_session_id().filter(|s| !s.is_empty()) {
                    if let Err(e) = handle.resume(&session_id, cwd).await {
                        tracing::debug!(
                            agent_id = %agent_id,
                            error = %e,
                            "resume refresh failed (ignored)"
                        );
                    }
                }
                return Ok(handle);
            }
        }

        // The agent must be known: a binding, history rows, or a backend-
        // shaped id.
        if !self.resolver.has_history(agent_id) {
            return Err(CoreError::NotFound(format!("thread {agent_id}")));
        }

        let candidates = self.resolver.candidates(agent_id);

        let launched = self
            .manager
            .launch(agent_id, cwd)
            .await
            .map_err(|e| CoreError::Upstream(format!("launch {agent_id}: {e}")))?;
        if let Some(events) = launched.events {
            self.pipeline
                .spawn_consumer(agent_id.to_owned(), launched.client.clone(), events);
        }
        let client = launched.client;

        if candidates.is_empty() {
            // History exists but no resumable id: fresh session, flagged so
            // the next session-configured event persists a fresh binding.
            client.mark_session_lost();
            tracing::info!(agent_id = %agent_id, "no resume candidates, fresh session");
            return Ok(client);
        }

        for candidate in &candidates {
            match client.resume(candidate, cwd).await {
                Ok(()) => {
                    // Store failure degrades; the handle proceeds.
                    if let Err(e) = self.bindings.bind(agent_id, candidate, "") {
                        tracing::warn!(error = %e, "binding write failed after resume");
                    }
                    tracing::info!(
                        agent_id = %agent_id,
                        backend_session_id = %candidate,
                        "resumed historical session"
                    );
                    return Ok(client);
                }
                Err(AgentError::Candidate(kind)) => {
                    tracing::info!(
                        agent_id = %agent_id,
                        candidate = %candidate,
                        error = %kind,
                        "resume candidate failed, trying next"
                    );
                }
                Err(AgentError::ProcessCrash(msg)) => {
                    // Transport death: no silent fallback.
                    self.manager.remove(agent_id);
                    client.stop().await;
                    self.pipeline.notify_state_changed_now(
                        "session_lost_warning",
                        Some(agent_id),
                        json!({ "warning": format!("agent crashed while resuming: {msg}") }),
                    );
                    return Err(CoreError::Upstream(format!(
                        "resume {candidate} crashed: {msg}"
                    )));
                }
                Err(other) => {
                    self.manager.remove(agent_id);
                    client.stop().await;
                    return Err(CoreError::Upstream(format!("resume {candidate}: {other}")));
                }
            }
        }

        // Every candidate was a rollout problem: continue on a fresh session
        // with a visible warning. The next session-configured event persists
        // the fresh binding.
        client.mark_session_lost();
        self.pipeline.notify_state_changed_now(
            "session_lost_warning",
            Some(agent_id),
            json!({ "warning": "all resume candidates failed; continuing with a fresh session" }),
        );
        tracing::warn!(
            agent_id = %agent_id,
            candidates = candidates.len(),
            "session lost, continuing fresh"
        );
        Ok(client)
    }
}
