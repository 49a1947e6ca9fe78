//! Shared application state: the thin composition root.
//!
//! Every component owns its own data and locks; `AppState` just holds the
//! `Arc`s and hands narrow capabilities to the RPC handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cb_domain::config::Config;
use cb_store::{AgentStatusStore, BindingStore, MessageStore, PreferenceStore};

use crate::api::exec::ExecGate;
use crate::config_gateway::ConfigGateway;
use crate::connections::registry::ConnectionRegistry;
use crate::rpc::dispatch::Dispatcher;
use crate::rpc::server_requests::ServerRequests;
use crate::runtime::ensure_ready::EnsureReady;
use crate::runtime::hydration::Hydrator;
use crate::runtime::manager::AgentManager;
use crate::runtime::pipeline::EventPipeline;
use crate::runtime::resolver::SessionResolver;
use crate::runtime::tracker::TurnTracker;

/// Shared application state passed to the WebSocket layer and handlers.
///
/// Fields are grouped by concern:
/// - **Stores** — bindings, preferences, statuses, messages
/// - **Runtime** — manager, tracker, pipeline, ensure-ready, resolver, hydrator
/// - **Connections & RPC** — registry, server requests, dispatcher
/// - **Policy** — config gateway, exec gate
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,

    // ── Stores ────────────────────────────────────────────────────────
    pub bindings: Arc<BindingStore>,
    pub prefs: Arc<PreferenceStore>,
    pub statuses: Arc<AgentStatusStore>,
    pub messages: Arc<MessageStore>,

    // ── Runtime ───────────────────────────────────────────────────────
    pub manager: Arc<AgentManager>,
    pub tracker: Arc<TurnTracker>,
    pub pipeline: Arc<EventPipeline>,
    pub resolver: Arc<SessionResolver>,
    pub ensure_ready: Arc<EnsureReady>,
    pub hydrator: Arc<Hydrator>,

    // ── Connections & RPC ─────────────────────────────────────────────
    pub registry: Arc<ConnectionRegistry>,
    pub server_requests: Arc<ServerRequests>,
    pub dispatcher: Arc<Dispatcher>,

    // ── Policy ────────────────────────────────────────────────────────
    pub config_gateway: Arc<ConfigGateway>,
    pub exec_gate: Arc<ExecGate>,

    /// Sequence for gateway-minted thread ids.
    thread_seq: Arc<AtomicU64>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        bindings: Arc<BindingStore>,
        prefs: Arc<PreferenceStore>,
        statuses: Arc<AgentStatusStore>,
        messages: Arc<MessageStore>,
        manager: Arc<AgentManager>,
        tracker: Arc<TurnTracker>,
        pipeline: Arc<EventPipeline>,
        resolver: Arc<SessionResolver>,
        ensure_ready: Arc<EnsureReady>,
        hydrator: Arc<Hydrator>,
        registry: Arc<ConnectionRegistry>,
        server_requests: Arc<ServerRequests>,
        dispatcher: Arc<Dispatcher>,
        config_gateway: Arc<ConfigGateway>,
        exec_gate: Arc<ExecGate>,
    ) -> Self {
        Self {
            config,
            bindings,
            prefs,
            statuses,
            messages,
            manager,
            tracker,
            pipeline,
            resolver,
            ensure_ready,
            hydrator,
            registry,
            server_requests,
            dispatcher,
            config_gateway,
            exec_gate,
            thread_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Mint a new gateway thread id: `thread-<epoch-ms>-<n>`.
    pub fn mint_thread_id(&self) -> String {
        let ms = chrono::Utc::now().timestamp_millis();
        let n = self.thread_seq.fetch_add(1, Ordering::Relaxed);
        format!("thread-{ms}-{n}")
    }
}
