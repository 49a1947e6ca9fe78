//! AppState construction and background-task spawning.
//!
//! `build_app_state` wires every subsystem and returns a fully-functional
//! gateway state; the HTTP listener in `main` is just a front door.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use cb_domain::config::{Config, ConfigSeverity};
use cb_store::{AgentStatusStore, BindingStore, MessageStore, PreferenceStore};

use crate::api;
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
use crate::runtime::tracker::{run_stall_watchdog, TurnTracker};
use crate::state::AppState;

/// Validate config, initialize every subsystem, register the RPC methods,
/// and start the stall watchdog.
pub fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Stores ───────────────────────────────────────────────────────
    let state_path = &config.state.path;
    let bindings =
        Arc::new(BindingStore::new(state_path).context("initializing binding store")?);
    let prefs =
        Arc::new(PreferenceStore::new(state_path).context("initializing preference store")?);
    let statuses =
        Arc::new(AgentStatusStore::new(state_path).context("initializing status store")?);
    let messages = Arc::new(MessageStore::new(state_path).context("initializing message store")?);

    // ── Connections & RPC ────────────────────────────────────────────
    let registry = Arc::new(ConnectionRegistry::new(
        config.limits.max_connections,
        config.limits.conn_outbox_size,
        config.limits.conn_backlog_headroom,
    ));
    let server_requests = Arc::new(ServerRequests::new());
    let dispatcher = Arc::new(Dispatcher::new(
        server_requests.clone(),
        config.limits.max_output_bytes,
    ));

    // ── Runtime ──────────────────────────────────────────────────────
    let manager = Arc::new(AgentManager::new(config.agent.clone()));
    let tracker = Arc::new(TurnTracker::new());
    let pipeline = Arc::new(EventPipeline::new(
        registry.clone(),
        tracker.clone(),
        bindings.clone(),
        statuses.clone(),
        manager.clone(),
    ));
    let resolver = Arc::new(SessionResolver::new(
        bindings.clone(),
        statuses.clone(),
        messages.clone(),
    ));
    let ensure_ready = Arc::new(EnsureReady::new(
        manager.clone(),
        resolver.clone(),
        bindings.clone(),
        pipeline.clone(),
        Duration::from_secs(config.turns.ensure_ready_deadline_sec),
    ));
    let hydrator = Arc::new(Hydrator::new(
        messages.clone(),
        pipeline.clone(),
        registry.clone(),
        config.hydration.clone(),
    ));

    // ── Policy ───────────────────────────────────────────────────────
    let config_gateway = Arc::new(ConfigGateway::new(config.env_allowlist.prefixes.clone()));
    let exec_gate = Arc::new(ExecGate::new(
        config.exec.blocklist.clone(),
        config.exec.approval.clone(),
        config.limits.max_output_bytes,
    ));

    let state = AppState::new(
        config.clone(),
        bindings,
        prefs.clone(),
        statuses,
        messages,
        manager.clone(),
        tracker.clone(),
        pipeline,
        resolver,
        ensure_ready,
        hydrator,
        registry.clone(),
        server_requests,
        dispatcher,
        config_gateway,
        exec_gate,
    );

    api::register_all(&state);
    tracing::info!(
        methods = state.dispatcher.method_names().len(),
        "RPC methods registered"
    );

    // ── Stall watchdog ───────────────────────────────────────────────
    tokio::spawn(run_stall_watchdog(
        tracker,
        manager,
        registry,
        prefs,
        config.turns.clone(),
    ));

    Ok(state)
}
