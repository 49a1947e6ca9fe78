use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cb_domain::config::Config;
use cb_gateway::bootstrap::build_app_state;
use cb_gateway::cli::{Cli, Command, ConfigAction};
use cb_gateway::connections::ws::client_ws;
use cb_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, config_path) = cb_gateway::cli::load_config(cli.config.as_ref())?;
            tracing::info!(config = %config_path, "crewbridge starting");
            run_server(config).await
        }
        Some(Command::Config(cmd)) => {
            let (config, config_path) = cb_gateway::cli::load_config(cli.config.as_ref())?;
            match cmd.action {
                ConfigAction::Validate => {
                    let issues = config.validate();
                    for issue in &issues {
                        eprintln!("{issue}");
                    }
                    if issues.iter().any(|i| {
                        i.severity == cb_domain::config::ConfigSeverity::Error
                    }) {
                        std::process::exit(1);
                    }
                    println!("{config_path}: ok");
                }
                ConfigAction::Show => {
                    println!("{}", toml::to_string_pretty(config.as_ref())?);
                }
            }
            Ok(())
        }
        Some(Command::Version) => {
            println!("crewbridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the serve path.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cb_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    let state = build_app_state(config.clone())?;

    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    let cors = CorsLayer::new().allow_origin(AllowOrigin::list(origins));

    let app = axum::Router::new()
        .route("/v1/ws", get(client_ws))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// Wait for ctrl-c, then drain connections within the configured budget and
/// stop every subprocess.
async fn shutdown_signal(state: AppState) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown requested, draining");
    state
        .registry
        .shutdown(std::time::Duration::from_secs(
            state.config.limits.shutdown_drain_sec,
        ))
        .await;
    state.manager.stop_all().await;
    tracing::info!("shutdown complete");
}
