//! Command-line interface for the gateway binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use cb_domain::config::Config;

#[derive(Debug, Parser)]
#[command(name = "crewbridge", about = "Multi-agent coordination gateway")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway server (default).
    Serve,
    /// Inspect or validate configuration.
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Debug, Parser)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective configuration.
    Show,
}

/// Load the config file (default `./crewbridge.toml`); a missing file means
/// all-defaults dev mode.
pub fn load_config(path: Option<&PathBuf>) -> anyhow::Result<(Arc<Config>, String)> {
    let path = path
        .cloned()
        .unwrap_or_else(|| PathBuf::from("./crewbridge.toml"));
    let path_display = path.display().to_string();

    if !path.exists() {
        tracing::info!(path = %path_display, "no config file, using defaults");
        return Ok((Arc::new(Config::default()), path_display));
    }

    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("reading config {path_display}"))?;
    let config =
        Config::from_toml(&raw).with_context(|| format!("parsing config {path_display}"))?;
    Ok((Arc::new(config), path_display))
}
