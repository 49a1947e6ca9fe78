//! Gateway configuration model.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or no
//! file at all) boots a working dev-mode gateway.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub agent: AgentLaunchConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub turns: TurnsConfig,
    #[serde(default)]
    pub hydration: HydrationConfig,
    #[serde(default)]
    pub env_allowlist: EnvAllowlistConfig,
    #[serde(default)]
    pub exec: ExecConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Env var holding the pre-shared WebSocket client token.
    /// Unset or empty env → open access (dev mode).
    #[serde(default = "d_token_env")]
    pub token_env: String,
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            token_env: d_token_env(),
            allowed_origins: d_cors_origins(),
        }
    }
}

fn d_port() -> u16 {
    4520
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_token_env() -> String {
    "CB_CLIENT_TOKEN".into()
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:4520".into(),
        "http://127.0.0.1:4520".into(),
    ]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// State paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Root directory for persisted state (bindings, prefs, messages).
    #[serde(default = "d_state_path")]
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: d_state_path(),
        }
    }
}

fn d_state_path() -> PathBuf {
    PathBuf::from("./data/state")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent subprocess launch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentLaunchConfig {
    /// Executable for the backend agent subprocess.
    #[serde(default = "d_agent_command")]
    pub command: String,
    /// Fixed arguments prepended on every launch.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the subprocess.
    #[serde(default)]
    pub env: Vec<(String, String)>,
    /// Seconds to allow for launch + handshake.
    #[serde(default = "d_30")]
    pub launch_timeout_sec: u64,
    /// Seconds to allow for one resume attempt.
    #[serde(default = "d_30")]
    pub resume_timeout_sec: u64,
}

impl Default for AgentLaunchConfig {
    fn default() -> Self {
        Self {
            command: d_agent_command(),
            args: Vec::new(),
            env: Vec::new(),
            launch_timeout_sec: 30,
            resume_timeout_sec: 30,
        }
    }
}

fn d_agent_command() -> String {
    "codex-agent".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Connection limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum concurrent client connections.
    #[serde(default = "d_100")]
    pub max_connections: usize,
    /// Per-connection outbox capacity in messages.
    #[serde(default = "d_256")]
    pub conn_outbox_size: usize,
    /// Headroom below capacity at which a connection is marked overloaded.
    #[serde(default = "d_16")]
    pub conn_backlog_headroom: usize,
    /// Maximum serialized response size in bytes (1 MiB).
    #[serde(default = "d_1mib")]
    pub max_output_bytes: usize,
    /// Graceful-shutdown drain budget in seconds.
    #[serde(default = "d_5")]
    pub shutdown_drain_sec: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            conn_outbox_size: 256,
            conn_backlog_headroom: 16,
            max_output_bytes: 1024 * 1024,
            shutdown_drain_sec: 5,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn lifecycle timing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Hard floors for the hot-reconfigurable stall settings; values below these
/// are rejected at the preference layer.
pub const MIN_STALL_THRESHOLD_SEC: u64 = 1;
pub const MIN_STALL_HEARTBEAT_SEC: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnsConfig {
    /// A turn with no events for this long is failed with reason `stall`.
    #[serde(default = "d_stall_threshold")]
    pub stall_threshold_sec: u64,
    /// Watchdog tick interval.
    #[serde(default = "d_stall_heartbeat")]
    pub stall_heartbeat_sec: u64,
    /// Total ensure-ready budget covering launch + resume.
    #[serde(default = "d_45")]
    pub ensure_ready_deadline_sec: u64,
    /// How long `turn/interrupt` waits for a terminal before reporting timeout.
    #[serde(default = "d_6")]
    pub interrupt_settle_sec: u64,
}

impl Default for TurnsConfig {
    fn default() -> Self {
        Self {
            stall_threshold_sec: d_stall_threshold(),
            stall_heartbeat_sec: d_stall_heartbeat(),
            ensure_ready_deadline_sec: 45,
            interrupt_settle_sec: 6,
        }
    }
}

fn d_stall_threshold() -> u64 {
    30
}
fn d_stall_heartbeat() -> u64 {
    10
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// History hydration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HydrationConfig {
    /// Default first-page size for `thread/messages`.
    #[serde(default = "d_100")]
    pub first_page_default: usize,
    /// Hard cap on any requested page size.
    #[serde(default = "d_500")]
    pub first_page_max: usize,
    /// Background hydration page size.
    #[serde(default = "d_500")]
    pub page_size: usize,
    /// Background hydration total record cap.
    #[serde(default = "d_20000")]
    pub max_records: usize,
}

impl Default for HydrationConfig {
    fn default() -> Self {
        Self {
            first_page_default: 100,
            first_page_max: 500,
            page_size: 500,
            max_records: 20_000,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Env var allow-list
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvAllowlistConfig {
    /// Prefixes a key must match to be writable via `config/value/write`.
    #[serde(default = "d_env_prefixes")]
    pub prefixes: Vec<String>,
}

impl Default for EnvAllowlistConfig {
    fn default() -> Self {
        Self {
            prefixes: d_env_prefixes(),
        }
    }
}

fn d_env_prefixes() -> Vec<String> {
    [
        "OPENAI_", "MODEL", "LOG_LEVEL", "AGENT_", "MCP_", "APP_", "TEST_", "CB_TEST_",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Exec gate
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Command basenames rejected before spawn.
    #[serde(default = "d_blocklist")]
    pub blocklist: Vec<String>,
    /// Command basenames that require human approval before spawn.
    #[serde(default)]
    pub approval: Vec<String>,
    /// Seconds to wait for an approval decision.
    #[serde(default = "d_30")]
    pub approval_timeout_sec: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            blocklist: d_blocklist(),
            approval: Vec::new(),
            approval_timeout_sec: 30,
        }
    }
}

fn d_blocklist() -> Vec<String> {
    ["rm", "mkfs", "dd", "shutdown", "reboot", "sudo"]
        .into_iter()
        .map(String::from)
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_5() -> u64 {
    5
}
fn d_6() -> u64 {
    6
}
fn d_16() -> usize {
    16
}
fn d_30() -> u64 {
    30
}
fn d_45() -> u64 {
    45
}
fn d_100() -> usize {
    100
}
fn d_256() -> usize {
    256
}
fn d_500() -> usize {
    500
}
fn d_20000() -> usize {
    20_000
}
fn d_1mib() -> usize {
    1024 * 1024
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Parse a TOML config string.
    pub fn from_toml(raw: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }

        if self.server.host.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        if self.agent.command.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "agent.command".into(),
                message: "agent command must not be empty".into(),
            });
        }

        if self.limits.max_connections == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.max_connections".into(),
                message: "max_connections must be greater than 0".into(),
            });
        }

        if self.limits.conn_backlog_headroom >= self.limits.conn_outbox_size {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "limits.conn_backlog_headroom".into(),
                message: format!(
                    "headroom ({}) must be smaller than the outbox size ({})",
                    self.limits.conn_backlog_headroom, self.limits.conn_outbox_size
                ),
            });
        }

        if self.turns.stall_threshold_sec < MIN_STALL_THRESHOLD_SEC {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "turns.stall_threshold_sec".into(),
                message: format!("must be at least {MIN_STALL_THRESHOLD_SEC}"),
            });
        }

        if self.turns.stall_heartbeat_sec < MIN_STALL_HEARTBEAT_SEC {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "turns.stall_heartbeat_sec".into(),
                message: format!("must be at least {MIN_STALL_HEARTBEAT_SEC}"),
            });
        }

        if self.turns.stall_heartbeat_sec > self.turns.stall_threshold_sec {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "turns.stall_heartbeat_sec".into(),
                message: "heartbeat longer than the stall threshold delays detection".into(),
            });
        }

        if self.hydration.first_page_max < self.hydration.first_page_default {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "hydration.first_page_max".into(),
                message: "page cap must not be below the default page size".into(),
            });
        }

        if self.server.allowed_origins.iter().any(|o| o == "*") {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "server.allowed_origins".into(),
                message: "wildcard \"*\" allows all origins (not recommended for production)"
                    .into(),
            });
        }

        errors
    }
}
