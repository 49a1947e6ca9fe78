//! `command/exec` — gated local command execution.
//!
//! The gate runs before any spawn: blocklisted basenames and shell
//! metacharacters anywhere in argv are rejected as security errors.
//! Commands on the approval list pause for a human decision via a
//! server-initiated request; no decision means no spawn. Output is capped
//! at the configured byte limit.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use cb_domain::error::{CoreError, Result};

use crate::state::AppState;

/// Characters that would smuggle shell syntax through argv.
const SHELL_METACHARACTERS: &[char] = &['|', ';', '&', '$', '`'];

/// Precompiled exec policy.
pub struct ExecGate {
    blocklist: Vec<String>,
    approval: Vec<String>,
    max_output_bytes: usize,
}

fn basename(arg: &str) -> &str {
    Path::new(arg)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(arg)
}

impl ExecGate {
    pub fn new(blocklist: Vec<String>, approval: Vec<String>, max_output_bytes: usize) -> Self {
        Self {
            blocklist,
            approval,
            max_output_bytes,
        }
    }

    /// Validate argv. Errors here mean nothing was spawned.
    pub fn validate(&self, argv: &[String]) -> Result<()> {
        let Some(first) = argv.first().filter(|a| !a.is_empty()) else {
            return Err(CoreError::InvalidInput("argv must not be empty".into()));
        };

        let base = basename(first);
        if self.blocklist.iter().any(|blocked| blocked == base) {
            tracing::warn!(command = %base, "blocked command rejected");
            return Err(CoreError::Security(format!("command {base:?} is blocked")));
        }

        for arg in argv {
            if arg.contains(SHELL_METACHARACTERS) {
                tracing::warn!(arg = %arg, "shell metacharacter rejected");
                return Err(CoreError::Security(format!(
                    "argument {arg:?} contains shell metacharacters"
                )));
            }
        }
        Ok(())
    }

    /// Whether this command needs a human decision before spawning.
    pub fn requires_approval(&self, argv: &[String]) -> bool {
        argv.first()
            .map(|first| {
                let base = basename(first);
                self.approval.iter().any(|needs| needs == base)
            })
            .unwrap_or(false)
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }
}

#[derive(Debug, Deserialize)]
struct ExecParams {
    argv: Vec<String>,
    #[serde(default)]
    cwd: Option<String>,
}

/// Handler body for `command/exec`.
pub async fn command_exec(state: AppState, params: Value) -> Result<Value> {
    let params: ExecParams = serde_json::from_value(params)
        .map_err(|e| CoreError::InvalidInput(format!("command/exec params: {e}")))?;
    let gate = &state.exec_gate;
    gate.validate(&params.argv)?;

    if gate.requires_approval(&params.argv) {
        let answer = state
            .server_requests
            .send_request(
                &state.registry,
                "command/approval",
                json!({ "argv": params.argv, "cwd": params.cwd }),
                Duration::from_secs(state.config.exec.approval_timeout_sec),
            )
            .await
            // A timed-out decision is a denial.
            .unwrap_or(Value::Bool(false));
        let approved = answer.as_bool().unwrap_or_else(|| {
            answer.get("approved").and_then(Value::as_bool).unwrap_or(false)
        });
        if !approved {
            tracing::warn!(command = %params.argv[0], "exec approval denied");
            return Err(CoreError::Security(format!(
                "command {:?} was not approved",
                params.argv[0]
            )));
        }
    }

    let mut cmd = tokio::process::Command::new(&params.argv[0]);
    cmd.args(&params.argv[1..]);
    if let Some(cwd) = params.cwd.as_deref().filter(|c| !c.is_empty()) {
        cmd.current_dir(cwd);
    }

    let output = cmd
        .output()
        .await
        .map_err(|e| CoreError::Upstream(format!("spawn {}: {e}", params.argv[0])))?;

    if output.stdout.len() + output.stderr.len() > gate.max_output_bytes() {
        return Err(CoreError::ResourceExhausted(format!(
            "command output exceeds {} bytes",
            gate.max_output_bytes()
        )));
    }

    Ok(json!({
        "exitCode": output.status.code(),
        "stdout": String::from_utf8_lossy(&output.stdout),
        "stderr": String::from_utf8_lossy(&output.stderr),
    }))
}
