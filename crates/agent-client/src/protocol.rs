//! JSON-RPC 2.0 types for the agent subprocess boundary.
//!
//! Each message is a single line of JSON (newline-delimited). Requests carry
//! a numeric id; subprocess-originated notifications become [`AgentEvent`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request toward the subprocess (has an `id` — expects a response).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl AgentRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A response from the subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<AgentRpcError>,
}

/// A JSON-RPC error object from the subprocess.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl std::fmt::Display for AgentRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent error {}: {}", self.code, self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Slash verbs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Built-in commands the subprocess understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlashVerb {
    Interrupt,
    Compact,
    Undo,
    Rename,
    Review,
    Model,
    Approvals,
    Personality,
    McpList,
    SkillsList,
}

impl SlashVerb {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Interrupt => "interrupt",
            Self::Compact => "compact",
            Self::Undo => "undo",
            Self::Rename => "rename",
            Self::Review => "review",
            Self::Model => "model",
            Self::Approvals => "approvals",
            Self::Personality => "personality",
            Self::McpList => "mcp-list",
            Self::SkillsList => "skills-list",
        }
    }

    /// Whether a dead subprocess should be launched just to run this verb.
    ///
    /// Compact and undo operate on session history and need the session
    /// loaded; interrupt against nothing is a no-op and the list/query verbs
    /// are meaningless without a live process.
    pub fn auto_launches(self) -> bool {
        matches!(self, Self::Compact | Self::Undo)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal status of a turn as reported by the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Completed,
    Interrupted,
    Failed,
}

/// A typed view of a subprocess notification.
///
/// Only the events the pipeline acts on get their own variants; everything
/// else passes through as [`AgentEvent::Other`] and is forwarded to clients
/// verbatim under its original method name.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    /// The subprocess (re)configured its session; carries the backend
    /// session id and optionally the rollout path.
    SessionConfigured {
        session_id: String,
        rollout_path: Option<String>,
    },

    /// A turn began; carries the backend turn id.
    TurnStarted { turn_id: String },

    /// Incremental assistant text.
    AssistantDelta { turn_id: Option<String>, text: String },

    /// A tool call started, progressed, or finished.
    ToolCall {
        call_id: String,
        tool_name: String,
        payload: Value,
    },

    /// An attachment produced during the turn (file, image, artifact).
    Attachment { record_id: String, payload: Value },

    /// Terminal event for a turn.
    TurnCompleted {
        turn_id: Option<String>,
        status: TurnStatus,
        reason: Option<String>,
    },

    /// Any event the pipeline does not interpret.
    Other { method: String, params: Value },
}

impl AgentEvent {
    /// Parse a subprocess notification into a typed event.
    pub fn parse(method: &str, params: Value) -> Self {
        let str_field = |v: &Value, key: &str| -> Option<String> {
            v.get(key).and_then(Value::as_str).map(str::to_owned)
        };

        match method {
            "session/configured" => {
                let Some(session_id) = str_field(&params, "sessionId") else {
                    return Self::Other {
                        method: method.into(),
                        params,
                    };
                };
                Self::SessionConfigured {
                    session_id,
                    rollout_path: str_field(&params, "rolloutPath"),
                }
            }
            "turn/started" => {
                let Some(turn_id) = str_field(&params, "turnId") else {
                    return Self::Other {
                        method: method.into(),
                        params,
                    };
                };
                Self::TurnStarted { turn_id }
            }
            "assistant/delta" => Self::AssistantDelta {
                turn_id: str_field(&params, "turnId"),
                text: str_field(&params, "text").unwrap_or_default(),
            },
            "tool/call" => Self::ToolCall {
                call_id: str_field(&params, "callId").unwrap_or_default(),
                tool_name: str_field(&params, "tool").unwrap_or_default(),
                payload: params,
            },
            "attachment" => Self::Attachment {
                record_id: str_field(&params, "recordId").unwrap_or_default(),
                payload: params,
            },
            "turn/complete" | "turn/success" | "turn/completed" => Self::TurnCompleted {
                turn_id: str_field(&params, "turnId"),
                status: TurnStatus::Completed,
                reason: str_field(&params, "reason"),
            },
            "turn/interrupted" => Self::TurnCompleted {
                turn_id: str_field(&params, "turnId"),
                status: TurnStatus::Interrupted,
                reason: str_field(&params, "reason"),
            },
            "turn/failed" | "turn/error" => Self::TurnCompleted {
                turn_id: str_field(&params, "turnId"),
                status: TurnStatus::Failed,
                reason: str_field(&params, "reason"),
            },
            _ => Self::Other {
                method: method.into(),
                params,
            },
        }
    }

    /// The terminal status, when this event ends a turn.
    pub fn terminal_status(&self) -> Option<TurnStatus> {
        match self {
            Self::TurnCompleted { status, .. } => Some(*status),
            _ => None,
        }
    }
}
