//! JSON-RPC 2.0 envelope types.
//!
//! Incoming frames decode into [`RpcEnvelope`]; the `id` field distinguishes
//! requests (present) from notifications (absent). Ids are opaque JSON values
//! so clients may use numbers or strings.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Incoming
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A decoded client→server frame (request or notification).
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEnvelope {
    #[serde(default)]
    pub jsonrpc: String,
    /// Present for requests; absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl RpcEnvelope {
    /// A frame without an id is a notification: the handler runs but the
    /// result is discarded.
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outgoing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A server→client response to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// A server→client notification (no response expected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcNotification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: Some(params),
        }
    }
}

/// A server-initiated request toward the client (e.g. an approval prompt).
/// Ids live in their own monotonic space, disjoint from client request ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequestOut {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequestOut {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params: Some(params),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_distinguishes_request_from_notification() {
        let req: RpcEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#).unwrap();
        assert!(!req.is_notification());
        assert_eq!(req.method.as_deref(), Some("initialize"));

        let notif: RpcEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"ping"}"#).unwrap();
        assert!(notif.is_notification());
    }

    #[test]
    fn string_ids_round_trip() {
        let req: RpcEnvelope =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"abc-1","method":"m"}"#).unwrap();
        let resp = RpcResponse::ok(req.id.unwrap(), serde_json::json!({}));
        let out = serde_json::to_value(&resp).unwrap();
        assert_eq!(out["id"], "abc-1");
    }

    #[test]
    fn error_response_shape() {
        let resp = RpcResponse::err(
            serde_json::json!(7),
            RpcError::new(-32601, "method not found"),
        );
        let out = serde_json::to_value(&resp).unwrap();
        assert_eq!(out["error"]["code"], -32601);
        assert!(out.get("result").is_none());
    }
}
