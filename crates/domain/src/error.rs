//! Core error taxonomy shared across all CrewBridge crates.
//!
//! Every RPC handler funnels failures through [`CoreError`]; the dispatcher
//! maps each variant onto a JSON-RPC error code via [`CoreError::rpc_code`].

/// JSON-RPC 2.0 standard error codes.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Domain error codes (application range, > -32000).
pub const NOT_FOUND: i64 = -31000;
pub const RESOURCE_EXHAUSTED: i64 = -31001;
pub const TIMEOUT: i64 = -31002;
pub const SESSION_LOST: i64 = -31003;
pub const UPSTREAM: i64 = -31004;
pub const SECURITY: i64 = -31005;

/// Shared error type used across all CrewBridge crates.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Malformed or missing parameters. Returned as `-32602`.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Unknown thread/agent. Stable message so clients can match on it.
    #[error("not found: {0}")]
    NotFound(String),

    /// Too many connections, outbox overflow, or oversized output.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A bounded wait elapsed (ensure-ready deadline, interrupt settle, ...).
    #[error("timeout: {0}")]
    Timeout(String),

    /// All resume candidates failed; the fresh session continues degraded.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// Subprocess transport failure; the owning handle must be torn down.
    #[error("upstream: {0}")]
    Upstream(String),

    /// Command blocklist hit or shell metacharacter in argv.
    #[error("security: {0}")]
    Security(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Recovered panic or other unexpected failure. Returned as `-32603`.
    #[error("internal: {0}")]
    Internal(String),
}

impl CoreError {
    /// Map this error onto the JSON-RPC error code the dispatcher returns.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::InvalidInput(_) => INVALID_PARAMS,
            Self::NotFound(_) => NOT_FOUND,
            Self::ResourceExhausted(_) => RESOURCE_EXHAUSTED,
            Self::Timeout(_) => TIMEOUT,
            Self::SessionLost(_) => SESSION_LOST,
            Self::Upstream(_) => UPSTREAM,
            Self::Security(_) => SECURITY,
            Self::Io(_) | Self::Json(_) | Self::Internal(_) => INTERNAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes_map_to_taxonomy() {
        assert_eq!(
            CoreError::InvalidInput("x".into()).rpc_code(),
            INVALID_PARAMS
        );
        assert_eq!(CoreError::NotFound("x".into()).rpc_code(), NOT_FOUND);
        assert_eq!(CoreError::Timeout("x".into()).rpc_code(), TIMEOUT);
        assert_eq!(CoreError::SessionLost("x".into()).rpc_code(), SESSION_LOST);
        assert_eq!(CoreError::Internal("x".into()).rpc_code(), INTERNAL_ERROR);
    }

    #[test]
    fn display_is_stable() {
        // The NotFound message is part of the wire contract.
        let e = CoreError::NotFound("thread thread-42".into());
        assert_eq!(e.to_string(), "not found: thread thread-42");
    }
}
