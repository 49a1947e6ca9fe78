//! JSON-RPC method dispatcher.
//!
//! Decodes envelopes off the WebSocket, routes requests and notifications to
//! registered handlers, routes response frames to the server-request table,
//! and encodes results or errors. Handler panics are recovered and returned
//! as `-32603`.
//!
//! A stub registry lets legacy clients query features that are not wired up
//! yet: stubbed methods return a structurally valid placeholder instead of
//! `method not found`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::FutureExt;
use parking_lot::RwLock;
use serde_json::Value;

use cb_domain::error::{
    self, CoreError, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
use cb_protocol::jsonrpc::{RpcEnvelope, RpcError, RpcResponse};

use crate::connections::registry::ConnId;
use crate::rpc::server_requests::ServerRequests;

/// Per-request context passed to handlers.
#[derive(Debug, Clone, Copy)]
pub struct RequestCtx {
    pub conn_id: ConnId,
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, CoreError>> + Send>>;
pub type Handler = Arc<dyn Fn(RequestCtx, Value) -> HandlerFuture + Send + Sync>;

pub struct Dispatcher {
    handlers: RwLock<HashMap<String, Handler>>,
    stubs: RwLock<HashMap<String, Value>>,
    server_requests: Arc<ServerRequests>,
    max_output_bytes: usize,
}

impl Dispatcher {
    pub fn new(server_requests: Arc<ServerRequests>, max_output_bytes: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            stubs: RwLock::new(HashMap::new()),
            server_requests,
            max_output_bytes,
        }
    }

    /// Register a method handler. Later registrations win.
    pub fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(RequestCtx, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, CoreError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        self.handlers.write().insert(method.to_owned(), handler);
    }

    /// Register a stub: the method always answers with the placeholder.
    pub fn register_stub(&self, method: &str, placeholder: Value) {
        self.stubs.write().insert(method.to_owned(), placeholder);
    }

    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().keys().cloned().collect();
        names.extend(self.stubs.read().keys().cloned());
        names.sort();
        names
    }

    /// Process one inbound frame. Returns the serialized response for
    /// requests; `None` for notifications and routed response frames.
    pub async fn dispatch_text(&self, ctx: RequestCtx, raw: &str) -> Option<String> {
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return encode(RpcResponse::err(
                    Value::Null,
                    RpcError::new(PARSE_ERROR, format!("parse error: {e}")),
                ));
            }
        };

        // A frame with a result/error and no method is a client response to
        // a server-initiated request.
        if value.get("method").is_none()
            && (value.get("result").is_some() || value.get("error").is_some())
        {
            if let Some(id) = value.get("id").and_then(Value::as_u64) {
                let answer = match value.get("result") {
                    Some(result) => result.clone(),
                    // An error response is a denial.
                    None => Value::Bool(false),
                };
                self.server_requests.complete(id, answer);
            } else {
                tracing::warn!("response frame without usable id");
            }
            return None;
        }

        let envelope: RpcEnvelope = match serde_json::from_value(value) {
            Ok(env) => env,
            Err(e) => {
                return encode(RpcResponse::err(
                    Value::Null,
                    RpcError::new(INVALID_REQUEST, format!("invalid request: {e}")),
                ));
            }
        };

        let id = envelope.id.clone();
        let respond = |error: RpcError| match &id {
            Some(id) => encode(RpcResponse::err(id.clone(), error)),
            // Notifications get no response; just log.
            None => {
                tracing::debug!(code = error.code, message = %error.message, "notification error");
                None
            }
        };

        if envelope.jsonrpc != "2.0" {
            return respond(RpcError::new(
                INVALID_REQUEST,
                "jsonrpc must be \"2.0\"".to_string(),
            ));
        }
        let Some(method) = envelope.method.clone().filter(|m| !m.is_empty()) else {
            return respond(RpcError::new(INVALID_REQUEST, "missing method".to_string()));
        };

        let params = envelope.params.unwrap_or(Value::Null);
        let handler = self.handlers.read().get(&method).cloned();

        let outcome: Result<Value, RpcError> = match handler {
            Some(handler) => {
                // Recover handler panics instead of dropping the connection.
                let fut = std::panic::AssertUnwindSafe(handler(ctx, params));
                match fut.catch_unwind().await {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(core_err)) => {
                        Err(RpcError::new(core_err.rpc_code(), core_err.to_string()))
                    }
                    Err(_) => {
                        tracing::error!(method = %method, "handler panicked");
                        Err(RpcError::new(INTERNAL_ERROR, "internal error".to_string()))
                    }
                }
            }
            None => match self.stubs.read().get(&method) {
                Some(placeholder) => Ok(placeholder.clone()),
                None => Err(RpcError::new(
                    METHOD_NOT_FOUND,
                    format!("method not found: {method}"),
                )),
            },
        };

        let id = id?; // Notification: discard the result.

        let response = match outcome {
            Ok(result) => RpcResponse::ok(id.clone(), result),
            Err(error) => RpcResponse::err(id.clone(), error),
        };

        let frame = serde_json::to_string(&response).ok()?;
        if frame.len() > self.max_output_bytes {
            tracing::warn!(
                bytes = frame.len(),
                cap = self.max_output_bytes,
                "response exceeds output cap"
            );
            return encode(RpcResponse::err(
                id,
                RpcError::new(
                    error::RESOURCE_EXHAUSTED,
                    format!("response exceeds {} bytes", self.max_output_bytes),
                ),
            ));
        }
        Some(frame)
    }
}

fn encode(response: RpcResponse) -> Option<String> {
    serde_json::to_string(&response).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(ServerRequests::new()), 1024 * 1024)
    }

    const CTX: RequestCtx = RequestCtx { conn_id: 1 };

    #[tokio::test]
    async fn routes_to_handler() {
        let d = dispatcher();
        d.register("echo", |_ctx, params| async move { Ok(params) });

        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":1,"method":"echo","params":{"x":7}}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["result"]["x"], 7);
        assert_eq!(parsed["id"], 1);
    }

    #[tokio::test]
    async fn malformed_json_is_parse_error() {
        let d = dispatcher();
        let out = d.dispatch_text(CTX, "{nope").await.unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn unknown_method_is_32601() {
        let d = dispatcher();
        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":3,"method":"nope"}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn wrong_version_is_invalid_request() {
        let d = dispatcher();
        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"1.0","id":4,"method":"echo"}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn invalid_params_map_to_32602() {
        let d = dispatcher();
        d.register("strict", |_ctx, _params| async move {
            Err(CoreError::InvalidInput("threadId required".into()))
        });
        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":5,"method":"strict"}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn panic_recovered_as_internal() {
        let d = dispatcher();
        d.register("boom", |_ctx, _params| async move {
            if true {
                panic!("handler bug");
            }
            Ok(Value::Null)
        });
        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":6,"method":"boom"}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"]["code"], -32603);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let d = dispatcher();
        d.register("fire", |_ctx, _params| async move { Ok(json!({})) });
        assert!(d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","method":"fire"}"#)
            .await
            .is_none());
        // Even for unknown methods.
        assert!(d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","method":"unknown"}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn stubs_answer_for_unwired_methods() {
        let d = dispatcher();
        d.register_stub("skills/list", json!({"skills": []}));
        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":7,"method":"skills/list"}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["result"]["skills"], json!([]));
    }

    #[tokio::test]
    async fn oversized_result_is_resource_exhausted() {
        let d = Dispatcher::new(Arc::new(ServerRequests::new()), 64);
        d.register("big", |_ctx, _params| async move {
            Ok(json!({"blob": "x".repeat(1000)}))
        });
        let out = d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":8,"method":"big"}"#)
            .await
            .unwrap();
        let parsed: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(parsed["error"]["code"], cb_domain::error::RESOURCE_EXHAUSTED);
    }

    #[tokio::test]
    async fn response_frames_route_to_server_requests() {
        let requests = Arc::new(ServerRequests::new());
        let d = Dispatcher::new(requests.clone(), 1024);
        // No pending entry: routing still consumes the frame silently.
        assert!(d
            .dispatch_text(CTX, r#"{"jsonrpc":"2.0","id":42,"result":{"approved":true}}"#)
            .await
            .is_none());
    }
}
