//! Server→client request/response correlation.
//!
//! The core can ask connected UIs a question (approvals, elicitations). Each
//! outbound request gets a monotonic id and a one-shot response channel; the
//! first client answer wins. With no eligible connection the request fails
//! closed — a denial, never an implicit approval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use cb_domain::error::{CoreError, Result};
use cb_protocol::jsonrpc::RpcRequestOut;

use crate::connections::registry::ConnectionRegistry;

pub struct ServerRequests {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<Value>>>,
}

impl Default for ServerRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRequests {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Ask the connected UIs a question and wait for the first answer.
    ///
    /// Fails closed: no eligible connection → `Ok(false)` immediately; a
    /// timeout surfaces as [`CoreError::Timeout`], which callers treat as a
    /// denial.
    pub async fn send_request(
        &self,
        registry: &Arc<ConnectionRegistry>,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        if registry.server_request_targets() == 0 {
            tracing::warn!(method, "no connection accepts server requests, failing closed");
            return Ok(json!(false));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let reached = registry.broadcast_server_request(&RpcRequestOut::new(id, method, params));
        if reached == 0 {
            // Every eligible outbox was overloaded.
            self.pending.lock().remove(&id);
            tracing::warn!(method, "server request reached no connection, failing closed");
            return Ok(json!(false));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Sender dropped without a response; treat like a timeout.
            Ok(Err(_)) => {
                self.pending.lock().remove(&id);
                Err(CoreError::Timeout(format!(
                    "server request {method} got no response"
                )))
            }
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(CoreError::Timeout(format!(
                    "server request {method} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Route a client's response frame to the waiting caller.
    /// Returns false for unknown (expired or duplicate) ids.
    pub fn complete(&self, request_id: u64, value: Value) -> bool {
        match self.pending.lock().remove(&request_id) {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                tracing::warn!(request_id, "response for unknown server request");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
