//! In-memory registry of connected UI clients.
//!
//! Each connection owns a bounded outbox drained by a dedicated writer task.
//! Producer policy: once the backlog crosses the cut (capacity minus a small
//! headroom) the connection is overloaded and non-critical notifications are
//! dropped with a log line. Critical messages (direct RPC responses) are
//! never dropped — if the outbox is full the connection is closed instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use cb_domain::error::CoreError;
use cb_protocol::jsonrpc::{RpcNotification, RpcRequestOut};

pub type ConnId = u64;

/// A connected client.
pub struct Connection {
    pub id: ConnId,
    /// Outbox feeding this connection's writer task.
    tx: mpsc::Sender<String>,
    /// Signals the socket tasks to shut down.
    pub cancel: CancellationToken,
    /// Set once the backlog crosses the cut; cleared when it drains.
    overloaded: AtomicBool,
    /// Whether this client accepts server-initiated requests (approvals).
    receives_server_requests: AtomicBool,
}

/// Thread-safe registry of all client connections.
pub struct ConnectionRegistry {
    conns: RwLock<HashMap<ConnId, Arc<Connection>>>,
    next_id: AtomicU64,
    max_connections: usize,
    outbox_size: usize,
    /// Backlog length beyond which a connection counts as overloaded.
    backlog_cut: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize, outbox_size: usize, backlog_headroom: usize) -> Self {
        Self {
            conns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_connections,
            outbox_size,
            backlog_cut: outbox_size.saturating_sub(backlog_headroom),
        }
    }

    /// Register a new connection. Returns its id, the outbox receiver for the
    /// writer task, and the cancellation token for its socket tasks.
    pub fn register(
        &self,
    ) -> Result<(ConnId, mpsc::Receiver<String>, CancellationToken), CoreError> {
        let mut conns = self.conns.write();
        if conns.len() >= self.max_connections {
            return Err(CoreError::ResourceExhausted(format!(
                "connection limit reached ({})",
                self.max_connections
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.outbox_size);
        let cancel = CancellationToken::new();
        conns.insert(
            id,
            Arc::new(Connection {
                id,
                tx,
                cancel: cancel.clone(),
                overloaded: AtomicBool::new(false),
                receives_server_requests: AtomicBool::new(false),
            }),
        );
        tracing::info!(conn_id = id, total = conns.len(), "client connected");
        Ok((id, rx, cancel))
    }

    /// Remove a connection (socket closed or evicted).
    pub fn remove(&self, conn_id: ConnId) {
        if let Some(conn) = self.conns.write().remove(&conn_id) {
            conn.cancel.cancel();
            tracing::info!(conn_id, "client removed");
        }
    }

    pub fn len(&self) -> usize {
        self.conns.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.read().is_empty()
    }

    /// Mark whether a connection accepts server-initiated requests.
    pub fn set_receives_server_requests(&self, conn_id: ConnId, enabled: bool) {
        if let Some(conn) = self.conns.read().get(&conn_id) {
            conn.receives_server_requests
                .store(enabled, Ordering::Relaxed);
        }
    }

    /// Number of connections configured to receive server prompts.
    pub fn server_request_targets(&self) -> usize {
        self.conns
            .read()
            .values()
            .filter(|c| c.receives_server_requests.load(Ordering::Relaxed))
            .count()
    }

    fn backlog_of(&self, conn: &Connection) -> usize {
        self.outbox_size.saturating_sub(conn.tx.capacity())
    }

    /// Enqueue a non-critical frame, applying the overload policy.
    /// Returns false when the frame was dropped.
    fn enqueue_droppable(&self, conn: &Connection, frame: &str) -> bool {
        let backlog = self.backlog_of(conn);
        if backlog > self.backlog_cut {
            if !conn.overloaded.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    conn_id = conn.id,
                    backlog,
                    cut = self.backlog_cut,
                    "connection overloaded, dropping notifications"
                );
            }
            return false;
        }
        conn.overloaded.store(false, Ordering::Relaxed);
        match conn.tx.try_send(frame.to_owned()) {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(conn_id = conn.id, "outbox refused notification");
                false
            }
        }
    }

    /// Send a critical frame (an RPC response for this client's own request).
    /// Never dropped: a full outbox closes the connection instead.
    pub fn send_critical(&self, conn_id: ConnId, frame: String) {
        let conn = match self.conns.read().get(&conn_id) {
            Some(c) => c.clone(),
            None => return,
        };
        if conn.tx.try_send(frame).is_err() {
            tracing::warn!(conn_id, "outbox full on critical send, closing connection");
            self.remove(conn_id);
        }
    }

    /// Broadcast a notification to every connection under the overload
    /// policy.
    pub fn broadcast(&self, notification: &RpcNotification) {
        let frame = match serde_json::to_string(notification) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize notification");
                return;
            }
        };
        let conns: Vec<_> = self.conns.read().values().cloned().collect();
        for conn in conns {
            self.enqueue_droppable(&conn, &frame);
        }
    }

    /// Broadcast a server-initiated request to the connections configured to
    /// receive them. Returns how many connections it reached.
    pub fn broadcast_server_request(&self, request: &RpcRequestOut) -> usize {
        let frame = match serde_json::to_string(request) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize server request");
                return 0;
            }
        };
        let conns: Vec<_> = self
            .conns
            .read()
            .values()
            .filter(|c| c.receives_server_requests.load(Ordering::Relaxed))
            .cloned()
            .collect();
        let mut reached = 0;
        for conn in conns {
            if self.enqueue_droppable(&conn, &frame) {
                reached += 1;
            }
        }
        reached
    }

    /// Graceful shutdown: wait up to `drain` for clients to disconnect, then
    /// force-close the remainder.
    pub async fn shutdown(&self, drain: std::time::Duration) {
        let deadline = tokio::time::Instant::now() + drain;
        while !self.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        let remaining: Vec<ConnId> = self.conns.read().keys().copied().collect();
        if !remaining.is_empty() {
            tracing::warn!(count = remaining.len(), "force-closing connections");
        }
        for id in remaining {
            self.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry(max: usize, outbox: usize, headroom: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(max, outbox, headroom)
    }

    #[test]
    fn register_and_remove() {
        let reg = registry(10, 8, 2);
        let (id, _rx, _cancel) = reg.register().unwrap();
        assert_eq!(reg.len(), 1);
        reg.remove(id);
        assert!(reg.is_empty());
    }

    #[test]
    fn connection_limit_enforced() {
        let reg = registry(2, 8, 2);
        let _a = reg.register().unwrap();
        let _b = reg.register().unwrap();
        match reg.register() {
            Err(CoreError::ResourceExhausted(_)) => {}
            other => panic!("expected ResourceExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_connections() {
        let reg = registry(10, 8, 2);
        let (_id1, mut rx1, _c1) = reg.register().unwrap();
        let (_id2, mut rx2, _c2) = reg.register().unwrap();

        reg.broadcast(&RpcNotification::new("ping", json!({})));

        assert!(rx1.recv().await.unwrap().contains("ping"));
        assert!(rx2.recv().await.unwrap().contains("ping"));
    }

    #[tokio::test]
    async fn overloaded_connection_drops_notifications() {
        // Outbox of 4 with headroom 2 → cut at backlog 2.
        let reg = registry(10, 4, 2);
        let (_id, mut rx, _cancel) = reg.register().unwrap();

        for _ in 0..8 {
            reg.broadcast(&RpcNotification::new("tick", json!({})));
        }

        // Everything past the cut was dropped; nothing blocked.
        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received <= 3, "expected drops, got {received}");
    }

    #[tokio::test]
    async fn critical_full_closes_connection() {
        let reg = registry(10, 2, 1);
        let (id, _rx, cancel) = reg.register().unwrap();

        reg.send_critical(id, "r1".into());
        reg.send_critical(id, "r2".into());
        // Outbox (cap 2) is now full; the third critical send evicts.
        reg.send_critical(id, "r3".into());

        assert!(reg.is_empty());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn server_requests_only_reach_subscribers() {
        let reg = registry(10, 8, 2);
        let (id1, mut rx1, _c1) = reg.register().unwrap();
        let (_id2, mut rx2, _c2) = reg.register().unwrap();

        reg.set_receives_server_requests(id1, true);
        let reached =
            reg.broadcast_server_request(&RpcRequestOut::new(1, "approval/request", json!({})));

        assert_eq!(reached, 1);
        assert!(rx1.recv().await.unwrap().contains("approval/request"));
        assert!(rx2.try_recv().is_err());
        assert_eq!(reg.server_request_targets(), 1);
    }
}
