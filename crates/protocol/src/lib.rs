//! UI wire protocol: JSON-RPC 2.0 envelope types, the `UserInput` union, and
//! server→client notification constructors.
//!
//! Clients speak JSON-RPC 2.0 over a WebSocket. Every frame is one envelope:
//! a request (has an `id`), a notification (no `id`), or — in the
//! server→client direction — a response or a server-initiated request.

pub mod input;
pub mod jsonrpc;
pub mod notify;

pub use input::{TurnPayload, UserInput};
pub use jsonrpc::{RpcEnvelope, RpcError, RpcNotification, RpcRequestOut, RpcResponse};
