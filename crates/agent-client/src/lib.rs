//! `cb-agent-client` — JSON-RPC client for a backend agent subprocess.
//!
//! This crate provides:
//! - [`protocol`]: JSON-RPC message types for the subprocess boundary and the
//!   typed [`protocol::AgentEvent`] stream parsed from its notifications.
//! - [`transport`]: a stdio transport that spawns the subprocess, demuxes
//!   responses by request id, and forwards notifications as events.
//! - [`client`]: the [`client::AgentClient`] handle — resume, submit, slash
//!   verbs, backend-session tracking, and the error taxonomy the gateway's
//!   ensure-ready path depends on (candidate vs crash vs no-active-turn).

pub mod client;
pub mod protocol;
pub mod transport;

pub use client::{AgentClient, AgentError, HandleState};
pub use protocol::{AgentEvent, SlashVerb, TurnStatus};
pub use transport::{StdioTransport, TransportError};
