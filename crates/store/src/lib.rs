//! Persistence for CrewBridge: the agent↔session binding table, the
//! preference key/value store, agent status rows, and the per-thread
//! message history.
//!
//! Everything is file-backed (JSON maps and JSONL logs) under the configured
//! state path and guarded by in-process locks; callers treat each store as
//! externally synchronized. Write failures degrade: they are logged and
//! surfaced, but never corrupt the in-memory view.

pub mod bindings;
pub mod history;
pub mod prefs;

pub use bindings::{AgentBinding, BindingStore};
pub use history::{AgentStatusRow, AgentStatusStore, MessageStore, ThreadMessage};
pub use prefs::PreferenceStore;
