//! The thread/turn lifecycle runtime: subprocess pool, resume resolution,
//! ensure-ready, turn tracking, event fan-out, and history hydration.

pub mod ensure_ready;
pub mod hydration;
pub mod manager;
pub mod pipeline;
pub mod resolver;
pub mod tracker;
