//! Shared domain types for CrewBridge: the core error taxonomy and the
//! gateway configuration model.

pub mod config;
pub mod error;

pub use config::{Config, ConfigError, ConfigSeverity};
pub use error::{CoreError, Result};
