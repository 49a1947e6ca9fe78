//! Mediated environment variable access.
//!
//! All env mutation goes through this gateway: a key is writable only when
//! its name starts with one of the configured allow-list prefixes. Anything
//! else is rejected before the process environment is touched.

use std::collections::BTreeMap;

use cb_domain::error::{CoreError, Result};

pub struct ConfigGateway {
    prefixes: Vec<String>,
}

impl ConfigGateway {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }

    fn allowed(&self, key: &str) -> bool {
        !key.is_empty() && self.prefixes.iter().any(|p| key.starts_with(p.as_str()))
    }

    /// Write one env var. Keys outside the allow-list error without setting
    /// anything.
    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        if !self.allowed(key) {
            return Err(CoreError::Security(format!(
                "env key {key:?} is not in the allow-list"
            )));
        }
        std::env::set_var(key, value);
        tracing::info!(key = %key, "env var written");
        Ok(())
    }

    /// Write a batch atomically: every key is validated before any is set.
    pub fn batch_write(&self, values: &BTreeMap<String, String>) -> Result<()> {
        for key in values.keys() {
            if !self.allowed(key) {
                return Err(CoreError::Security(format!(
                    "env key {key:?} is not in the allow-list (batch rejected)"
                )));
            }
        }
        for (key, value) in values {
            std::env::set_var(key, value);
        }
        tracing::info!(count = values.len(), "env batch written");
        Ok(())
    }

    pub fn read(&self, key: &str) -> Option<String> {
        if !self.allowed(key) {
            return None;
        }
        std::env::var(key).ok()
    }
}
