//! Configuration and preference RPC handlers.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{json, Value};

use cb_domain::error::{CoreError, Result};
use cb_store::prefs::{STALL_HEARTBEAT_KEY, STALL_THRESHOLD_KEY};

use crate::state::AppState;

fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| CoreError::InvalidInput(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct ValueWriteParams {
    key: String,
    value: String,
}

/// `config/value/write` — set one env var through the allow-list.
pub async fn config_value_write(state: AppState, params: Value) -> Result<Value> {
    let params: ValueWriteParams = parse(params)?;
    state.config_gateway.write(&params.key, &params.value)?;
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct BatchWriteParams {
    values: BTreeMap<String, String>,
}

/// `config/batchWrite` — all-or-nothing env batch.
pub async fn config_batch_write(state: AppState, params: Value) -> Result<Value> {
    let params: BatchWriteParams = parse(params)?;
    state.config_gateway.batch_write(&params.values)?;
    Ok(json!({ "written": params.values.len() }))
}

#[derive(Debug, Deserialize)]
struct PreferenceWriteParams {
    key: String,
    value: Value,
}

/// `preference/write` — persist a preference. The stall tuning keys are
/// validated against their floors and take effect on the watchdog's next
/// tick.
pub async fn preference_write(state: AppState, params: Value) -> Result<Value> {
    let params: PreferenceWriteParams = parse(params)?;

    match params.key.as_str() {
        STALL_THRESHOLD_KEY => {
            let value = params.value.as_u64().ok_or_else(|| {
                CoreError::InvalidInput(format!("{STALL_THRESHOLD_KEY} must be a positive integer"))
            })?;
            state.prefs.set_stall_threshold_sec(value)?;
        }
        STALL_HEARTBEAT_KEY => {
            let value = params.value.as_u64().ok_or_else(|| {
                CoreError::InvalidInput(format!("{STALL_HEARTBEAT_KEY} must be a positive integer"))
            })?;
            state.prefs.set_stall_heartbeat_sec(value)?;
        }
        _ => state.prefs.set(&params.key, params.value)?,
    }
    Ok(json!({}))
}

#[derive(Debug, Deserialize)]
struct PreferenceReadParams {
    key: String,
}

/// `preference/read` — fetch one preference value.
pub async fn preference_read(state: AppState, params: Value) -> Result<Value> {
    let params: PreferenceReadParams = parse(params)?;
    Ok(json!({ "value": state.prefs.get(&params.key) }))
}
