//! Run/stop control channel payloads

use crate::error::BusError;
use spotter_core::RunState;
use tracing::{info, warn};

/// Integer payload: `1` means run, any other integer means stop.
pub fn parse_control_payload(payload: &[u8]) -> Result<bool, BusError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| BusError::MalformedControlMessage(format!("payload is not UTF-8: {}", e)))?;
    let value: i64 = text.trim().parse().map_err(|e| {
        BusError::MalformedControlMessage(format!("'{}' is not an integer: {}", text.trim(), e))
    })?;
    Ok(value == 1)
}

/// Apply a control payload to the run state.
///
/// A malformed payload is logged and leaves the state unchanged.
pub fn apply_control_message(state: &RunState, payload: &[u8]) -> Result<bool, BusError> {
    match parse_control_payload(payload) {
        Ok(running) => {
            state.set_running(running);
            info!("Run state set to {}", if running { "running" } else { "stopped" });
            Ok(running)
        }
        Err(e) => {
            warn!("{}", e);
            Err(e)
        }
    }
}
