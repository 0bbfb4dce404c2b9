use serde::{Deserialize, Serialize};

use crate::lock::LockState;

/// Snapshot of the lock engine, shared with readers on other threads.
///
/// Written once per tick and on every state transition; readers always see
/// the last committed values.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct LockStatus {
    pub state: LockState,

    /// [V] fast correction voltage pushed to the acquisition output
    pub daq_voltage: f64,

    /// [V] last reported actuator voltage (bias plus external contribution)
    pub actuator_voltage: f64,

    /// Accumulated `Ki * ∫e dt`
    pub integral: f64,

    /// True while the offset compensation is walking the actuator bias
    pub compensating: bool,

    pub last_error: f64,
    pub last_amplitude: f64,

    /// Floating mean / standard deviation of the error over the statistics window
    pub error_mean: f64,
    pub error_std: f64,

    /// Total ticks that produced a telemetry sample
    pub samples_recorded: u64,

    /// Unix timestamp of last status update
    pub updated_ts: u64,
}

impl Default for LockStatus {
    fn default() -> Self {
        LockStatus {
            state: LockState::Inactive,
            daq_voltage: 0.0,
            actuator_voltage: 0.0,
            integral: 0.0,
            compensating: false,
            last_error: 0.0,
            last_amplitude: 0.0,
            error_mean: 0.0,
            error_std: 0.0,
            samples_recorded: 0,
            updated_ts: 0,
        }
    }
}
