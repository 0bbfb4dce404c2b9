use thiserror::Error;

use crate::devices::ActuatorOwner;

/// Errors surfaced by the lock and scan engines.
///
/// Saturation of the fast correction channel is a state transition
/// (`LockState::Failure`), not an error value.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EngineError {
    /// The actuator is already driven by another engine.
    #[error("actuator is busy (owned by {owner})")]
    ActuatorBusy { owner: ActuatorOwner },

    /// A sample block violated the acquisition contract.
    #[error("invalid sample block: {0}")]
    InvalidBlock(String),

    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    /// A collaborator call failed. The tick that hit it is skipped.
    #[error("device error: {0}")]
    Device(String),

    #[error("shared device handle was poisoned")]
    Poisoned,
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Device(format!("{:#}", e))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
