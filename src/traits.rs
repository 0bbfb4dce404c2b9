use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::{EngineError, EngineResult};

/// Channel index of the cavity transmission detector.
pub const DETECTOR_CHANNEL: usize = 0;
/// Channel index of the modulation reference.
pub const REFERENCE_CHANNEL: usize = 1;

/// One synchronized block of samples, one vector per acquisition channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBlock {
    pub channels: Vec<Vec<f64>>,
}

impl SampleBlock {
    pub fn new(detector: Vec<f64>, reference: Vec<f64>) -> Self {
        SampleBlock {
            channels: vec![detector, reference],
        }
    }

    pub fn detector(&self) -> EngineResult<&[f64]> {
        self.channel(DETECTOR_CHANNEL)
    }

    pub fn reference(&self) -> EngineResult<&[f64]> {
        self.channel(REFERENCE_CHANNEL)
    }

    fn channel(&self, index: usize) -> EngineResult<&[f64]> {
        self.channels
            .get(index)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                EngineError::InvalidBlock(format!(
                    "block has {} channels, channel {} requested",
                    self.channels.len(),
                    index
                ))
            })
    }
}

/// Acquisition settings as reported by the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParameters {
    pub timebase_index: u32,
    pub sample_count: usize,
    /// Input range per channel, in volts.
    pub channel_ranges: Vec<f64>,
}

/// Input path driving the actuator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoltageSource {
    /// Feedback input from the acquisition device's output.
    External,
    /// Front-panel potentiometer / software setpoint only.
    Manual,
}

impl fmt::Display for VoltageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoltageSource::External => write!(f, "external"),
            VoltageSource::Manual => write!(f, "manual"),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait AcquisitionDevice {
    /// Collect one synchronized block. Returns Ok(None) if no block became
    /// ready within `timeout`.
    fn collect_block(&mut self, timeout: Duration) -> Result<Option<SampleBlock>>;

    /// Set the DC output that feeds the actuator's external input.
    fn set_output_voltage(&mut self, volts: f64) -> Result<()>;

    /// Push the current acquisition parameters to the hardware.
    fn apply_acquisition_parameters(&mut self) -> Result<()>;

    fn acquisition_parameters(&self) -> AcquisitionParameters;

    /// Current sampling rate in Hz.
    fn sampling_rate(&self) -> f64;
}

#[cfg_attr(test, mockall::automock)]
pub trait Actuator {
    fn set_voltage(&mut self, volts: f64) -> Result<()>;

    /// Reported output voltage. May include the external-input contribution,
    /// so it need not equal the last value passed to `set_voltage`.
    fn voltage(&self) -> Result<f64>;

    fn set_voltage_source(&mut self, source: VoltageSource) -> Result<()>;

    /// Apply one native increment step; `direction` is +1 or -1.
    fn increment_voltage(&mut self, direction: i32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_channel_access() {
        let block = SampleBlock::new(vec![1.0, 2.0], vec![3.0, 4.0]);
        assert_eq!(block.detector().unwrap(), &[1.0, 2.0]);
        assert_eq!(block.reference().unwrap(), &[3.0, 4.0]);
    }

    #[test]
    fn test_block_missing_reference() {
        let block = SampleBlock {
            channels: vec![vec![1.0]],
        };
        assert!(matches!(block.reference(), Err(EngineError::InvalidBlock(_))));
    }
}
