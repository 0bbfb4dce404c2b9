//! Phase-sensitive (lock-in) demodulation of one sample block.
//!
//! The detector block is normalized to [0, 1] by its own peak-to-peak
//! amplitude, the reference is rotated by the sample count corresponding to
//! the configured phase, and the error is the mean of the elementwise
//! product. The amplitude is reported separately so a vanishing transmission
//! signal stays visible even though normalization hides it from the error.

use std::sync::{Arc, RwLock};

use crate::error::{EngineError, EngineResult};

/// Phase and frequency used to demodulate against the reference channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reference {
    pub phase_deg: f64,
    pub frequency_hz: f64,
}

/// Reference written by the lock engine and read by the scan engine.
pub type SharedReference = Arc<RwLock<Reference>>;

/// Output of one demodulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Demodulation {
    pub error: f64,
    /// Peak-to-peak amplitude of the raw detector block.
    pub amplitude: f64,
    /// Sum of absolute normalized detector samples.
    pub intensity: f64,
}

/// Normalize `samples` to [0, 1] in place and return the peak-to-peak amplitude.
///
/// A flat block (amplitude 0) is left untouched.
pub fn normalize(samples: &mut [f64]) -> f64 {
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    let amplitude = max - min;

    if amplitude != 0.0 && amplitude.is_finite() {
        for x in samples.iter_mut() {
            *x = (*x - min) / amplitude;
        }
    }
    amplitude
}

/// Number of samples the reference must be shifted for `phase_deg`.
pub fn phase_step(phase_deg: f64, sampling_rate_hz: f64, frequency_hz: f64) -> i64 {
    (phase_deg * sampling_rate_hz / (360.0 * frequency_hz)).round() as i64
}

/// Rotate left for positive steps, right for negative ones.
pub fn rotate_reference(reference: &mut [f64], step: i64) {
    let len = reference.len();
    if len == 0 || step == 0 {
        return;
    }
    let shift = (step.unsigned_abs() % len as u64) as usize;
    if step > 0 {
        reference.rotate_left(shift);
    } else {
        reference.rotate_right(shift);
    }
}

/// Demodulate one block against a phase-shifted reference.
pub fn compute_error_and_amplitude(
    detector: &[f64],
    reference: &[f64],
    phase_deg: f64,
    frequency_hz: f64,
    sampling_rate_hz: f64,
) -> EngineResult<Demodulation> {
    if detector.is_empty() {
        return Err(EngineError::InvalidBlock("empty detector block".into()));
    }
    if detector.len() != reference.len() {
        return Err(EngineError::InvalidBlock(format!(
            "detector has {} samples, reference has {}",
            detector.len(),
            reference.len()
        )));
    }
    if !(frequency_hz > 0.0) || !sampling_rate_hz.is_finite() {
        return Err(EngineError::InvalidSetting(format!(
            "cannot demodulate at {} Hz with sampling rate {} Hz",
            frequency_hz, sampling_rate_hz
        )));
    }

    let mut normalized = detector.to_vec();
    let amplitude = normalize(&mut normalized);

    let mut shifted = reference.to_vec();
    rotate_reference(&mut shifted, phase_step(phase_deg, sampling_rate_hz, frequency_hz));

    let error = normalized
        .iter()
        .zip(&shifted)
        .map(|(d, r)| d * r)
        .sum::<f64>()
        / normalized.len() as f64;
    let intensity = normalized.iter().map(|x| x.abs()).sum();

    Ok(Demodulation {
        error,
        amplitude,
        intensity,
    })
}
