use log::debug;
use serde::{Deserialize, Serialize};

/// Empirical gain scale applied to every PID term.
pub const DEFAULT_GAIN_SCALE: f64 = 1e-3;
/// Empirical divisor converting the scaled PID sum into volts on the fast channel.
pub const DEFAULT_CORRECTION_DIVISOR: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidGains {
    pub proportional: f64,
    pub integral: f64,
    pub derivative: f64,
}

impl Default for PidGains {
    fn default() -> Self {
        PidGains {
            proportional: 2.0,
            integral: 1.0,
            derivative: 0.0,
        }
    }
}

/// PID integrator driving the fast correction channel.
///
/// Gains live in the lock settings and are passed per sample, so changing a
/// gain never touches the accumulated integral.
pub struct PidServo {
    integral: f64,
    gain_scale: f64,
    correction_divisor: f64,
}

impl PidServo {
    pub fn new(gain_scale: f64, correction_divisor: f64) -> Self {
        PidServo {
            integral: 0.0,
            gain_scale,
            correction_divisor,
        }
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
    }

    /// Accumulated `Ki * ∫e dt`.
    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn set_scaling(&mut self, gain_scale: f64, correction_divisor: f64) {
        self.gain_scale = gain_scale;
        self.correction_divisor = correction_divisor;
    }

    /// Compute the increment to add to the fast correction voltage.
    ///
    /// `previous` is the (error, seconds elapsed) of the last recorded sample,
    /// if any. The integral uses the trapezoidal rule over the measured
    /// interval since the tick period jitters.
    pub fn sample(&mut self, gains: PidGains, error: f64, previous: Option<(f64, f64)>) -> f64 {
        let step = self.propose(gains, error, previous);
        self.commit(step);
        step.increment
    }

    /// Same computation as [`sample`](Self::sample) without touching the
    /// integral. Apply the result with [`commit`](Self::commit).
    pub fn propose(&self, gains: PidGains, error: f64, previous: Option<(f64, f64)>) -> PidStep {
        let mut integral = self.integral;
        let mut derivative = 0.0;

        if let Some((prev_error, dt)) = previous {
            if dt > 0.0 {
                integral += gains.integral * (prev_error + error) * dt / 2.0;
                derivative = (error - prev_error) / dt;
            }
        }

        let proportional = gains.proportional * error;
        let raw = proportional + integral + gains.derivative * derivative;
        let increment = raw * self.gain_scale / self.correction_divisor;

        debug!(
            "Servo: Err={:.4}, P={:.4}, I={:.4}, D={:.4}, Inc={:.3e}V",
            error, proportional, integral, derivative, increment
        );

        PidStep { increment, integral }
    }

    pub fn commit(&mut self, step: PidStep) {
        self.integral = step.integral;
    }
}

/// Pending servo update produced by [`PidServo::propose`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidStep {
    pub increment: f64,
    integral: f64,
}

impl Default for PidServo {
    fn default() -> Self {
        PidServo::new(DEFAULT_GAIN_SCALE, DEFAULT_CORRECTION_DIVISOR)
    }
}
