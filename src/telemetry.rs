//! Fixed-capacity circular store of lock telemetry.
//!
//! Capacity is derived from a retention duration and the tick interval. The
//! next-write index wraps modulo capacity; the newest sample sits at
//! `(next - 1) mod capacity` and readers walk backwards from there.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One tick's worth of lock telemetry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// [s] since the lock engine was created
    pub time_s: f64,
    pub error: f64,
    /// [V] fast correction voltage
    pub daq_voltage: f64,
    /// [V] reported actuator voltage
    pub actuator_voltage: f64,
    /// Peak-to-peak detector amplitude
    pub amplitude: f64,
}

#[derive(Debug, Clone)]
pub struct RingTelemetry {
    samples: Vec<TelemetrySample>,
    next: usize,
    len: usize,
}

impl RingTelemetry {
    /// Allocate `capacity` slots (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RingTelemetry {
            samples: vec![TelemetrySample::default(); capacity],
            next: 0,
            len: 0,
        }
    }

    /// Size the buffer to hold `retention` worth of ticks.
    pub fn with_retention(retention: Duration, tick_interval: Duration) -> Self {
        Self::new(Self::capacity_for(retention, tick_interval))
    }

    pub fn capacity_for(retention: Duration, tick_interval: Duration) -> usize {
        let tick_ms = tick_interval.as_millis().max(1);
        (retention.as_millis() / tick_ms) as usize
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Number of valid samples, never more than the capacity.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn push(&mut self, sample: TelemetrySample) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % self.samples.len();
        self.len = (self.len + 1).min(self.samples.len());
    }

    pub fn latest(&self) -> Option<TelemetrySample> {
        if self.is_empty() {
            return None;
        }
        Some(self.samples[self.index_back(0)])
    }

    /// Up to `k` most recent samples, oldest first.
    pub fn last_n(&self, k: usize) -> Vec<TelemetrySample> {
        let k = k.min(self.len);
        let mut out: Vec<TelemetrySample> = (0..k).map(|i| self.samples[self.index_back(i)]).collect();
        out.reverse();
        out
    }

    /// Every stored sample, oldest first.
    pub fn to_vec(&self) -> Vec<TelemetrySample> {
        self.last_n(self.len)
    }

    /// Mean of the error over the last `k` samples.
    pub fn error_mean(&self, k: usize) -> Option<f64> {
        let k = k.min(self.len);
        if k == 0 {
            return None;
        }
        let sum: f64 = (0..k).map(|i| self.samples[self.index_back(i)].error).sum();
        Some(sum / k as f64)
    }

    /// Population standard deviation of the error over the last `k` samples.
    pub fn error_std(&self, k: usize) -> Option<f64> {
        let mean = self.error_mean(k)?;
        let k = k.min(self.len);
        let var: f64 = (0..k)
            .map(|i| {
                let d = self.samples[self.index_back(i)].error - mean;
                d * d
            })
            .sum::<f64>()
            / k as f64;
        Some(var.sqrt())
    }

    /// Reallocate with a new capacity. History is discarded.
    pub fn resize(&mut self, capacity: usize) {
        *self = Self::new(capacity);
    }

    fn index_back(&self, i: usize) -> usize {
        let cap = self.samples.len();
        (self.next + cap - 1 - i % cap) % cap
    }
}
