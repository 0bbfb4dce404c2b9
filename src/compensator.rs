//! Slow offset compensation for the fast correction channel.
//!
//! Two thresholds give hysteresis: compensation engages once the fast
//! channel exceeds `max_offset_v` and disengages only after it falls below
//! `target_offset_v`. While engaged, the actuator bias is stepped by one
//! native increment every `timeout_ticks` ticks in the direction that
//! relieves the fast channel.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompensationSettings {
    pub enabled: bool,
    /// [V] fast-channel magnitude that engages compensation
    pub max_offset_v: f64,
    /// [V] fast-channel magnitude below which compensation disengages
    pub target_offset_v: f64,
    /// Ticks between two actuator steps. Counts ticks, not wall-clock time.
    pub timeout_ticks: u32,
}

impl Default for CompensationSettings {
    fn default() -> Self {
        CompensationSettings {
            enabled: true,
            max_offset_v: 0.4,
            target_offset_v: 0.1,
            timeout_ticks: 25,
        }
    }
}

/// Result of one compensator update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompensationUpdate {
    pub compensating: bool,
    /// Whether `compensating` differs from the previous tick.
    pub changed: bool,
    /// Actuator step to apply: -1, 0 or +1.
    pub step: i32,
}

#[derive(Debug, Clone, Default)]
pub struct OffsetCompensator {
    compensating: bool,
    cycles: u32,
}

impl OffsetCompensator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_compensating(&self) -> bool {
        self.compensating
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn update(&mut self, daq_voltage: f64, settings: &CompensationSettings) -> CompensationUpdate {
        let was = self.compensating;

        if !settings.enabled {
            self.compensating = false;
            return CompensationUpdate {
                compensating: false,
                changed: was,
                step: 0,
            };
        }

        self.cycles = self.cycles.saturating_add(1);

        if daq_voltage.abs() > settings.max_offset_v {
            self.compensating = true;
        }
        if daq_voltage.abs() < settings.target_offset_v {
            self.compensating = false;
        }

        let mut step = 0;
        if self.compensating && self.cycles > settings.timeout_ticks {
            self.cycles = 0;
            step = if daq_voltage > 0.0 { 1 } else { -1 };
        }

        CompensationUpdate {
            compensating: self.compensating,
            changed: was != self.compensating,
            step,
        }
    }

    /// Force the inactive state. Returns true if it was compensating.
    pub fn clear(&mut self) -> bool {
        std::mem::replace(&mut self.compensating, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(timeout: u32) -> CompensationSettings {
        CompensationSettings {
            enabled: true,
            max_offset_v: 0.4,
            target_offset_v: 0.1,
            timeout_ticks: timeout,
        }
    }

    #[test]
    fn test_hysteresis_holds_between_thresholds() {
        let s = settings(1000);
        let mut c = OffsetCompensator::new();

        assert!(!c.update(0.3, &s).compensating);

        let u = c.update(0.45, &s);
        assert!(u.compensating && u.changed);

        // Oscillating between target and max keeps it on
        for v in [0.35, 0.15, 0.39, 0.11, -0.2, -0.38] {
            let u = c.update(v, &s);
            assert!(u.compensating, "dropped out at {}", v);
            assert!(!u.changed);
        }

        let u = c.update(0.05, &s);
        assert!(!u.compensating && u.changed);

        // Back between thresholds: stays off
        assert!(!c.update(0.3, &s).compensating);
    }

    #[test]
    fn test_step_direction_and_timeout() {
        let s = settings(3);
        let mut c = OffsetCompensator::new();

        let steps: Vec<i32> = (0..8).map(|_| c.update(0.5, &s).step).collect();
        // counter exceeds 3 on the 4th tick, then every 4 ticks
        assert_eq!(steps, vec![0, 0, 0, 1, 0, 0, 0, 1]);

        let mut c = OffsetCompensator::new();
        let steps: Vec<i32> = (0..4).map(|_| c.update(-0.5, &s).step).collect();
        assert_eq!(steps, vec![0, 0, 0, -1]);
    }

    #[test]
    fn test_counter_runs_while_idle() {
        let s = settings(3);
        let mut c = OffsetCompensator::new();
        for _ in 0..10 {
            assert_eq!(c.update(0.2, &s).step, 0);
        }
        // Counter already past the timeout: first engaged tick steps
        assert_eq!(c.update(0.5, &s).step, 1);
        assert_eq!(c.cycles(), 0);
    }

    #[test]
    fn test_disabled_reports_inactive() {
        let mut s = settings(0);
        let mut c = OffsetCompensator::new();
        assert!(c.update(1.0, &s).compensating);

        s.enabled = false;
        let u = c.update(1.0, &s);
        assert_eq!(
            u,
            CompensationUpdate {
                compensating: false,
                changed: true,
                step: 0
            }
        );
        assert!(!c.update(1.0, &s).changed);
    }

    #[test]
    fn test_clear() {
        let s = settings(100);
        let mut c = OffsetCompensator::new();
        c.update(0.9, &s);
        assert!(c.clear());
        assert!(!c.clear());
        assert!(!c.is_compensating());
    }
}
