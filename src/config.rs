use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::lock::LockSettings;
use crate::scan::ScanSettings;
use crate::servo::{DEFAULT_CORRECTION_DIVISOR, DEFAULT_GAIN_SCALE};

/// Fast-channel magnitude that forces the lock into FAILURE.
pub const FAILURE_VOLTAGE_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub lock: LockSettings,
    pub scan: ScanSettings,
    pub servo: ServoConfig,
    pub telemetry: TelemetryConfig,
    /// [ms] period of the scan engine's tick
    pub scan_tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub gain_scale: f64,
    pub correction_divisor: f64,
    pub failure_threshold_v: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub retention_secs: u64,
    /// Samples used for the floating error mean / std
    pub stats_window: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            lock: LockSettings::default(),
            scan: ScanSettings::default(),
            servo: ServoConfig::default(),
            telemetry: TelemetryConfig::default(),
            scan_tick_ms: 1000,
        }
    }
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            gain_scale: DEFAULT_GAIN_SCALE,
            correction_divisor: DEFAULT_CORRECTION_DIVISOR,
            failure_threshold_v: FAILURE_VOLTAGE_THRESHOLD,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            retention_secs: 300,
            stats_window: 50,
        }
    }
}

impl TelemetryConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    pub fn scan_tick(&self) -> Duration {
        Duration::from_millis(self.scan_tick_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_setup() {
        let config = SystemConfig::default();
        assert_eq!(config.lock.gains.proportional, 2.0);
        assert_eq!(config.lock.gains.integral, 1.0);
        assert_eq!(config.lock.phase_deg, 180.0);
        assert_eq!(config.lock.frequency_hz, 5000.0);
        assert_eq!(config.lock.compensation.timeout_ticks, 25);
        assert_eq!(config.lock.tick_interval_ms, 20);
        assert_eq!(config.scan.step_count, 1000);
        assert_eq!(config.servo.failure_threshold_v, 2.0);
        assert_eq!(config.scan_tick(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: SystemConfig =
            serde_json::from_str(r#"{ "lock": { "phase_deg": 90.0 }, "scan_tick_ms": 250 }"#).unwrap();
        assert_eq!(config.lock.phase_deg, 90.0);
        assert_eq!(config.lock.gains.proportional, 2.0);
        assert_eq!(config.scan_tick_ms, 250);
        assert_eq!(config.telemetry.stats_window, 50);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cavitylock.json");

        let mut config = SystemConfig::default();
        config.lock.gains.derivative = 0.5;
        config.scan.high_v = 12.5;
        config.save(&path).unwrap();

        let loaded = SystemConfig::load(&path).unwrap();
        assert_eq!(loaded.lock.gains.derivative, 0.5);
        assert_eq!(loaded.scan.high_v, 12.5);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SystemConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
