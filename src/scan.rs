//! Open-loop voltage sweep used to characterize the cavity before locking.
//!
//! The actuator is stepped through a linear ramp from `low_v` to `high_v`.
//! At each step one block is demodulated and the step's intensity and error
//! are stored. Steps are rate-limited by `interval_s` independently of the
//! tick period.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::config::SystemConfig;
use crate::demod::{self, Reference, SharedReference};
use crate::devices::{lock_devices, ActuatorOwner, SharedDevices};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::scheduler::Tick;
use crate::traits::{AcquisitionDevice, Actuator};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    /// [V] first actuator voltage
    pub low_v: f64,
    /// [V] last actuator voltage
    pub high_v: f64,
    pub step_count: usize,
    /// [s] minimum time between two recorded steps
    pub interval_s: f64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        ScanSettings {
            low_v: 0.0,
            high_v: 7.0,
            step_count: 1000,
            interval_s: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScanParameter {
    Low(f64),
    High(f64),
    StepCount(usize),
    IntervalSecs(f64),
}

impl FromStr for ScanParameter {
    type Err = EngineError;

    /// Parse `key=value`, e.g. `high=10` or `steps=200`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| EngineError::InvalidSetting(format!("expected key=value, got '{}'", s)))?;
        let value = value.trim();
        let bad = || EngineError::InvalidSetting(format!("bad value for '{}': '{}'", key, value));
        let param = match key.trim() {
            "low" => ScanParameter::Low(value.parse().map_err(|_| bad())?),
            "high" => ScanParameter::High(value.parse().map_err(|_| bad())?),
            "steps" => ScanParameter::StepCount(value.parse().map_err(|_| bad())?),
            "interval" => ScanParameter::IntervalSecs(value.parse().map_err(|_| bad())?),
            other => return Err(EngineError::InvalidSetting(format!("unknown scan parameter '{}'", other))),
        };
        Ok(param)
    }
}

/// Per-scan record, reallocated on every start.
#[derive(Debug, Clone, Default)]
pub struct ScanState {
    pub running: bool,
    pub abort_requested: bool,
    /// Steps recorded so far
    pub pass: usize,
    pub voltages: Vec<f64>,
    /// Sum of absolute normalized detector samples per step, NaN until recorded
    pub intensity: Vec<f64>,
    /// Demodulated error per step, NaN until recorded
    pub error: Vec<f64>,
}

pub struct ScanEngine<D, P>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    devices: SharedDevices<D, P>,
    settings: ScanSettings,
    state: ScanState,
    last_step: Instant,
    interval: Duration,
    // Actuator write for the current pass failed, retry before acquiring
    step_pending: bool,

    reference: SharedReference,
    tick_period: Duration,

    events: EventBus,
}

impl<D, P> ScanEngine<D, P>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    pub fn new(devices: SharedDevices<D, P>, config: &SystemConfig, events: EventBus) -> Self {
        ScanEngine {
            devices,
            settings: config.scan,
            state: ScanState::default(),
            last_step: Instant::now(),
            interval: Duration::ZERO,
            step_pending: false,
            reference: Arc::new(RwLock::new(Reference {
                phase_deg: config.lock.phase_deg,
                frequency_hz: config.lock.frequency_hz,
            })),
            tick_period: config.scan_tick(),
            events,
        }
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
    }

    /// Copy of the current scan record.
    pub fn snapshot(&self) -> ScanState {
        self.state.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// Demodulate with the reference published by the lock engine
    /// (`LockEngine::reference_shared`), so phase and frequency changes on
    /// the lock apply to the next scan step.
    pub fn follow_reference(&mut self, reference: SharedReference) {
        self.reference = reference;
    }

    pub fn reference(&self) -> EngineResult<Reference> {
        self.reference.read().map(|r| *r).map_err(|_| EngineError::Poisoned)
    }

    pub fn set_tick_period(&mut self, period: Duration) {
        self.tick_period = period.max(Duration::from_millis(1));
    }

    pub fn apply(&mut self, param: ScanParameter) -> EngineResult<()> {
        match param {
            ScanParameter::Low(v) => self.set_low(v),
            ScanParameter::High(v) => self.set_high(v),
            ScanParameter::StepCount(n) => self.set_step_count(n),
            ScanParameter::IntervalSecs(s) => self.set_interval(s),
        }
    }

    pub fn set_low(&mut self, volts: f64) -> EngineResult<()> {
        if !volts.is_finite() {
            return Err(EngineError::InvalidSetting(format!("scan low {}", volts)));
        }
        self.settings.low_v = volts;
        Ok(())
    }

    pub fn set_high(&mut self, volts: f64) -> EngineResult<()> {
        if !volts.is_finite() {
            return Err(EngineError::InvalidSetting(format!("scan high {}", volts)));
        }
        self.settings.high_v = volts;
        Ok(())
    }

    pub fn set_step_count(&mut self, steps: usize) -> EngineResult<()> {
        if steps == 0 {
            return Err(EngineError::InvalidSetting("scan needs at least one step".into()));
        }
        self.settings.step_count = steps;
        Ok(())
    }

    pub fn set_interval(&mut self, seconds: f64) -> EngineResult<()> {
        step_interval(seconds)?;
        self.settings.interval_s = seconds;
        Ok(())
    }

    /// Start a sweep, or stop the running one. Returns whether a scan is running afterwards.
    pub fn start(&mut self) -> EngineResult<bool> {
        self.start_at(Instant::now())
    }

    pub fn start_at(&mut self, now: Instant) -> EngineResult<bool> {
        let devices = self.devices.clone();
        let mut devices = lock_devices(&devices)?;

        if self.state.running {
            info!("Scan stopped at pass {}/{}", self.state.pass, self.state.voltages.len());
            devices.release(ActuatorOwner::Scan);
            self.set_running(false);
            return Ok(false);
        }

        if self.settings.step_count == 0 {
            return Err(EngineError::InvalidSetting("scan needs at least one step".into()));
        }
        // Settings may come straight from a config file
        let interval = step_interval(self.settings.interval_s)?;

        devices.claim(ActuatorOwner::Scan)?;

        let voltages = linspace(self.settings.low_v, self.settings.high_v, self.settings.step_count);
        let setup = devices
            .daq_mut()
            .apply_acquisition_parameters()
            .and_then(|_| devices.piezo_mut().set_voltage(voltages[0]));
        if let Err(e) = setup {
            devices.release(ActuatorOwner::Scan);
            return Err(e.into());
        }

        info!(
            "Scan started: {}V -> {}V in {} steps, {}s per step",
            self.settings.low_v, self.settings.high_v, self.settings.step_count, self.settings.interval_s
        );

        let steps = voltages.len();
        self.state = ScanState {
            running: false,
            abort_requested: false,
            pass: 0,
            voltages,
            intensity: vec![f64::NAN; steps],
            error: vec![f64::NAN; steps],
        };
        self.last_step = now;
        self.interval = interval;
        self.step_pending = false;
        self.set_running(true);
        Ok(true)
    }

    /// Request the running scan to stop at the next tick.
    pub fn abort(&mut self) {
        if self.state.running {
            self.state.abort_requested = true;
        }
    }

    pub fn tick(&mut self) -> EngineResult<()> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> EngineResult<()> {
        if !self.state.running {
            return Ok(());
        }

        let devices = self.devices.clone();
        let mut devices = lock_devices(&devices)?;

        if self.state.abort_requested {
            info!("Scan aborted at pass {}/{}", self.state.pass, self.state.voltages.len());
            devices.release(ActuatorOwner::Scan);
            self.set_running(false);
            return Ok(());
        }

        if now.saturating_duration_since(self.last_step) < self.interval {
            return Ok(());
        }
        self.last_step = now;

        if self.step_pending {
            let volts = self.state.voltages[self.state.pass];
            devices.piezo_mut().set_voltage(volts)?;
            self.step_pending = false;
            debug!("Scan step {} reached {:.4}V on retry", self.state.pass, volts);
            // Settle for one interval before acquiring
            return Ok(());
        }

        let block = match devices.daq_mut().collect_block(self.tick_period)? {
            Some(block) => block,
            None => {
                debug!("Scan tick: no block ready");
                return Ok(());
            }
        };
        let sampling_rate = devices.daq().sampling_rate();
        let reference = self.reference()?;
        let demod = demod::compute_error_and_amplitude(
            block.detector()?,
            block.reference()?,
            reference.phase_deg,
            reference.frequency_hz,
            sampling_rate,
        )?;

        let pass = self.state.pass;
        self.state.intensity[pass] = demod.intensity;
        self.state.error[pass] = demod.error;
        self.state.pass += 1;
        debug!(
            "Scan pass {} at {:.4}V: intensity={:.3} error={:.4}",
            self.state.pass, self.state.voltages[pass], demod.intensity, demod.error
        );
        self.events.emit(EngineEvent::ScanPassAcquired { pass: self.state.pass });

        if self.state.pass >= self.state.voltages.len() {
            info!("Scan complete, {} steps recorded", self.state.pass);
            devices.release(ActuatorOwner::Scan);
            self.set_running(false);
        } else if let Err(e) = devices.piezo_mut().set_voltage(self.state.voltages[self.state.pass]) {
            self.step_pending = true;
            return Err(e.into());
        }
        Ok(())
    }

    fn set_running(&mut self, running: bool) {
        self.state.running = running;
        self.state.abort_requested = false;
        self.events.emit(EngineEvent::ScanRunningChanged(running));
    }
}

impl<D, P> Tick for ScanEngine<D, P>
where
    D: AcquisitionDevice + Send,
    P: Actuator + Send,
{
    fn name(&self) -> &'static str {
        "scan"
    }

    fn period(&self) -> Duration {
        self.tick_period
    }

    fn tick(&mut self) -> EngineResult<()> {
        ScanEngine::tick(self)
    }
}

/// Validate a step interval given in seconds.
fn step_interval(seconds: f64) -> EngineResult<Duration> {
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| EngineError::InvalidSetting(format!("scan interval {} s", seconds)))
}

/// `n` evenly spaced points from `low` to `high` inclusive.
pub fn linspace(low: f64, high: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![low],
        _ => {
            let step = (high - low) / (n - 1) as f64;
            (0..n)
                .map(|k| if k == n - 1 { high } else { low + step * k as f64 })
                .collect()
        }
    }
}
