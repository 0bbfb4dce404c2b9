//! Lock engine - closed-loop resonance stabilisation
//!
//! Each tick acquires one detector/reference block, demodulates it into an
//! error signal and, while ACTIVE, integrates that error into the fast
//! correction voltage pushed to the acquisition output. The offset
//! compensator keeps that voltage inside its range by walking the actuator
//! bias. Every tick, locked or not, lands in the telemetry ring.
//!
//! State machine:
//! - INACTIVE --start--> ACTIVE
//! - ACTIVE --start/stop--> INACTIVE
//! - ACTIVE --|daq voltage| > threshold--> FAILURE
//! - FAILURE --stop--> INACTIVE, FAILURE --start--> ACTIVE (user restart)

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::compensator::{CompensationSettings, CompensationUpdate, OffsetCompensator};
use crate::config::SystemConfig;
use crate::demod::{self, Reference, SharedReference};
use crate::devices::{lock_devices, ActuatorOwner, Devices, SharedDevices};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::scheduler::Tick;
use crate::servo::{PidGains, PidServo};
use crate::status::LockStatus;
use crate::telemetry::{RingTelemetry, TelemetrySample};
use crate::traits::{AcquisitionDevice, Actuator, VoltageSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    Inactive,
    Active,
    Failure,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockState::Inactive => write!(f, "INACTIVE"),
            LockState::Active => write!(f, "ACTIVE"),
            LockState::Failure => write!(f, "FAILURE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub gains: PidGains,
    /// [Hz] approximate frequency of the reference signal
    pub frequency_hz: f64,
    /// [deg] phase shift applied to the reference before demodulation
    pub phase_deg: f64,
    pub compensation: CompensationSettings,
    /// [ms] lock tick period
    pub tick_interval_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        LockSettings {
            gains: PidGains::default(),
            frequency_hz: 5000.0,
            phase_deg: 180.0,
            compensation: CompensationSettings::default(),
            tick_interval_ms: 20,
        }
    }
}

impl LockSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// One runtime update of a lock setting.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LockParameter {
    ProportionalGain(f64),
    IntegralGain(f64),
    DerivativeGain(f64),
    FrequencyHz(f64),
    PhaseDeg(f64),
    CompensationEnabled(bool),
    MaxOffset(f64),
    TargetOffset(f64),
    CompensationTimeout(u32),
    TickIntervalMs(u64),
}

impl FromStr for LockParameter {
    type Err = EngineError;

    /// Parse `key=value`, e.g. `p=2.5` or `compensate=false`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| EngineError::InvalidSetting(format!("expected key=value, got '{}'", s)))?;
        let bad = |_| EngineError::InvalidSetting(format!("bad value for '{}': '{}'", key, value));
        let param = match key.trim() {
            "p" | "proportional" => LockParameter::ProportionalGain(value.parse().map_err(bad)?),
            "i" | "integral" => LockParameter::IntegralGain(value.parse().map_err(bad)?),
            "d" | "derivative" => LockParameter::DerivativeGain(value.parse().map_err(bad)?),
            "frequency" => LockParameter::FrequencyHz(value.parse().map_err(bad)?),
            "phase" => LockParameter::PhaseDeg(value.parse().map_err(bad)?),
            "max_offset" => LockParameter::MaxOffset(value.parse().map_err(bad)?),
            "target_offset" => LockParameter::TargetOffset(value.parse().map_err(bad)?),
            "compensate" => LockParameter::CompensationEnabled(
                value.trim().parse().map_err(|_| EngineError::InvalidSetting(format!("bad bool '{}'", value)))?,
            ),
            "compensation_timeout" => LockParameter::CompensationTimeout(
                value.trim().parse().map_err(|_| EngineError::InvalidSetting(format!("bad count '{}'", value)))?,
            ),
            "tick_interval_ms" => LockParameter::TickIntervalMs(
                value.trim().parse().map_err(|_| EngineError::InvalidSetting(format!("bad interval '{}'", value)))?,
            ),
            other => return Err(EngineError::InvalidSetting(format!("unknown lock parameter '{}'", other))),
        };
        Ok(param)
    }
}

pub struct LockEngine<D, P>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    devices: SharedDevices<D, P>,
    settings: LockSettings,
    failure_threshold_v: f64,
    retention: Duration,
    stats_window: usize,

    state: LockState,
    servo: PidServo,
    compensator: OffsetCompensator,
    daq_voltage: f64,
    piezo_voltage: f64,

    // Previous recorded sample, source of dt and the trapezoid's left edge
    last_sample: Option<TelemetrySample>,
    samples_recorded: u64,
    epoch: Instant,

    telemetry: Arc<RwLock<RingTelemetry>>,
    status_shared: Arc<RwLock<LockStatus>>,
    reference: SharedReference,
    events: EventBus,
}

impl<D, P> LockEngine<D, P>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    pub fn new(devices: SharedDevices<D, P>, config: &SystemConfig, events: EventBus) -> Self {
        let settings = config.lock;
        let retention = config.telemetry.retention();
        let telemetry = RingTelemetry::with_retention(retention, settings.tick_interval());

        info!(
            "Lock engine: P={} I={} D={} f={}Hz phase={}deg tick={}ms, telemetry {} samples",
            settings.gains.proportional,
            settings.gains.integral,
            settings.gains.derivative,
            settings.frequency_hz,
            settings.phase_deg,
            settings.tick_interval_ms,
            telemetry.capacity()
        );

        LockEngine {
            devices,
            settings,
            failure_threshold_v: config.servo.failure_threshold_v,
            retention,
            stats_window: config.telemetry.stats_window,
            state: LockState::Inactive,
            servo: PidServo::new(config.servo.gain_scale, config.servo.correction_divisor),
            compensator: OffsetCompensator::new(),
            daq_voltage: 0.0,
            piezo_voltage: 0.0,
            last_sample: None,
            samples_recorded: 0,
            epoch: Instant::now(),
            telemetry: Arc::new(RwLock::new(telemetry)),
            status_shared: Arc::new(RwLock::new(LockStatus::default())),
            reference: Arc::new(RwLock::new(Reference {
                phase_deg: settings.phase_deg,
                frequency_hz: settings.frequency_hz,
            })),
            events,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn settings(&self) -> LockSettings {
        self.settings
    }

    pub fn daq_voltage(&self) -> f64 {
        self.daq_voltage
    }

    pub fn piezo_voltage(&self) -> f64 {
        self.piezo_voltage
    }

    pub fn integral(&self) -> f64 {
        self.servo.integral()
    }

    pub fn is_compensating(&self) -> bool {
        self.compensator.is_compensating()
    }

    pub fn telemetry_shared(&self) -> Arc<RwLock<RingTelemetry>> {
        self.telemetry.clone()
    }

    pub fn status_shared(&self) -> Arc<RwLock<LockStatus>> {
        self.status_shared.clone()
    }

    /// Current demodulation reference, kept in sync with the phase and
    /// frequency settings.
    pub fn reference_shared(&self) -> SharedReference {
        self.reference.clone()
    }

    /// Copy of the last committed status.
    pub fn status(&self) -> LockStatus {
        self.status_shared
            .read()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Start locking, or stop if already ACTIVE.
    pub fn start(&mut self) -> EngineResult<LockState> {
        let devices = self.devices.clone();
        let mut devices = lock_devices(&devices)?;

        if self.state == LockState::Active {
            self.shutdown(&mut devices, LockState::Inactive)?;
            return Ok(self.state);
        }

        devices.claim(ActuatorOwner::Lock)?;
        if let Err(e) = self.engage(&mut devices) {
            devices.release(ActuatorOwner::Lock);
            return Err(e);
        }

        info!("Lock engaged at actuator {:.4}V", self.piezo_voltage);
        self.set_state(LockState::Active);
        Ok(self.state)
    }

    /// User-initiated stop. Also resets FAILURE back to INACTIVE.
    pub fn stop(&mut self) -> EngineResult<()> {
        match self.state {
            LockState::Inactive => Ok(()),
            LockState::Failure => {
                self.set_state(LockState::Inactive);
                Ok(())
            }
            LockState::Active => {
                let devices = self.devices.clone();
                let mut devices = lock_devices(&devices)?;
                self.shutdown(&mut devices, LockState::Inactive)
            }
        }
    }

    pub fn tick(&mut self) -> EngineResult<bool> {
        self.tick_at(Instant::now())
    }

    /// Run one control tick as of `now`. Returns false when no block was ready.
    pub fn tick_at(&mut self, now: Instant) -> EngineResult<bool> {
        let devices = self.devices.clone();
        let mut devices = lock_devices(&devices)?;

        let block = match devices.daq_mut().collect_block(self.settings.tick_interval())? {
            Some(block) => block,
            None => {
                debug!("Lock tick: no block ready");
                return Ok(false);
            }
        };
        let sampling_rate = devices.daq().sampling_rate();
        let demod = demod::compute_error_and_amplitude(
            block.detector()?,
            block.reference()?,
            self.settings.phase_deg,
            self.settings.frequency_hz,
            sampling_rate,
        )?;

        let time_s = now.saturating_duration_since(self.epoch).as_secs_f64();

        if self.state == LockState::Active {
            self.regulate(&mut devices, demod.error, time_s)?;
        }

        let sample = TelemetrySample {
            time_s,
            error: demod.error,
            daq_voltage: self.daq_voltage,
            actuator_voltage: self.piezo_voltage,
            amplitude: demod.amplitude,
        };
        self.record(sample);
        Ok(true)
    }

    // ========================================================================
    // SETTINGS
    // ========================================================================

    pub fn apply(&mut self, param: LockParameter) -> EngineResult<()> {
        match param {
            LockParameter::ProportionalGain(v) => self.set_proportional_gain(v),
            LockParameter::IntegralGain(v) => self.set_integral_gain(v),
            LockParameter::DerivativeGain(v) => self.set_derivative_gain(v),
            LockParameter::FrequencyHz(v) => self.set_frequency_hz(v),
            LockParameter::PhaseDeg(v) => self.set_phase_deg(v),
            LockParameter::CompensationEnabled(v) => {
                self.set_compensation_enabled(v);
                Ok(())
            }
            LockParameter::MaxOffset(v) => self.set_max_offset(v),
            LockParameter::TargetOffset(v) => self.set_target_offset(v),
            LockParameter::CompensationTimeout(v) => {
                self.set_compensation_timeout(v);
                Ok(())
            }
            LockParameter::TickIntervalMs(v) => self.set_tick_interval_ms(v),
        }
    }

    pub fn set_proportional_gain(&mut self, value: f64) -> EngineResult<()> {
        self.settings.gains.proportional = finite("proportional gain", value)?;
        Ok(())
    }

    pub fn set_integral_gain(&mut self, value: f64) -> EngineResult<()> {
        self.settings.gains.integral = finite("integral gain", value)?;
        Ok(())
    }

    pub fn set_derivative_gain(&mut self, value: f64) -> EngineResult<()> {
        self.settings.gains.derivative = finite("derivative gain", value)?;
        Ok(())
    }

    pub fn set_frequency_hz(&mut self, value: f64) -> EngineResult<()> {
        if !(value > 0.0) || !value.is_finite() {
            return Err(EngineError::InvalidSetting(format!("reference frequency {} Hz", value)));
        }
        self.settings.frequency_hz = value;
        self.publish_reference()
    }

    pub fn set_phase_deg(&mut self, value: f64) -> EngineResult<()> {
        self.settings.phase_deg = finite("phase", value)?;
        self.publish_reference()
    }

    pub fn set_compensation_enabled(&mut self, enabled: bool) {
        self.settings.compensation.enabled = enabled;
        info!("Offset compensation {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn set_max_offset(&mut self, value: f64) -> EngineResult<()> {
        self.settings.compensation.max_offset_v = finite("max offset", value)?;
        Ok(())
    }

    pub fn set_target_offset(&mut self, value: f64) -> EngineResult<()> {
        self.settings.compensation.target_offset_v = finite("target offset", value)?;
        Ok(())
    }

    pub fn set_compensation_timeout(&mut self, ticks: u32) {
        self.settings.compensation.timeout_ticks = ticks;
    }

    /// Change the tick period. Telemetry capacity is recomputed and its history dropped.
    pub fn set_tick_interval_ms(&mut self, ms: u64) -> EngineResult<()> {
        if ms == 0 {
            return Err(EngineError::InvalidSetting("tick interval must be non-zero".into()));
        }
        self.settings.tick_interval_ms = ms;
        self.resize_telemetry();
        Ok(())
    }

    pub fn set_retention(&mut self, retention: Duration) {
        self.retention = retention;
        self.resize_telemetry();
    }

    // ========================================================================
    // CONTROL
    // ========================================================================

    fn engage(&mut self, devices: &mut Devices<D, P>) -> EngineResult<()> {
        self.servo.reset();
        // No integration across the idle gap before this start
        self.last_sample = None;
        devices.piezo_mut().set_voltage_source(VoltageSource::External)?;
        self.piezo_voltage = devices.piezo().voltage()?;
        Ok(())
    }

    /// PID update, offset compensation and failure check for one ACTIVE tick.
    ///
    /// Servo and compensator updates are staged and committed only once the
    /// device writes went through, so a failed tick leaves no partial state
    /// behind and the next tick integrates from the last recorded sample.
    fn regulate(&mut self, devices: &mut Devices<D, P>, error: f64, time_s: f64) -> EngineResult<()> {
        let previous = self.last_sample.map(|s| (s.error, time_s - s.time_s));
        let step = self.servo.propose(self.settings.gains, error, previous);
        let daq_voltage = self.daq_voltage + step.increment;

        let mut compensator = self.compensator.clone();
        let update = compensator.update(daq_voltage, &self.settings.compensation);
        let mut announced = false;
        if update.step != 0 {
            devices.piezo_mut().increment_voltage(update.step)?;
            // Actuator moved: its step bookkeeping holds even if the tick fails later
            self.compensator = compensator.clone();
            self.announce_compensation(update, daq_voltage);
            announced = true;
            // Reported voltage includes the external input
            self.piezo_voltage = devices.piezo().voltage()?;
            debug!("Compensation step {:+} -> actuator {:.4}V", update.step, self.piezo_voltage);
        }

        let saturated = daq_voltage.abs() > self.failure_threshold_v;
        if !saturated {
            devices.daq_mut().set_output_voltage(daq_voltage)?;
        }

        self.servo.commit(step);
        self.daq_voltage = daq_voltage;
        self.compensator = compensator;
        if !announced {
            self.announce_compensation(update, daq_voltage);
        }

        if saturated {
            warn!(
                "Fast correction {:.4}V beyond +/-{}V, lock lost",
                daq_voltage, self.failure_threshold_v
            );
            return self.shutdown(devices, LockState::Failure);
        }
        Ok(())
    }

    fn publish_reference(&self) -> EngineResult<()> {
        let mut reference = self.reference.write().map_err(|_| EngineError::Poisoned)?;
        *reference = Reference {
            phase_deg: self.settings.phase_deg,
            frequency_hz: self.settings.frequency_hz,
        };
        Ok(())
    }

    fn announce_compensation(&self, update: CompensationUpdate, daq_voltage: f64) {
        if update.changed {
            info!(
                "Offset compensation {} at {:.4}V",
                if update.compensating { "engaged" } else { "released" },
                daq_voltage
            );
            self.events.emit(EngineEvent::CompensationStateChanged(update.compensating));
        }
    }

    /// Revert the actuator to manual control, zero the fast channel and enter `reason`.
    fn shutdown(&mut self, devices: &mut Devices<D, P>, reason: LockState) -> EngineResult<()> {
        let source = devices.piezo_mut().set_voltage_source(VoltageSource::Manual);
        self.daq_voltage = 0.0;
        let output = devices.daq_mut().set_output_voltage(self.daq_voltage);
        devices.release(ActuatorOwner::Lock);

        if self.compensator.clear() {
            self.events.emit(EngineEvent::CompensationStateChanged(false));
        }
        self.set_state(reason);

        source?;
        output?;
        Ok(())
    }

    fn set_state(&mut self, state: LockState) {
        if self.state != state {
            info!("Lock state {} -> {}", self.state, state);
        }
        self.state = state;
        self.events.emit(EngineEvent::LockStateChanged(state));
        self.update_shared_status();
    }

    fn record(&mut self, sample: TelemetrySample) {
        if let Ok(mut ring) = self.telemetry.write() {
            ring.push(sample);
        }
        self.last_sample = Some(sample);
        self.samples_recorded += 1;
        self.events.emit(EngineEvent::LockSampleRecorded(sample));
        self.update_shared_status();
    }

    fn resize_telemetry(&mut self) {
        let capacity = RingTelemetry::capacity_for(self.retention, self.settings.tick_interval());
        if let Ok(mut ring) = self.telemetry.write() {
            ring.resize(capacity);
        }
        info!("Telemetry resized to {} samples", capacity);
    }

    fn update_shared_status(&self) {
        let (error_mean, error_std) = match self.telemetry.read() {
            Ok(ring) => (
                ring.error_mean(self.stats_window).unwrap_or(0.0),
                ring.error_std(self.stats_window).unwrap_or(0.0),
            ),
            Err(_) => (0.0, 0.0),
        };

        if let Ok(mut status) = self.status_shared.write() {
            status.state = self.state;
            status.daq_voltage = self.daq_voltage;
            status.actuator_voltage = self.piezo_voltage;
            status.integral = self.servo.integral();
            status.compensating = self.compensator.is_compensating();
            if let Some(last) = self.last_sample {
                status.last_error = last.error;
                status.last_amplitude = last.amplitude;
            }
            status.error_mean = error_mean;
            status.error_std = error_std;
            status.samples_recorded = self.samples_recorded;
            status.updated_ts = SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
        }
    }
}

impl<D, P> Tick for LockEngine<D, P>
where
    D: AcquisitionDevice + Send,
    P: Actuator + Send,
{
    fn name(&self) -> &'static str {
        "lock"
    }

    fn period(&self) -> Duration {
        self.settings.tick_interval()
    }

    fn tick(&mut self) -> EngineResult<()> {
        LockEngine::tick(self).map(|_| ())
    }
}

fn finite(what: &str, value: f64) -> EngineResult<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(EngineError::InvalidSetting(format!("{} must be finite, got {}", what, value)))
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Devices;
    use crate::traits::{MockAcquisitionDevice, MockActuator, SampleBlock};
    use mockall::predicate::*;
    use std::sync::Mutex;

    const FS: f64 = 100_000.0;

    /// Block whose normalized detector equals the reference, so error = 0.5.
    fn constant_error_block() -> SampleBlock {
        let detector: Vec<f64> = (0..100).map(|k| if k % 2 == 0 { 0.0 } else { 2.0 }).collect();
        let reference: Vec<f64> = (0..100).map(|k| if k % 2 == 0 { 0.0 } else { 1.0 }).collect();
        SampleBlock::new(detector, reference)
    }

    fn test_config() -> SystemConfig {
        let mut config = SystemConfig::default();
        config.lock.phase_deg = 0.0;
        config.lock.compensation.enabled = false;
        config.telemetry.retention_secs = 10;
        config
    }

    fn daq_with_outputs(outputs: Arc<Mutex<Vec<f64>>>) -> MockAcquisitionDevice {
        let mut daq = MockAcquisitionDevice::new();
        let block = constant_error_block();
        daq.expect_collect_block()
            .returning(move |_| Ok(Some(block.clone())));
        daq.expect_sampling_rate().return_const(FS);
        daq.expect_set_output_voltage().returning(move |v| {
            outputs.lock().unwrap().push(v);
            Ok(())
        });
        daq
    }

    fn permissive_piezo() -> MockActuator {
        let mut piezo = MockActuator::new();
        piezo.expect_set_voltage_source().returning(|_| Ok(()));
        piezo.expect_voltage().returning(|| Ok(3.0));
        piezo.expect_increment_voltage().returning(|_| Ok(()));
        piezo
    }

    fn engine(
        daq: MockAcquisitionDevice,
        piezo: MockActuator,
        config: &SystemConfig,
    ) -> (LockEngine<MockAcquisitionDevice, MockActuator>, EventBus) {
        let bus = EventBus::new();
        let devices = Devices::new(daq, piezo).shared();
        (LockEngine::new(devices, config, bus.clone()), bus)
    }

    #[test]
    fn test_start_switches_source_and_captures_baseline() {
        let _ = env_logger::builder().is_test(true).try_init();
        let daq = MockAcquisitionDevice::new();
        let mut piezo = MockActuator::new();
        piezo.expect_set_voltage_source()
            .with(eq(VoltageSource::External))
            .times(1)
            .returning(|_| Ok(()));
        piezo.expect_voltage().times(1).returning(|| Ok(12.5));

        let (mut lock, bus) = engine(daq, piezo, &test_config());
        let rx = bus.subscribe();

        assert_eq!(lock.start().unwrap(), LockState::Active);
        assert_eq!(lock.piezo_voltage(), 12.5);
        assert_eq!(rx.try_recv(), Ok(EngineEvent::LockStateChanged(LockState::Active)));
        assert_eq!(lock.status().state, LockState::Active);
    }

    #[test]
    fn test_start_toggles_to_stop() {
        let mut daq = MockAcquisitionDevice::new();
        daq.expect_set_output_voltage()
            .with(eq(0.0))
            .times(1)
            .returning(|_| Ok(()));
        let mut piezo = MockActuator::new();
        piezo.expect_voltage().returning(|| Ok(1.0));
        piezo.expect_set_voltage_source()
            .with(eq(VoltageSource::External))
            .times(1)
            .returning(|_| Ok(()));
        piezo.expect_set_voltage_source()
            .with(eq(VoltageSource::Manual))
            .times(1)
            .returning(|_| Ok(()));

        let (mut lock, _bus) = engine(daq, piezo, &test_config());
        lock.start().unwrap();
        assert_eq!(lock.start().unwrap(), LockState::Inactive);
        assert_eq!(lock.daq_voltage(), 0.0);

        // Already inactive: no further device calls
        lock.stop().unwrap();
    }

    #[test]
    fn test_start_refused_while_scan_owns_actuator() {
        let daq = MockAcquisitionDevice::new();
        let piezo = MockActuator::new();
        let bus = EventBus::new();
        let devices = Devices::new(daq, piezo).shared();
        devices.lock().unwrap().claim(ActuatorOwner::Scan).unwrap();

        let mut lock = LockEngine::new(devices, &test_config(), bus);
        assert_eq!(
            lock.start(),
            Err(EngineError::ActuatorBusy {
                owner: ActuatorOwner::Scan
            })
        );
        assert_eq!(lock.state(), LockState::Inactive);
    }

    #[test]
    fn test_inactive_tick_records_without_output() {
        let mut daq = MockAcquisitionDevice::new();
        let block = constant_error_block();
        daq.expect_collect_block()
            .times(3)
            .returning(move |_| Ok(Some(block.clone())));
        daq.expect_sampling_rate().return_const(FS);
        daq.expect_set_output_voltage().never();

        let (mut lock, bus) = engine(daq, MockActuator::new(), &test_config());
        let rx = bus.subscribe();
        let t0 = Instant::now();
        for k in 0..3 {
            assert!(lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap());
        }

        let ring = lock.telemetry_shared();
        let ring = ring.read().unwrap();
        assert_eq!(ring.len(), 3);
        assert!((ring.latest().unwrap().error - 0.5).abs() < 1e-12);
        assert_eq!(ring.latest().unwrap().amplitude, 2.0);
        assert_eq!(rx.try_iter().count(), 3);
    }

    #[test]
    fn test_missing_block_is_noop() {
        let mut daq = MockAcquisitionDevice::new();
        daq.expect_collect_block().returning(|_| Ok(None));

        let (mut lock, _bus) = engine(daq, MockActuator::new(), &test_config());
        assert!(!lock.tick().unwrap());
        assert!(lock.telemetry_shared().read().unwrap().is_empty());
    }

    #[test]
    fn test_acquisition_failure_skips_tick() {
        let mut daq = MockAcquisitionDevice::new();
        daq.expect_collect_block()
            .returning(|_| Err(anyhow::anyhow!("scope timed out")));

        let (mut lock, _bus) = engine(daq, MockActuator::new(), &test_config());
        assert!(matches!(lock.tick(), Err(EngineError::Device(_))));
        assert!(lock.telemetry_shared().read().unwrap().is_empty());
    }

    #[test]
    fn test_integral_matches_constant_error() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let mut config = test_config();
        config.lock.gains = PidGains {
            proportional: 0.0,
            integral: 0.8,
            derivative: 0.0,
        };
        let (mut lock, _bus) = engine(daq_with_outputs(outputs.clone()), permissive_piezo(), &config);

        lock.start().unwrap();
        assert_eq!(lock.integral(), 0.0);

        let t0 = Instant::now();
        let ticks = 50u64;
        for k in 0..ticks {
            lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap();
        }

        let elapsed = 0.02 * (ticks - 1) as f64;
        assert!((lock.integral() - 0.8 * 0.5 * elapsed).abs() < 1e-9);
        assert_eq!(outputs.lock().unwrap().len(), ticks as usize);
    }

    #[test]
    fn test_failed_output_write_skips_tick() {
        let calls = Arc::new(Mutex::new(0usize));
        let mut daq = MockAcquisitionDevice::new();
        let block = constant_error_block();
        daq.expect_collect_block()
            .returning(move |_| Ok(Some(block.clone())));
        daq.expect_sampling_rate().return_const(FS);
        let counter = calls.clone();
        daq.expect_set_output_voltage().returning(move |_| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n == 3 {
                Err(anyhow::anyhow!("output rejected"))
            } else {
                Ok(())
            }
        });

        let mut config = test_config();
        config.lock.gains = PidGains {
            proportional: 0.0,
            integral: 1.0,
            derivative: 0.0,
        };
        let (mut lock, _bus) = engine(daq, permissive_piezo(), &config);
        lock.start().unwrap();

        let t0 = Instant::now();
        let mut daq_before_failure = 0.0;
        for k in 0..10u64 {
            if k == 2 {
                daq_before_failure = lock.daq_voltage();
                let integral_before = lock.integral();
                let result = lock.tick_at(t0 + Duration::from_millis(20 * k));
                assert!(matches!(result, Err(EngineError::Device(_))));
                assert_eq!(lock.integral(), integral_before);
                assert_eq!(lock.daq_voltage(), daq_before_failure);
            } else {
                assert!(lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap());
            }
        }

        // Every interval integrated exactly once: Ki * E * T
        assert!((lock.integral() - 1.0 * 0.5 * 0.18).abs() < 1e-9, "integral {}", lock.integral());
        assert!(lock.daq_voltage() > daq_before_failure);
        assert_eq!(lock.telemetry_shared().read().unwrap().len(), 9);
        assert_eq!(lock.state(), LockState::Active);
    }

    #[test]
    fn test_failed_increment_keeps_compensation_step() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let mut config = test_config();
        config.lock.gains = PidGains {
            proportional: 1000.0,
            integral: 0.0,
            derivative: 0.0,
        };
        config.lock.compensation = CompensationSettings {
            enabled: true,
            max_offset_v: 0.042,
            target_offset_v: 0.01,
            timeout_ticks: 2,
        };

        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = attempts.clone();
        let mut piezo = MockActuator::new();
        piezo.expect_set_voltage_source().returning(|_| Ok(()));
        piezo.expect_voltage().returning(|| Ok(3.0));
        piezo.expect_increment_voltage().returning(move |dir| {
            let mut seen = seen.lock().unwrap();
            seen.push(dir);
            if seen.len() == 1 {
                Err(anyhow::anyhow!("controller busy"))
            } else {
                Ok(())
            }
        });

        let (mut lock, bus) = engine(daq_with_outputs(outputs.clone()), piezo, &config);
        let rx = bus.subscribe();
        lock.start().unwrap();

        // Tick 9 engages and fails its step, tick 10 retries it
        let t0 = Instant::now();
        for k in 0..9u64 {
            let _ = lock.tick_at(t0 + Duration::from_millis(20 * k));
        }
        assert!(!lock.is_compensating());
        assert_eq!(outputs.lock().unwrap().len(), 8);

        lock.tick_at(t0 + Duration::from_millis(20 * 9)).unwrap();
        assert!(lock.is_compensating());
        assert_eq!(*attempts.lock().unwrap(), vec![1, 1]);
        let engaged = rx
            .try_iter()
            .filter(|e| *e == EngineEvent::CompensationStateChanged(true))
            .count();
        assert_eq!(engaged, 1);
    }

    #[test]
    fn test_integral_reset_on_restart() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let (mut lock, _bus) = engine(daq_with_outputs(outputs), permissive_piezo(), &test_config());

        lock.start().unwrap();
        let t0 = Instant::now();
        for k in 0..5 {
            lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap();
        }
        assert!(lock.integral() > 0.0);

        lock.stop().unwrap();
        lock.start().unwrap();
        assert_eq!(lock.integral(), 0.0);
    }

    #[test]
    fn test_saturation_triggers_single_failure() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let mut config = test_config();
        // 4800 * 0.5 * 1e-5 = 0.024 V per tick, failure on tick 84
        config.lock.gains = PidGains {
            proportional: 4800.0,
            integral: 0.0,
            derivative: 0.0,
        };
        let (mut lock, bus) = engine(daq_with_outputs(outputs.clone()), permissive_piezo(), &config);
        let rx = bus.subscribe();

        lock.start().unwrap();
        let t0 = Instant::now();
        for k in 0..120 {
            lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap();
        }

        assert_eq!(lock.state(), LockState::Failure);
        let failures = rx
            .try_iter()
            .filter(|e| *e == EngineEvent::LockStateChanged(LockState::Failure))
            .count();
        assert_eq!(failures, 1);

        let outputs = outputs.lock().unwrap();
        // 83 regular pushes, then the zeroing write from the shutdown
        assert_eq!(outputs.len(), 84);
        assert_eq!(*outputs.last().unwrap(), 0.0);
        assert!(outputs[..83].iter().all(|v| v.abs() <= 2.0));
        assert_eq!(lock.daq_voltage(), 0.0);

        // Telemetry keeps running after the failure
        assert_eq!(lock.telemetry_shared().read().unwrap().len(), 120);

        // Explicit stop resets FAILURE
        lock.stop().unwrap();
        assert_eq!(lock.state(), LockState::Inactive);
    }

    #[test]
    fn test_compensation_steps_actuator() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let mut config = test_config();
        config.lock.gains = PidGains {
            proportional: 1000.0,
            integral: 0.0,
            derivative: 0.0,
        };
        config.lock.compensation = CompensationSettings {
            enabled: true,
            max_offset_v: 0.042,
            target_offset_v: 0.01,
            timeout_ticks: 2,
        };

        let mut piezo = MockActuator::new();
        piezo.expect_set_voltage_source().returning(|_| Ok(()));
        piezo.expect_voltage().returning(|| Ok(3.0));
        piezo.expect_increment_voltage()
            .with(eq(1))
            .times(3)
            .returning(|_| Ok(()));

        let (mut lock, bus) = engine(daq_with_outputs(outputs), piezo, &config);
        let rx = bus.subscribe();
        lock.start().unwrap();

        // 0.005 V per tick: crosses 0.042 V on tick 9, steps on ticks 9, 12, 15
        let t0 = Instant::now();
        for k in 0..15 {
            lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap();
        }

        assert!(lock.is_compensating());
        let engaged = rx
            .try_iter()
            .filter(|e| *e == EngineEvent::CompensationStateChanged(true))
            .count();
        assert_eq!(engaged, 1);
    }

    #[test]
    fn test_lock_parameter_parsing() {
        assert_eq!("p=2.5".parse(), Ok(LockParameter::ProportionalGain(2.5)));
        assert_eq!("phase=-90".parse(), Ok(LockParameter::PhaseDeg(-90.0)));
        assert_eq!("compensate=false".parse(), Ok(LockParameter::CompensationEnabled(false)));
        assert_eq!("tick_interval_ms=10".parse(), Ok(LockParameter::TickIntervalMs(10)));
        assert!("gain".parse::<LockParameter>().is_err());
        assert!("q=1".parse::<LockParameter>().is_err());
        assert!("p=abc".parse::<LockParameter>().is_err());
    }

    #[test]
    fn test_settings_update_keeps_integral() {
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let (mut lock, _bus) = engine(daq_with_outputs(outputs), permissive_piezo(), &test_config());
        lock.start().unwrap();
        let t0 = Instant::now();
        for k in 0..4 {
            lock.tick_at(t0 + Duration::from_millis(20 * k)).unwrap();
        }
        let before = lock.integral();

        lock.apply(LockParameter::IntegralGain(3.0)).unwrap();
        lock.apply(LockParameter::PhaseDeg(45.0)).unwrap();
        assert_eq!(lock.integral(), before);
        assert_eq!(lock.settings().gains.integral, 3.0);
        assert!(lock.apply(LockParameter::FrequencyHz(0.0)).is_err());
        assert_eq!(
            *lock.reference_shared().read().unwrap(),
            Reference {
                phase_deg: 45.0,
                frequency_hz: 5000.0
            }
        );
    }

    #[test]
    fn test_tick_interval_resizes_telemetry() {
        let (mut lock, _bus) = engine(MockAcquisitionDevice::new(), MockActuator::new(), &test_config());
        assert_eq!(lock.telemetry_shared().read().unwrap().capacity(), 500);

        lock.set_tick_interval_ms(50).unwrap();
        assert_eq!(lock.telemetry_shared().read().unwrap().capacity(), 200);
        assert!(lock.set_tick_interval_ms(0).is_err());
    }
}
