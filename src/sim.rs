//! Simulated cavity used by the binary and the closed-loop tests.
//!
//! Transmission is a Lorentzian of the detuning between the effective
//! actuator voltage and the resonance. The detuning is dithered
//! sinusoidally at the modulation frequency; the reference channel carries
//! the same sinusoid shifted by `reference_phase_deg`.

use anyhow::{anyhow, Result};
use log::debug;
use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::traits::{AcquisitionDevice, AcquisitionParameters, Actuator, SampleBlock, VoltageSource};

#[derive(Debug, Clone)]
pub struct CavityModel {
    /// [V] actuator voltage at which the cavity is resonant
    pub resonance_v: f64,
    /// [V] half width at half maximum, in actuator volts
    pub linewidth_v: f64,
    /// [V] dither amplitude, in actuator volts
    pub dither_v: f64,
    /// Actuator volts per volt of fast correction while the source is external
    pub daq_gain: f64,
    /// [V] size of one native actuator increment
    pub increment_v: f64,
    /// [V] resonance drift per acquired block
    pub drift_v_per_block: f64,
    /// [deg] phase of the reference channel relative to the dither
    pub reference_phase_deg: f64,
    pub sampling_rate_hz: f64,
    pub modulation_hz: f64,
    pub samples_per_block: usize,
    /// When set, `collect_block` reports no block ready
    pub stalled: bool,

    pub piezo_v: f64,
    pub daq_v: f64,
    pub source: VoltageSource,
    pub sample_clock: u64,
}

impl Default for CavityModel {
    fn default() -> Self {
        CavityModel {
            resonance_v: 5.0,
            linewidth_v: 0.5,
            dither_v: 0.05,
            daq_gain: 1.0,
            increment_v: 0.01,
            drift_v_per_block: 0.0,
            reference_phase_deg: 180.0,
            sampling_rate_hz: 100_000.0,
            modulation_hz: 5_000.0,
            samples_per_block: 1000,
            stalled: false,
            piezo_v: 0.0,
            daq_v: 0.0,
            source: VoltageSource::Manual,
            sample_clock: 0,
        }
    }
}

impl CavityModel {
    /// Actuator voltage seen by the cavity.
    pub fn effective_voltage(&self) -> f64 {
        match self.source {
            VoltageSource::External => self.piezo_v + self.daq_gain * self.daq_v,
            VoltageSource::Manual => self.piezo_v,
        }
    }

    pub fn detuning(&self) -> f64 {
        self.effective_voltage() - self.resonance_v
    }

    pub fn transmission(&self, detuning: f64) -> f64 {
        let x = detuning / self.linewidth_v;
        1.0 / (1.0 + x * x)
    }

    fn acquire(&mut self) -> SampleBlock {
        let n = self.samples_per_block;
        let detuning = self.detuning();
        let omega = 2.0 * PI * self.modulation_hz / self.sampling_rate_hz;
        let ref_phase = self.reference_phase_deg.to_radians();

        let mut detector = Vec::with_capacity(n);
        let mut reference = Vec::with_capacity(n);
        for k in 0..n {
            let phase = omega * (self.sample_clock + k as u64) as f64;
            detector.push(self.transmission(detuning + self.dither_v * phase.sin()));
            reference.push((phase + ref_phase).sin());
        }

        self.sample_clock += n as u64;
        self.resonance_v += self.drift_v_per_block;
        SampleBlock::new(detector, reference)
    }
}

/// Handle to a cavity model shared by its acquisition and actuator halves.
#[derive(Clone)]
pub struct SimulatedCavity {
    model: Arc<Mutex<CavityModel>>,
}

impl SimulatedCavity {
    pub fn new(model: CavityModel) -> Self {
        SimulatedCavity {
            model: Arc::new(Mutex::new(model)),
        }
    }

    pub fn split(&self) -> (SimAcquisition, SimActuator) {
        (
            SimAcquisition {
                model: self.model.clone(),
            },
            SimActuator {
                model: self.model.clone(),
            },
        )
    }

    /// Copy of the current model state.
    pub fn model(&self) -> Result<CavityModel> {
        Ok(lock_model(&self.model)?.clone())
    }

    pub fn update<F: FnOnce(&mut CavityModel)>(&self, f: F) -> Result<()> {
        f(&mut *lock_model(&self.model)?);
        Ok(())
    }
}

fn lock_model(model: &Arc<Mutex<CavityModel>>) -> Result<MutexGuard<'_, CavityModel>> {
    model.lock().map_err(|_| anyhow!("cavity model mutex poisoned"))
}

pub struct SimAcquisition {
    model: Arc<Mutex<CavityModel>>,
}

impl AcquisitionDevice for SimAcquisition {
    fn collect_block(&mut self, _timeout: Duration) -> Result<Option<SampleBlock>> {
        let mut model = lock_model(&self.model)?;
        if model.stalled {
            return Ok(None);
        }
        Ok(Some(model.acquire()))
    }

    fn set_output_voltage(&mut self, volts: f64) -> Result<()> {
        lock_model(&self.model)?.daq_v = volts;
        Ok(())
    }

    fn apply_acquisition_parameters(&mut self) -> Result<()> {
        let params = self.acquisition_parameters();
        debug!(
            "Sim acquisition: timebase {} with {} samples",
            params.timebase_index, params.sample_count
        );
        Ok(())
    }

    fn acquisition_parameters(&self) -> AcquisitionParameters {
        let samples = lock_model(&self.model)
            .map(|m| m.samples_per_block)
            .unwrap_or(0);
        AcquisitionParameters {
            timebase_index: 8,
            sample_count: samples,
            channel_ranges: vec![1.0, 1.0],
        }
    }

    fn sampling_rate(&self) -> f64 {
        lock_model(&self.model)
            .map(|m| m.sampling_rate_hz)
            .unwrap_or(f64::NAN)
    }
}

pub struct SimActuator {
    model: Arc<Mutex<CavityModel>>,
}

impl Actuator for SimActuator {
    fn set_voltage(&mut self, volts: f64) -> Result<()> {
        lock_model(&self.model)?.piezo_v = volts;
        Ok(())
    }

    fn voltage(&self) -> Result<f64> {
        Ok(lock_model(&self.model)?.effective_voltage())
    }

    fn set_voltage_source(&mut self, source: VoltageSource) -> Result<()> {
        let mut model = lock_model(&self.model)?;
        debug!("Sim actuator source {} -> {}", model.source, source);
        model.source = source;
        Ok(())
    }

    fn increment_voltage(&mut self, direction: i32) -> Result<()> {
        let mut model = lock_model(&self.model)?;
        model.piezo_v += model.increment_v * f64::from(direction.signum());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demod;

    #[test]
    fn test_external_source_adds_fast_channel() {
        let cavity = SimulatedCavity::new(CavityModel {
            piezo_v: 3.0,
            ..Default::default()
        });
        let (mut daq, mut piezo) = cavity.split();

        daq.set_output_voltage(0.5).unwrap();
        assert_eq!(piezo.voltage().unwrap(), 3.0);

        piezo.set_voltage_source(VoltageSource::External).unwrap();
        assert_eq!(piezo.voltage().unwrap(), 3.5);

        piezo.increment_voltage(-4).unwrap();
        assert!((piezo.voltage().unwrap() - 3.49).abs() < 1e-12);
    }

    #[test]
    fn test_block_shape() {
        let cavity = SimulatedCavity::new(CavityModel::default());
        let (mut daq, _) = cavity.split();
        let block = daq.collect_block(Duration::from_millis(20)).unwrap().unwrap();
        assert_eq!(block.detector().unwrap().len(), 1000);
        assert_eq!(block.reference().unwrap().len(), 1000);
        assert!(block.detector().unwrap().iter().all(|&x| x > 0.0 && x <= 1.0));
    }

    #[test]
    fn test_error_sign_follows_detuning() {
        for (piezo_v, sign) in [(4.6, 1.0), (5.4, -1.0)] {
            let cavity = SimulatedCavity::new(CavityModel {
                piezo_v,
                ..Default::default()
            });
            let (mut daq, _) = cavity.split();
            let block = daq.collect_block(Duration::from_millis(20)).unwrap().unwrap();
            let d = demod::compute_error_and_amplitude(
                block.detector().unwrap(),
                block.reference().unwrap(),
                180.0,
                5_000.0,
                daq.sampling_rate(),
            )
            .unwrap();
            assert!(d.error * sign > 0.1, "error {} at {}V", d.error, piezo_v);
        }
    }

    #[test]
    fn test_stalled_returns_no_block() {
        let cavity = SimulatedCavity::new(CavityModel::default());
        cavity.update(|m| m.stalled = true).unwrap();
        let (mut daq, _) = cavity.split();
        assert!(daq.collect_block(Duration::from_millis(1)).unwrap().is_none());
    }
}
