//! Binding of the acquisition device and the actuator shared by both engines.
//!
//! The lock and scan engines each hold a clone of [`SharedDevices`]. Every
//! tick locks the mutex for its whole duration, so device access is
//! serialized. Which engine may *drive* the actuator is tracked separately by
//! an ownership token: the lock claims it while ACTIVE, the scan while
//! RUNNING, and a second claim fails with [`EngineError::ActuatorBusy`].

use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{EngineError, EngineResult};
use crate::traits::{AcquisitionDevice, Actuator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActuatorOwner {
    Lock,
    Scan,
}

impl fmt::Display for ActuatorOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActuatorOwner::Lock => write!(f, "lock"),
            ActuatorOwner::Scan => write!(f, "scan"),
        }
    }
}

pub struct Devices<D, P>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    daq: D,
    piezo: P,
    owner: Option<ActuatorOwner>,
}

pub type SharedDevices<D, P> = Arc<Mutex<Devices<D, P>>>;

impl<D, P> Devices<D, P>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    pub fn new(daq: D, piezo: P) -> Self {
        Devices {
            daq,
            piezo,
            owner: None,
        }
    }

    pub fn shared(self) -> SharedDevices<D, P> {
        Arc::new(Mutex::new(self))
    }

    pub fn daq(&self) -> &D {
        &self.daq
    }

    pub fn daq_mut(&mut self) -> &mut D {
        &mut self.daq
    }

    pub fn piezo(&self) -> &P {
        &self.piezo
    }

    pub fn piezo_mut(&mut self) -> &mut P {
        &mut self.piezo
    }

    pub fn owner(&self) -> Option<ActuatorOwner> {
        self.owner
    }

    /// Take ownership of the actuator. Re-claiming by the current owner is a no-op.
    pub fn claim(&mut self, who: ActuatorOwner) -> EngineResult<()> {
        match self.owner {
            Some(owner) if owner != who => Err(EngineError::ActuatorBusy { owner }),
            _ => {
                self.owner = Some(who);
                Ok(())
            }
        }
    }

    /// Release ownership if `who` holds it.
    pub fn release(&mut self, who: ActuatorOwner) {
        if self.owner == Some(who) {
            self.owner = None;
        }
    }

    /// Swap in a new acquisition device, returning the previous one.
    pub fn replace_acquisition(&mut self, daq: D) -> D {
        info!("Acquisition device replaced");
        std::mem::replace(&mut self.daq, daq)
    }

    /// Swap in a new actuator. Refused while an engine is driving it.
    pub fn replace_actuator(&mut self, piezo: P) -> EngineResult<P> {
        if let Some(owner) = self.owner {
            return Err(EngineError::ActuatorBusy { owner });
        }
        info!("Actuator replaced");
        Ok(std::mem::replace(&mut self.piezo, piezo))
    }
}

/// Lock a shared device handle, mapping poisoning to an engine error.
pub fn lock_devices<D, P>(devices: &SharedDevices<D, P>) -> EngineResult<MutexGuard<'_, Devices<D, P>>>
where
    D: AcquisitionDevice,
    P: Actuator,
{
    devices.lock().map_err(|_| EngineError::Poisoned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{MockAcquisitionDevice, MockActuator};

    fn devices() -> Devices<MockAcquisitionDevice, MockActuator> {
        Devices::new(MockAcquisitionDevice::new(), MockActuator::new())
    }

    #[test]
    fn test_claim_is_exclusive() {
        let mut d = devices();
        d.claim(ActuatorOwner::Scan).unwrap();
        assert_eq!(
            d.claim(ActuatorOwner::Lock),
            Err(EngineError::ActuatorBusy {
                owner: ActuatorOwner::Scan
            })
        );
        // Re-claim by the owner is fine
        d.claim(ActuatorOwner::Scan).unwrap();
    }

    #[test]
    fn test_release_only_by_owner() {
        let mut d = devices();
        d.claim(ActuatorOwner::Lock).unwrap();
        d.release(ActuatorOwner::Scan);
        assert_eq!(d.owner(), Some(ActuatorOwner::Lock));
        d.release(ActuatorOwner::Lock);
        assert_eq!(d.owner(), None);
        d.claim(ActuatorOwner::Scan).unwrap();
    }

    #[test]
    fn test_replace_acquisition_returns_previous() {
        let mut first = MockAcquisitionDevice::new();
        first.expect_sampling_rate().return_const(1000.0);
        let mut second = MockAcquisitionDevice::new();
        second.expect_sampling_rate().return_const(2000.0);

        let mut d = Devices::new(first, MockActuator::new());
        d.claim(ActuatorOwner::Lock).unwrap();
        let old = d.replace_acquisition(second);
        assert_eq!(old.sampling_rate(), 1000.0);
        assert_eq!(d.daq().sampling_rate(), 2000.0);
    }

    #[test]
    fn test_replace_actuator_refused_while_owned() {
        let mut d = devices();
        d.claim(ActuatorOwner::Lock).unwrap();
        assert!(d.replace_actuator(MockActuator::new()).is_err());
        d.release(ActuatorOwner::Lock);
        assert!(d.replace_actuator(MockActuator::new()).is_ok());
    }
}
