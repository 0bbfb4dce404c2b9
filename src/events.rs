use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::lock::LockState;
use crate::telemetry::TelemetrySample;

/// Notifications emitted by the engines for presentation consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    ScanRunningChanged(bool),
    ScanPassAcquired { pass: usize },
    LockSampleRecorded(TelemetrySample),
    LockStateChanged(LockState),
    CompensationStateChanged(bool),
}

/// Observer list of channel subscribers. Cloning shares the list.
///
/// Emission never blocks: channels are unbounded and subscribers whose
/// receiver was dropped are pruned on the next emit.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<EngineEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}
