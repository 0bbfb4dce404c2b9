use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::EngineResult;

/// An engine driven on a fixed period.
pub trait Tick {
    fn tick(&mut self) -> EngineResult<()>;
    /// Current period, re-read before every tick.
    fn period(&self) -> Duration;
    fn name(&self) -> &'static str;
}

/// Drives one engine on a dedicated thread until stopped or dropped.
///
/// Each tick runs to completion while holding the engine mutex, so other
/// threads calling into the engine see it only between ticks. A tick that
/// overruns its period delays the next one instead of queueing ticks.
pub struct PeriodicTask {
    name: &'static str,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn spawn<E>(engine: Arc<Mutex<E>>) -> Self
    where
        E: Tick + Send + 'static,
    {
        let name = engine.lock().map(|e| e.name()).unwrap_or("engine");
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = thread::spawn(move || {
            info!("Periodic {} task started", name);
            let mut next = Instant::now();

            while flag.load(Ordering::SeqCst) {
                let period = match engine.lock() {
                    Ok(mut e) => {
                        if let Err(err) = e.tick() {
                            warn!("{} tick failed: {}", name, err);
                        }
                        e.period()
                    }
                    Err(_) => {
                        warn!("{} engine mutex poisoned, stopping task", name);
                        break;
                    }
                };

                next += period;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    debug!("{} tick overran its period", name);
                    next = now;
                }
            }
            info!("Periodic {} task stopped", name);
        });

        PeriodicTask {
            name,
            running,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
            && self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// Stop after the current tick and join the thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("{} task panicked", self.name);
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    struct Counter {
        ticks: usize,
        fail_every: usize,
    }

    impl Tick for Counter {
        fn tick(&mut self) -> EngineResult<()> {
            self.ticks += 1;
            if self.fail_every > 0 && self.ticks % self.fail_every == 0 {
                return Err(EngineError::Device("scripted failure".into()));
            }
            Ok(())
        }

        fn period(&self) -> Duration {
            Duration::from_millis(2)
        }

        fn name(&self) -> &'static str {
            "counter"
        }
    }

    #[test]
    fn test_task_ticks_until_stopped() {
        let engine = Arc::new(Mutex::new(Counter { ticks: 0, fail_every: 0 }));
        let mut task = PeriodicTask::spawn(engine.clone());
        assert_eq!(task.name(), "counter");

        thread::sleep(Duration::from_millis(50));
        assert!(task.is_running());
        task.stop();
        assert!(!task.is_running());

        let ticks = engine.lock().unwrap().ticks;
        assert!(ticks > 3, "only {} ticks", ticks);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(engine.lock().unwrap().ticks, ticks);
    }

    #[test]
    fn test_task_survives_tick_errors() {
        let engine = Arc::new(Mutex::new(Counter { ticks: 0, fail_every: 2 }));
        let task = PeriodicTask::spawn(engine.clone());
        thread::sleep(Duration::from_millis(50));
        drop(task);

        assert!(engine.lock().unwrap().ticks > 3);
    }
}
