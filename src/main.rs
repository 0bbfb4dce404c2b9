use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cavitylock::config::SystemConfig;
use cavitylock::devices::Devices;
use cavitylock::events::{EngineEvent, EventBus};
use cavitylock::lock::{LockEngine, LockParameter};
use cavitylock::scan::{ScanEngine, ScanParameter, ScanState};
use cavitylock::scheduler::PeriodicTask;
use cavitylock::sim::{CavityModel, SimulatedCavity};

const STATUS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about = "PDH cavity lock engine driving a simulated cavity", long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop after this many seconds (runs until Ctrl+C otherwise)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Run a voltage scan before locking
    #[arg(long, default_value_t = false)]
    scan: bool,

    /// Do not engage the lock
    #[arg(long, default_value_t = false)]
    no_lock: bool,

    /// Lock parameter override, e.g. `--lock p=2.5 --lock phase=90`
    #[arg(long = "lock", value_name = "KEY=VALUE")]
    lock_params: Vec<String>,

    /// Scan parameter override, e.g. `--scan-param steps=200`
    #[arg(long = "scan-param", value_name = "KEY=VALUE")]
    scan_params: Vec<String>,

    /// Write the effective configuration to this file and exit
    #[arg(long, value_name = "FILE")]
    write_config: Option<PathBuf>,

    /// Initial actuator voltage of the simulated cavity
    #[arg(long, default_value_t = 4.5)]
    start_voltage: f64,
}

fn effective_config(args: &Args) -> Result<SystemConfig> {
    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };

    // Route overrides through the engines' validation on a throwaway binding
    let cavity = SimulatedCavity::new(CavityModel::default());
    let (daq, piezo) = cavity.split();
    let devices = Devices::new(daq, piezo).shared();
    let mut lock = LockEngine::new(devices.clone(), &config, EventBus::new());
    let mut scan = ScanEngine::new(devices, &config, EventBus::new());

    for raw in &args.lock_params {
        let param: LockParameter = raw.parse()?;
        lock.apply(param)?;
    }
    for raw in &args.scan_params {
        let param: ScanParameter = raw.parse()?;
        scan.apply(param)?;
    }

    config.lock = lock.settings();
    config.scan = scan.settings();
    Ok(config)
}

fn spawn_event_logger(bus: &EventBus, running: Arc<AtomicBool>) -> thread::JoinHandle<()> {
    let rx = bus.subscribe();
    thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(EngineEvent::LockStateChanged(state)) => info!("[event] lock state {}", state),
                Ok(EngineEvent::CompensationStateChanged(on)) => {
                    info!("[event] offset compensation {}", if on { "on" } else { "off" })
                }
                Ok(EngineEvent::ScanRunningChanged(on)) => {
                    info!("[event] scan {}", if on { "running" } else { "idle" })
                }
                Ok(EngineEvent::ScanPassAcquired { pass }) => debug!("[event] scan pass {}", pass),
                Ok(EngineEvent::LockSampleRecorded(_)) => {}
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}

fn log_scan_summary(state: &ScanState) {
    let recorded = state.error.iter().take_while(|e| !e.is_nan()).count();
    let crossing = state
        .error
        .windows(2)
        .position(|w| w[0] > 0.0 && w[1] <= 0.0)
        .map(|i| state.voltages[i + 1]);

    match crossing {
        Some(v) => info!("Scan: {} steps, error crosses zero near {:.4}V", recorded, v),
        None => warn!("Scan: {} steps, no resonance found in range", recorded),
    }
}

fn main() -> Result<()> {
    env_logger::builder()
        .format_timestamp_millis()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Args::parse();
    let config = effective_config(&args)?;

    if let Some(path) = &args.write_config {
        config.save(path)?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let cavity = SimulatedCavity::new(CavityModel {
        piezo_v: args.start_voltage,
        ..Default::default()
    });
    let (daq, piezo) = cavity.split();
    let devices = Devices::new(daq, piezo).shared();
    let bus = EventBus::new();
    let logger = spawn_event_logger(&bus, running.clone());

    let lock = LockEngine::new(devices.clone(), &config, bus.clone());
    let mut scan = ScanEngine::new(devices, &config, bus);
    scan.follow_reference(lock.reference_shared());
    let lock = Arc::new(Mutex::new(lock));
    let scan = Arc::new(Mutex::new(scan));
    let deadline = args.duration.map(|s| Instant::now() + Duration::from_secs(s));
    let expired = || deadline.map(|d| Instant::now() >= d).unwrap_or(false);

    if args.scan {
        scan.lock().map_err(|_| anyhow!("scan engine poisoned"))?.start()?;
        let mut task = PeriodicTask::spawn(scan.clone());

        while running.load(Ordering::SeqCst) && !expired() {
            let busy = scan.lock().map(|s| s.is_running()).unwrap_or(false);
            if !busy {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }

        let mut engine = scan.lock().map_err(|_| anyhow!("scan engine poisoned"))?;
        if engine.is_running() {
            // Toggle stops the unfinished sweep
            engine.start()?;
        }
        log_scan_summary(&engine.snapshot());
        drop(engine);
        task.stop();
    }

    if !args.no_lock && running.load(Ordering::SeqCst) && !expired() {
        let status = {
            let mut engine = lock.lock().map_err(|_| anyhow!("lock engine poisoned"))?;
            engine.start()?;
            engine.status_shared()
        };
        let mut task = PeriodicTask::spawn(lock.clone());
        let mut last_log = Instant::now();

        while running.load(Ordering::SeqCst) && !expired() {
            if last_log.elapsed() >= STATUS_INTERVAL {
                match status.read() {
                    Ok(s) => info!(
                        "Lock {} | Err {:+.4} (mean {:+.4}, std {:.4}) | Fast {:+.4}V | Piezo {:.4}V{}",
                        s.state,
                        s.last_error,
                        s.error_mean,
                        s.error_std,
                        s.daq_voltage,
                        s.actuator_voltage,
                        if s.compensating { " | compensating" } else { "" }
                    ),
                    Err(_) => error!("Lock status unavailable"),
                }
                last_log = Instant::now();
            }
            thread::sleep(Duration::from_millis(50));
        }

        task.stop();
        lock.lock().map_err(|_| anyhow!("lock engine poisoned"))?.stop()?;
    }

    running.store(false, Ordering::SeqCst);
    if logger.join().is_err() {
        warn!("Event logger panicked");
    }

    info!("Exiting.");
    Ok(())
}
