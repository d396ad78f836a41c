//! Background thread that paces test pulse cycles.

use super::runner::{CycleOutcome, PulseRunner, StopFlag};
use crate::error::{ParameterError, PulseError};
use crate::params::{ParamValue, ParameterSet, ParameterStore};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest single sleep while waiting for the next interval.
    pub sleep_slice: Duration,
    /// Back-off after a failed cycle.
    pub error_cooldown: Duration,
    /// Bound on a blocking `stop`.
    pub stop_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sleep_slice: Duration::from_millis(30),
            error_cooldown: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    // Disconnects when the thread exits.
    exited: Receiver<()>,
}

/// Owns the pulse thread lifecycle: IDLE -> RUNNING -> STOPPING -> IDLE.
pub struct TestPulseScheduler {
    runner: Arc<Mutex<PulseRunner>>,
    params: Arc<ParameterStore>,
    stop: StopFlag,
    config: SchedulerConfig,
    worker: Option<Worker>,
}

impl TestPulseScheduler {
    pub fn new(runner: PulseRunner) -> Self {
        Self::with_config(runner, SchedulerConfig::default())
    }

    pub fn with_config(runner: PulseRunner, config: SchedulerConfig) -> Self {
        let params = runner.params().clone();
        Self {
            runner: Arc::new(Mutex::new(runner)),
            params,
            stop: StopFlag::new(),
            config,
            worker: None,
        }
    }

    // CONTROL SURFACE -----------------------------------------------------------

    pub fn set_parameters<I, K>(&self, updates: I) -> Result<Arc<ParameterSet>, ParameterError>
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: AsRef<str>,
    {
        self.params.set_parameters(updates)
    }

    pub fn get_parameter(&self, name: &str) -> Result<ParamValue, ParameterError> {
        self.params.get_parameter(name)
    }

    pub fn params(&self) -> &Arc<ParameterStore> {
        &self.params
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .map_or(false, |w| !w.handle.is_finished())
    }

    /// Run one cycle on the caller's thread. Blocks while the pulse thread holds the runner.
    pub fn run_once(&self) -> Result<CycleOutcome, PulseError> {
        lock_runner(&self.runner)?.run_once(None)
    }

    pub fn start(&mut self) -> Result<(), PulseError> {
        if self.is_running() {
            if !self.stop.is_requested() {
                debug!("Test pulse thread already running");
                return Ok(());
            }
            // A non-blocking stop is still winding down.
            self.wait_for_exit()?;
        }
        // Not running: either there is no worker or it has exited.
        self.reap();

        self.stop.clear();
        let (exit_tx, exited) = bounded::<()>(1);
        let runner = Arc::clone(&self.runner);
        let params = Arc::clone(&self.params);
        let stop = self.stop.clone();
        let config = self.config.clone();

        let name = match lock_runner(&self.runner) {
            Ok(runner) => format!("TestPulseThread({})", runner.channel()),
            Err(_) => "TestPulseThread".to_string(),
        };
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let _exit_tx = exit_tx;
                run_loop(&runner, &params, &stop, &config);
            })
            .map_err(PulseError::Spawn)?;

        info!("Test pulse thread started");
        self.worker = Some(Worker { handle, exited });
        Ok(())
    }

    /// Request the loop to stop. With `block`, wait up to the stop timeout for it to exit.
    pub fn stop(&mut self, block: bool) -> Result<(), PulseError> {
        self.stop.request();
        if block {
            self.wait_for_exit()?;
            self.reap();
        }
        Ok(())
    }

    fn wait_for_exit(&self) -> Result<(), PulseError> {
        let Some(worker) = &self.worker else {
            return Ok(());
        };
        match worker.exited.recv_timeout(self.config.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => Ok(()),
            Err(RecvTimeoutError::Timeout) => {
                Err(PulseError::ShutdownTimeout(self.config.stop_timeout))
            }
        }
    }

    /// Join a worker that has already signalled exit (or finished).
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.handle.join().is_err() {
                warn!("Test pulse thread panicked");
            }
            info!("Test pulse thread stopped");
        }
    }
}

impl Drop for TestPulseScheduler {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(e) = self.stop(true) {
                warn!("{}", e);
            }
        }
    }
}

fn lock_runner(runner: &Mutex<PulseRunner>) -> Result<MutexGuard<'_, PulseRunner>, PulseError> {
    runner.lock().map_err(|_| PulseError::Poisoned)
}

// -----------------------------------------------------------------------------
// LOOP
// -----------------------------------------------------------------------------

fn run_loop(
    runner: &Mutex<PulseRunner>,
    params: &ParameterStore,
    stop: &StopFlag,
    config: &SchedulerConfig,
) {
    loop {
        match cycle(runner, params, stop, config) {
            Ok(()) => {}
            Err(PulseError::StopRequested) => break,
            Err(e) => {
                warn!("Error in test pulse thread (will try again): {}", e);
                if sleep_until(Instant::now() + config.error_cooldown, stop, config).is_err() {
                    break;
                }
            }
        }
    }
    debug!("Test pulse loop exited");
}

fn cycle(
    runner: &Mutex<PulseRunner>,
    params: &ParameterStore,
    stop: &StopFlag,
    config: &SchedulerConfig,
) -> Result<(), PulseError> {
    stop.check()?;
    let start = Instant::now();
    {
        // Catch inside the guard's scope so a panicking cycle does not poison the runner.
        let mut guard = lock_runner(runner)?;
        panic::catch_unwind(AssertUnwindSafe(|| guard.run_once(Some(stop))))
            .map_err(|payload| PulseError::Panicked(panic_message(payload.as_ref())))??;
    }

    let next_run = params
        .snapshot()
        .params()
        .interval
        .and_then(|interval| Duration::try_from_secs_f64(interval).ok())
        .and_then(|interval| start.checked_add(interval));
    match next_run {
        None => Ok(()),
        Some(deadline) => sleep_until(deadline, stop, config),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sleep in bounded slices, rechecking the stop flag between them.
fn sleep_until(deadline: Instant, stop: &StopFlag, config: &SchedulerConfig) -> Result<(), PulseError> {
    loop {
        stop.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(config.sleep_slice.min(deadline - now));
    }
}
