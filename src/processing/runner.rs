//! One test pulse cycle: build or reuse a task, run it, derive the result, adjust bias,
//! publish.

use super::analysis::Analyzer;
use super::auto_bias::{AutoBiasController, BiasUpdate};
use super::result::{derive_result, TestPulseResult};
use super::task_builder::TaskBuilder;
use crate::error::{HardwareError, PulseError};
use crate::events::PulseSink;
use crate::hardware::{Amplifier, DeviceTask, TaskService};
use crate::params::{ClampMode, ParameterStore, ResolvedParameters};

use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

// -----------------------------------------------------------------------------
// CANCELLATION
// -----------------------------------------------------------------------------

/// Cooperative stop request shared between the scheduler thread and its owner.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Cancellation point: `Err(StopRequested)` once a stop has been requested.
    pub fn check(&self) -> Result<(), PulseError> {
        if self.is_requested() {
            Err(PulseError::StopRequested)
        } else {
            Ok(())
        }
    }
}

// -----------------------------------------------------------------------------
// CONFIG
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Completion polling granularity; also the cancellation latency while waiting.
    pub poll_interval: Duration,
    /// Allowed time beyond the protocol duration before a task counts as hung.
    pub task_timeout: Duration,
    /// Keep the last built task and reuse it while its key still matches.
    pub reuse_tasks: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            task_timeout: Duration::from_secs(10),
            reuse_tasks: true,
        }
    }
}

// -----------------------------------------------------------------------------
// TASK CACHE
// -----------------------------------------------------------------------------

/// Identity of a built task. The holding level is part of the key because it is baked
/// into the stimulus, and auto-bias moves it between cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskKey {
    pub version: u64,
    pub mode: ClampMode,
    holding_bits: u64,
}

impl TaskKey {
    pub fn new(version: u64, mode: ClampMode, holding: f64) -> Self {
        Self {
            version,
            mode,
            holding_bits: holding.to_bits(),
        }
    }

    pub fn holding(&self) -> f64 {
        f64::from_bits(self.holding_bits)
    }
}

struct CachedTask {
    key: TaskKey,
    task: Box<dyn DeviceTask>,
    resolved: ResolvedParameters,
}

/// Keeps the devices of a task reserved; releases them exactly once.
struct Reservation<'a> {
    task: &'a mut Box<dyn DeviceTask>,
    released: bool,
}

impl<'a> Reservation<'a> {
    fn reserve(task: &'a mut Box<dyn DeviceTask>) -> Result<Self, HardwareError> {
        task.reserve_devices()?;
        Ok(Self {
            task,
            released: false,
        })
    }

    fn task(&mut self) -> &mut dyn DeviceTask {
        &mut **self.task
    }

    fn task_ref(&self) -> &dyn DeviceTask {
        &**self.task
    }

    fn release(mut self) -> Result<(), HardwareError> {
        self.released = true;
        self.task.release_devices()
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.task.release_devices() {
                warn!("Failed to release test pulse devices: {}", e);
            }
        }
    }
}

// -----------------------------------------------------------------------------
// PULSE RUNNER
// -----------------------------------------------------------------------------

#[derive(Debug)]
pub enum CycleOutcome {
    Published(Box<TestPulseResult>),
    /// The amplifier changed mode while the task was being prepared; nothing published.
    ModeChanged { started: ClampMode, now: ClampMode },
}

pub struct PulseRunner {
    channel: String,
    amplifier: Arc<dyn Amplifier>,
    tasks: Arc<dyn TaskService>,
    analyzer: Arc<dyn Analyzer>,
    params: Arc<ParameterStore>,
    sink: Arc<dyn PulseSink>,
    builder: TaskBuilder,
    auto_bias: AutoBiasController,
    config: RunnerConfig,
    cache: Option<CachedTask>,
    tasks_built: u64,
}

impl PulseRunner {
    pub fn new(
        amplifier: Arc<dyn Amplifier>,
        tasks: Arc<dyn TaskService>,
        analyzer: Arc<dyn Analyzer>,
        params: Arc<ParameterStore>,
        sink: Arc<dyn PulseSink>,
    ) -> Self {
        let builder = TaskBuilder::for_amplifier(amplifier.as_ref());
        Self {
            channel: amplifier.name(),
            amplifier,
            tasks,
            analyzer,
            params,
            sink,
            builder,
            auto_bias: AutoBiasController::default(),
            config: RunnerConfig::default(),
            cache: None,
            tasks_built: 0,
        }
    }

    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_auto_bias(mut self, auto_bias: AutoBiasController) -> Self {
        self.auto_bias = auto_bias;
        self
    }

    /// Identity reported to the sink alongside each result.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn params(&self) -> &Arc<ParameterStore> {
        &self.params
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Number of tasks built so far; stays flat while the cached task is reused.
    pub fn tasks_built(&self) -> u64 {
        self.tasks_built
    }

    pub fn cached_key(&self) -> Option<TaskKey> {
        self.cache.as_ref().map(|c| c.key)
    }

    /// Run a single cycle. With `stop`, the completion wait is a cancellation point.
    pub fn run_once(&mut self, stop: Option<&StopFlag>) -> Result<CycleOutcome, PulseError> {
        let started_mode = self.amplifier.mode();
        let snapshot = self.params.snapshot();
        let run_mode = snapshot
            .params()
            .clamp_mode
            .unwrap_or(started_mode)
            .pulse_mode();
        let resolved = snapshot.resolve_for_mode(run_mode);
        // Read once: the key and the stimulus must agree on the level.
        let holding = TaskBuilder::holding_for(&resolved, self.amplifier.as_ref());
        let key = TaskKey::new(resolved.version, run_mode, holding);

        let mut entry = self.take_or_build(key, resolved)?;
        let outcome = self.execute(&mut entry, started_mode, stop)?;
        if self.config.reuse_tasks {
            self.cache = Some(entry);
        }

        if let CycleOutcome::Published(result) = &outcome {
            self.sink.pulse_finished(&self.channel, result);
        }
        Ok(outcome)
    }

    fn take_or_build(
        &mut self,
        key: TaskKey,
        resolved: ResolvedParameters,
    ) -> Result<CachedTask, PulseError> {
        match self.cache.take() {
            Some(cached) if cached.key == key => {
                debug!("Reusing test pulse task (version {}, {})", key.version, key.mode);
                Ok(cached)
            }
            _ => {
                let descriptor = self.builder.build(&resolved, key.holding())?;
                let task = self.tasks.create_task(descriptor)?;
                self.tasks_built += 1;
                debug!(
                    "Built test pulse task (version {}, {}, holding {:.3e})",
                    key.version,
                    key.mode,
                    key.holding()
                );
                Ok(CachedTask {
                    key,
                    task,
                    resolved,
                })
            }
        }
    }

    fn execute(
        &self,
        entry: &mut CachedTask,
        started_mode: ClampMode,
        stop: Option<&StopFlag>,
    ) -> Result<CycleOutcome, PulseError> {
        let resolved = &entry.resolved;
        let mut reservation = Reservation::reserve(&mut entry.task)?;

        let now = self.amplifier.mode();
        if now != started_mode {
            reservation.release()?;
            debug!(
                "Clamp mode changed from {} to {}; skipping test pulse",
                started_mode, now
            );
            return Ok(CycleOutcome::ModeChanged {
                started: started_mode,
                now,
            });
        }

        reservation.task().execute()?;
        self.wait_until_done(reservation.task_ref(), stop)?;
        let raw = reservation.task_ref().result()?;

        let result = if resolved.auto_bias.enabled {
            // Bias is updated while the devices are still ours.
            let result = derive_result(
                reservation.task_ref().descriptor(),
                &raw,
                resolved,
                self.analyzer.as_ref(),
            )?;
            let update = self
                .auto_bias
                .update(&result, &resolved.auto_bias, self.amplifier.as_ref())?;
            log_bias_update(&update);
            reservation.release()?;
            result
        } else {
            reservation.release()?;
            derive_result(
                entry.task.descriptor(),
                &raw,
                resolved,
                self.analyzer.as_ref(),
            )?
        };

        Ok(CycleOutcome::Published(Box::new(result)))
    }

    fn wait_until_done(
        &self,
        task: &dyn DeviceTask,
        stop: Option<&StopFlag>,
    ) -> Result<(), PulseError> {
        let protocol = Duration::try_from_secs_f64(task.descriptor().duration).unwrap_or_default();
        let limit = self.config.task_timeout + protocol;
        let deadline = Instant::now() + limit;
        while !task.is_done()? {
            if let Some(stop) = stop {
                stop.check()?;
            }
            if Instant::now() >= deadline {
                return Err(HardwareError::Timeout(limit).into());
            }
            thread::sleep(self.config.poll_interval);
        }
        Ok(())
    }
}

fn log_bias_update(update: &BiasUpdate) {
    match update {
        BiasUpdate::CarriedOver { ic_holding } => {
            debug!("Auto bias: IC holding seeded at {:.3e} A", ic_holding)
        }
        BiasUpdate::Adjusted { previous, holding } => {
            debug!("Auto bias: IC holding {:.3e} -> {:.3e} A", previous, holding)
        }
        BiasUpdate::Skipped(reason) => warn!("Auto bias skipped: {}", reason),
    }
}
