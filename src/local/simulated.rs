use crate::error::HardwareError;
use crate::hardware::{
    Amplifier, DeviceTask, RawRecording, TaskDescriptor, TaskService, BRIDGE_BALANCE_ENABLE,
    BRIDGE_BALANCE_RESISTANCE,
};
use crate::params::ClampMode;
use crate::processing::signal::downsample;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

// -----------------------------------------------------------------------------
// CELL MODEL
// -----------------------------------------------------------------------------

/// Whole-cell patch: access resistance in series with a leaky membrane.
#[derive(Debug, Clone, Copy)]
pub struct CellModel {
    pub access_resistance: f64,
    pub membrane_resistance: f64,
    pub membrane_capacitance: f64,
    pub resting_potential: f64,
    /// Peak-to-peak amplitude of the uniform noise added to VC recordings (A).
    pub current_noise: f64,
    /// Peak-to-peak amplitude of the uniform noise added to IC recordings (V).
    pub voltage_noise: f64,
}

impl Default for CellModel {
    fn default() -> Self {
        Self {
            access_resistance: 10e6,
            membrane_resistance: 100e6,
            membrane_capacitance: 100e-12,
            resting_potential: -0.06,
            current_noise: 2e-12,
            voltage_noise: 0.2e-3,
        }
    }
}

impl CellModel {
    /// Membrane potential the cell settles at under `command`.
    fn steady_potential(&self, mode: ClampMode, command: f64) -> f64 {
        let (ra, rm) = (self.access_resistance, self.membrane_resistance);
        if mode.is_voltage_clamp() {
            (command * rm + self.resting_potential * ra) / (ra + rm)
        } else {
            self.resting_potential + command * rm
        }
    }

    /// Integrate the membrane over the command trace and return the measured signal at
    /// every raw sample: pipette current in VC, pipette voltage in IC.
    pub fn respond(
        &self,
        mode: ClampMode,
        command: &[f64],
        sample_rate: f64,
        bridge_balance: f64,
    ) -> Vec<f64> {
        let Some(&first) = command.first() else {
            return Vec::new();
        };
        let dt = 1.0 / sample_rate;
        let (ra, rm, cm) = (
            self.access_resistance,
            self.membrane_resistance,
            self.membrane_capacitance,
        );
        let mut vm = self.steady_potential(mode, first);

        command
            .iter()
            .map(|&cmd| {
                let leak = (vm - self.resting_potential) / rm;
                if mode.is_voltage_clamp() {
                    let current = (cmd - vm) / ra;
                    vm += dt * (current - leak) / cm;
                    current
                } else {
                    vm += dt * (cmd - leak) / cm;
                    vm + cmd * (ra - bridge_balance)
                }
            })
            .collect()
    }
}

// -----------------------------------------------------------------------------
// AMPLIFIER
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AmplifierState {
    mode: ClampMode,
    vc_holding: f64,
    ic_holding: f64,
    bridge_enabled: bool,
    bridge_resistance: f64,
}

/// Amplifier channel whose mode and holding levels live in memory.
#[derive(Debug)]
pub struct SimulatedAmplifier {
    name: String,
    state: Mutex<AmplifierState>,
}

impl SimulatedAmplifier {
    pub fn new(name: impl Into<String>, mode: ClampMode) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(AmplifierState {
                mode,
                vc_holding: -0.07,
                ic_holding: 0.0,
                bridge_enabled: false,
                bridge_resistance: 0.0,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, AmplifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Operator switch of the clamp mode.
    pub fn set_mode(&self, mode: ClampMode) {
        self.state().mode = mode;
    }

    pub fn set_bridge_balance(&self, enabled: bool, resistance: f64) {
        let mut state = self.state();
        state.bridge_enabled = enabled;
        state.bridge_resistance = resistance;
    }

    /// Compensation actually applied to IC recordings.
    pub fn bridge_balance(&self) -> f64 {
        let state = self.state();
        if state.bridge_enabled {
            state.bridge_resistance
        } else {
            0.0
        }
    }

    fn record_state(&self, names: &[String]) -> HashMap<String, f64> {
        let state = self.state();
        names
            .iter()
            .filter_map(|name| {
                let value = match name.as_str() {
                    BRIDGE_BALANCE_RESISTANCE => state.bridge_resistance,
                    BRIDGE_BALANCE_ENABLE => f64::from(u8::from(state.bridge_enabled)),
                    _ => return None,
                };
                Some((name.clone(), value))
            })
            .collect()
    }
}

impl Amplifier for SimulatedAmplifier {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn mode(&self) -> ClampMode {
        self.state().mode
    }

    fn holding(&self, mode: ClampMode) -> f64 {
        let state = self.state();
        if mode.is_voltage_clamp() {
            state.vc_holding
        } else {
            state.ic_holding
        }
    }

    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<(), HardwareError> {
        if !value.is_finite() {
            return Err(HardwareError::Amplifier(format!(
                "refusing non-finite {} holding {}",
                mode, value
            )));
        }
        let mut state = self.state();
        if mode.is_voltage_clamp() {
            state.vc_holding = value;
        } else {
            state.ic_holding = value;
        }
        Ok(())
    }

    fn daq_name(&self, channel: &str) -> String {
        format!("{}/{}", self.name, channel)
    }
}

// -----------------------------------------------------------------------------
// TASK SERVICE
// -----------------------------------------------------------------------------

/// Bookkeeping shared by every task a service creates.
#[derive(Debug, Default)]
pub struct TaskCounters {
    pub created: AtomicUsize,
    pub reserved: AtomicUsize,
    pub released: AtomicUsize,
    pub executed: AtomicUsize,
    devices_held: AtomicBool,
}

impl TaskCounters {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    pub fn devices_held(&self) -> bool {
        self.devices_held.load(Ordering::SeqCst)
    }
}

/// Task service backed by [`CellModel`]. Tasks take `duration * time_scale` of wall time.
pub struct SimulatedTaskService {
    amplifier: Arc<SimulatedAmplifier>,
    cell: CellModel,
    time_scale: f64,
    rng: Arc<Mutex<StdRng>>,
    counters: Arc<TaskCounters>,
}

impl SimulatedTaskService {
    pub fn new(amplifier: Arc<SimulatedAmplifier>, cell: CellModel) -> Self {
        Self {
            amplifier,
            cell,
            time_scale: 1.0,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
            counters: Arc::new(TaskCounters::default()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    /// 0 completes tasks immediately; 1 runs them in real time.
    pub fn with_time_scale(mut self, time_scale: f64) -> Self {
        self.time_scale = time_scale.max(0.0);
        self
    }

    pub fn counters(&self) -> Arc<TaskCounters> {
        Arc::clone(&self.counters)
    }
}

impl TaskService for SimulatedTaskService {
    fn create_task(&self, descriptor: TaskDescriptor) -> Result<Box<dyn DeviceTask>, HardwareError> {
        if descriptor.command.len() != descriptor.num_pts || descriptor.downsample == 0 {
            return Err(HardwareError::TaskCreation(format!(
                "command has {} samples for {} points",
                descriptor.command.len(),
                descriptor.num_pts
            )));
        }
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        let wall_time = Duration::try_from_secs_f64(descriptor.duration * self.time_scale)
            .unwrap_or_default();

        Ok(Box::new(SimulatedTask {
            descriptor,
            amplifier: Arc::clone(&self.amplifier),
            cell: self.cell,
            rng: Arc::clone(&self.rng),
            counters: Arc::clone(&self.counters),
            wall_time,
            reserved: false,
            started: None,
            recording: None,
        }))
    }
}

pub struct SimulatedTask {
    descriptor: TaskDescriptor,
    amplifier: Arc<SimulatedAmplifier>,
    cell: CellModel,
    rng: Arc<Mutex<StdRng>>,
    counters: Arc<TaskCounters>,
    wall_time: Duration,
    reserved: bool,
    started: Option<Instant>,
    recording: Option<RawRecording>,
}

impl SimulatedTask {
    fn acquire(&self) -> RawRecording {
        let desc = &self.descriptor;
        let mode = desc.mode;
        let bridge = if mode.is_voltage_clamp() {
            0.0
        } else {
            self.amplifier.bridge_balance()
        };

        let mut signal = self
            .cell
            .respond(mode, &desc.command, desc.sample_rate, bridge);
        let noise = if mode.is_voltage_clamp() {
            self.cell.current_noise
        } else {
            self.cell.voltage_noise
        };
        if noise > 0.0 {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            for sample in &mut signal {
                *sample += rng.gen_range(-0.5..0.5) * noise;
            }
        }

        let primary = downsample(&signal, desc.downsample);
        let dt = desc.downsample as f64 / desc.sample_rate;
        let times = (0..primary.len()).map(|i| i as f64 * dt).collect();
        let units = HashMap::from([
            ("primary".to_string(), mode.primary_units().to_string()),
            ("command".to_string(), mode.command_units().to_string()),
        ]);

        RawRecording {
            primary,
            command: Some(downsample(&desc.command, desc.downsample)),
            times,
            start_time: Utc::now(),
            units,
            state: self.amplifier.record_state(&desc.record_state),
        }
    }
}

impl DeviceTask for SimulatedTask {
    fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    fn reserve_devices(&mut self) -> Result<(), HardwareError> {
        if self.reserved || self.counters.devices_held.swap(true, Ordering::SeqCst) {
            return Err(HardwareError::Reservation(format!(
                "{} is already reserved",
                self.descriptor.clamp_device
            )));
        }
        self.reserved = true;
        self.counters.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn execute(&mut self) -> Result<(), HardwareError> {
        if !self.reserved {
            return Err(HardwareError::Execution(
                "devices must be reserved before execution".to_string(),
            ));
        }
        self.recording = Some(self.acquire());
        self.started = Some(Instant::now());
        self.counters.executed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_done(&self) -> Result<bool, HardwareError> {
        match self.started {
            Some(started) => Ok(started.elapsed() >= self.wall_time),
            None => Err(HardwareError::Execution("task was never started".to_string())),
        }
    }

    fn release_devices(&mut self) -> Result<(), HardwareError> {
        if !self.reserved {
            return Err(HardwareError::Reservation(
                "release without reservation".to_string(),
            ));
        }
        self.reserved = false;
        self.counters.devices_held.store(false, Ordering::SeqCst);
        self.counters.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn result(&self) -> Result<RawRecording, HardwareError> {
        if !self.is_done()? {
            return Err(HardwareError::Recording("task still running".to_string()));
        }
        self.recording
            .clone()
            .ok_or_else(|| HardwareError::Recording("no data acquired".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ParameterSet, ParamValue};
    use crate::processing::task_builder::TaskBuilder;

    fn quiet_cell() -> CellModel {
        CellModel {
            current_noise: 0.0,
            voltage_noise: 0.0,
            ..CellModel::default()
        }
    }

    #[test]
    fn voltage_clamp_settles_at_series_current() {
        let cell = quiet_cell();
        let command = vec![-0.07; 200];
        let current = cell.respond(ClampMode::VoltageClamp, &command, 500_000.0, 0.0);
        let expected = (-0.07 - cell.resting_potential) / 110e6;
        assert!((current[199] - expected).abs() < 1e-15);
    }

    #[test]
    fn current_clamp_step_charges_membrane() {
        let cell = quiet_cell();
        let mut command = vec![0.0; 50_000];
        for c in &mut command[10_000..] {
            *c = -10e-12;
        }
        let voltage = cell.respond(ClampMode::CurrentClamp, &command, 500_000.0, 0.0);
        assert!((voltage[0] - cell.resting_potential).abs() < 1e-12);
        // 80 ms is eight membrane time constants.
        let settled = cell.resting_potential - 10e-12 * (100e6 + 10e6);
        assert!((voltage[49_999] - settled).abs() < 1e-5);
    }

    #[test]
    fn second_reservation_is_refused_until_release() {
        let amp = Arc::new(SimulatedAmplifier::new("amp0", ClampMode::VoltageClamp));
        let service = SimulatedTaskService::new(Arc::clone(&amp), quiet_cell()).with_time_scale(0.0);
        let resolved = ParameterSet::default().resolve_for_mode(ClampMode::VoltageClamp);
        let desc = TaskBuilder::for_amplifier(amp.as_ref())
            .build(&resolved, TaskBuilder::holding_for(&resolved, amp.as_ref()))
            .unwrap();

        let mut first = service.create_task(desc.clone()).unwrap();
        let mut second = service.create_task(desc).unwrap();
        first.reserve_devices().unwrap();
        assert!(second.reserve_devices().is_err());
        first.release_devices().unwrap();
        second.reserve_devices().unwrap();
        second.release_devices().unwrap();

        let counters = service.counters();
        assert_eq!(counters.created(), 2);
        assert_eq!(counters.reserved(), 2);
        assert_eq!(counters.released(), 2);
        assert!(!counters.devices_held());
    }

    #[test]
    fn recording_is_downsampled_and_carries_bridge_state() {
        let amp = Arc::new(SimulatedAmplifier::new("amp0", ClampMode::CurrentClamp));
        amp.set_bridge_balance(true, 8e6);
        let service = SimulatedTaskService::new(Arc::clone(&amp), CellModel::default())
            .with_seed(7)
            .with_time_scale(0.0);
        let resolved = ParameterSet::default()
            .with_updates([("ic_average", ParamValue::from(1usize))])
            .unwrap()
            .resolve_for_mode(ClampMode::CurrentClamp);
        let desc = TaskBuilder::for_amplifier(amp.as_ref())
            .build(&resolved, TaskBuilder::holding_for(&resolved, amp.as_ref()))
            .unwrap();
        let expected_len = desc.num_pts / desc.downsample;

        let mut task = service.create_task(desc).unwrap();
        task.reserve_devices().unwrap();
        task.execute().unwrap();
        assert!(task.is_done().unwrap());
        let raw = task.result().unwrap();
        task.release_devices().unwrap();

        assert_eq!(raw.primary.len(), expected_len);
        assert_eq!(raw.times.len(), expected_len);
        assert_eq!(raw.bridge_balance(), 8e6);
        assert_eq!(raw.units["primary"], "V");
    }
}
