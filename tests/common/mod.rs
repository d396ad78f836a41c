#![allow(dead_code)]

use chrono::Utc;
use patch_testpulse::error::HardwareError;
use patch_testpulse::hardware::{Amplifier, DeviceTask, RawRecording, TaskDescriptor, TaskService};
use patch_testpulse::processing::signal::downsample;
use patch_testpulse::ClampMode;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Ordered record of hardware calls, shared by the mock amplifier and its tasks.
#[derive(Debug, Default)]
pub struct CallLog(Mutex<Vec<String>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }
}

pub struct MockAmplifier {
    mode: Mutex<ClampMode>,
    holdings: Mutex<(f64, f64)>,
    scripted_holdings: Mutex<VecDeque<f64>>,
    pub log: Arc<CallLog>,
}

impl MockAmplifier {
    pub fn new(mode: ClampMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            holdings: Mutex::new((-0.07, 0.0)),
            scripted_holdings: Mutex::new(VecDeque::new()),
            log: Arc::new(CallLog::default()),
        })
    }

    pub fn set_mode(&self, mode: ClampMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Holding reads return these values in order before falling back to the stored levels.
    pub fn script_holdings(&self, values: &[f64]) {
        self.scripted_holdings.lock().unwrap().extend(values.iter().copied());
    }
}

impl Amplifier for MockAmplifier {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn mode(&self) -> ClampMode {
        *self.mode.lock().unwrap()
    }

    fn holding(&self, mode: ClampMode) -> f64 {
        if let Some(value) = self.scripted_holdings.lock().unwrap().pop_front() {
            return value;
        }
        let (vc, ic) = *self.holdings.lock().unwrap();
        if mode.is_voltage_clamp() {
            vc
        } else {
            ic
        }
    }

    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<(), HardwareError> {
        let mut holdings = self.holdings.lock().unwrap();
        if mode.is_voltage_clamp() {
            holdings.0 = value;
        } else {
            holdings.1 = value;
        }
        self.log.push("set_holding");
        Ok(())
    }

    fn daq_name(&self, channel: &str) -> String {
        format!("daq/{}", channel)
    }
}

/// How mock tasks misbehave.
#[derive(Debug, Clone, Default)]
pub struct Behaviour {
    pub fail_create: bool,
    pub fail_execute: bool,
    pub never_done: bool,
    /// Switch the amplifier to this mode when devices are reserved.
    pub switch_mode_on_reserve: Option<ClampMode>,
}

/// Ideal cell: the primary signal is `baseline + (command - holding) * gain`.
#[derive(Debug, Clone, Copy)]
pub struct Response {
    pub baseline: f64,
    pub gain: f64,
}

pub struct MockTaskService {
    amplifier: Arc<MockAmplifier>,
    pub behaviour: Arc<Mutex<Behaviour>>,
    pub response: Arc<Mutex<Response>>,
    pub created: Arc<AtomicUsize>,
    pub descriptors: Arc<Mutex<Vec<TaskDescriptor>>>,
}

impl MockTaskService {
    pub fn new(amplifier: Arc<MockAmplifier>) -> Arc<Self> {
        Arc::new(Self {
            amplifier,
            behaviour: Arc::new(Mutex::new(Behaviour::default())),
            // 100 MOhm in voltage clamp, -20 pA at rest.
            response: Arc::new(Mutex::new(Response {
                baseline: -20e-12,
                gain: 1.0 / 100e6,
            })),
            created: Arc::new(AtomicUsize::new(0)),
            descriptors: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn set_response(&self, baseline: f64, gain: f64) {
        *self.response.lock().unwrap() = Response { baseline, gain };
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> &CallLog {
        &self.amplifier.log
    }
}

impl TaskService for MockTaskService {
    fn create_task(&self, descriptor: TaskDescriptor) -> Result<Box<dyn DeviceTask>, HardwareError> {
        if self.behaviour.lock().unwrap().fail_create {
            return Err(HardwareError::TaskCreation("injected".to_string()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.descriptors.lock().unwrap().push(descriptor.clone());
        Ok(Box::new(MockTask {
            descriptor,
            amplifier: Arc::clone(&self.amplifier),
            behaviour: Arc::clone(&self.behaviour),
            response: Arc::clone(&self.response),
            executed: false,
        }))
    }
}

pub struct MockTask {
    descriptor: TaskDescriptor,
    amplifier: Arc<MockAmplifier>,
    behaviour: Arc<Mutex<Behaviour>>,
    response: Arc<Mutex<Response>>,
    executed: bool,
}

impl DeviceTask for MockTask {
    fn descriptor(&self) -> &TaskDescriptor {
        &self.descriptor
    }

    fn reserve_devices(&mut self) -> Result<(), HardwareError> {
        self.amplifier.log.push("reserve");
        if let Some(mode) = self.behaviour.lock().unwrap().switch_mode_on_reserve {
            self.amplifier.set_mode(mode);
        }
        Ok(())
    }

    fn execute(&mut self) -> Result<(), HardwareError> {
        self.amplifier.log.push("execute");
        if self.behaviour.lock().unwrap().fail_execute {
            return Err(HardwareError::Execution("injected".to_string()));
        }
        self.executed = true;
        Ok(())
    }

    fn is_done(&self) -> Result<bool, HardwareError> {
        Ok(self.executed && !self.behaviour.lock().unwrap().never_done)
    }

    fn release_devices(&mut self) -> Result<(), HardwareError> {
        self.amplifier.log.push("release");
        Ok(())
    }

    fn result(&self) -> Result<RawRecording, HardwareError> {
        let desc = &self.descriptor;
        let Response { baseline, gain } = *self.response.lock().unwrap();
        let command = downsample(&desc.command, desc.downsample);
        let primary: Vec<f64> = command
            .iter()
            .map(|c| baseline + (c - desc.holding) * gain)
            .collect();
        let dt = desc.downsample as f64 / desc.sample_rate;
        let times = (0..primary.len()).map(|i| i as f64 * dt).collect();
        Ok(RawRecording {
            primary,
            command: Some(command),
            times,
            start_time: Utc::now(),
            units: HashMap::new(),
            state: HashMap::new(),
        })
    }
}
