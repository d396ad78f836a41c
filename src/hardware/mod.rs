//! Interfaces to the amplifier and to the acquisition task service.
//!
//! The engine never talks to a driver directly. It builds a [`TaskDescriptor`], asks a
//! [`TaskService`] for a [`DeviceTask`], and reads back a [`RawRecording`].

use crate::error::HardwareError;
use crate::params::ClampMode;

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Amplifier state fields captured with every test pulse.
pub const BRIDGE_BALANCE_RESISTANCE: &str = "BridgeBalResist";
pub const BRIDGE_BALANCE_ENABLE: &str = "BridgeBalEnable";

// AMPLIFIER ---------------------------------------------------------------------

/// A patch clamp amplifier channel. Shared between the pulse thread and manual control.
pub trait Amplifier: Send + Sync {
    fn name(&self) -> String;

    fn mode(&self) -> ClampMode;

    fn holding(&self, mode: ClampMode) -> f64;

    fn set_holding(&self, mode: ClampMode, value: f64) -> Result<(), HardwareError>;

    /// Name of the DAQ device wired to `channel` ("primary", "command").
    fn daq_name(&self, channel: &str) -> String;
}

// TASKS -------------------------------------------------------------------------

/// Everything the task service needs to run one stimulus/acquisition protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescriptor {
    pub clamp_device: String,
    pub daq_device: String,
    pub mode: ClampMode,
    /// Stimulus for all repetitions, at the raw sample rate.
    pub command: Vec<f64>,
    pub sample_rate: f64,
    /// Total raw points across all repetitions.
    pub num_pts: usize,
    /// Raw points in a single repetition.
    pub points_per_pulse: usize,
    pub downsample: usize,
    pub holding: f64,
    /// Protocol duration in seconds, all repetitions included.
    pub duration: f64,
    pub record_state: Vec<String>,
}

/// Opaque handle to a unit of hardware work.
pub trait DeviceTask: Send {
    fn descriptor(&self) -> &TaskDescriptor;

    fn reserve_devices(&mut self) -> Result<(), HardwareError>;

    fn execute(&mut self) -> Result<(), HardwareError>;

    fn is_done(&self) -> Result<bool, HardwareError>;

    fn release_devices(&mut self) -> Result<(), HardwareError>;

    /// Only valid once `is_done` has returned true.
    fn result(&self) -> Result<RawRecording, HardwareError>;
}

pub trait TaskService: Send + Sync {
    fn create_task(&self, descriptor: TaskDescriptor) -> Result<Box<dyn DeviceTask>, HardwareError>;
}

// RECORDINGS --------------------------------------------------------------------

/// Raw result of one task: downsampled channel data plus the captured amplifier state.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecording {
    /// Measured current (VC) or voltage (IC), after DAQ downsampling.
    pub primary: Vec<f64>,
    /// Echo of the stimulus, when the service records it.
    pub command: Option<Vec<f64>>,
    /// Time axis of `primary`, starting at zero.
    pub times: Vec<f64>,
    pub start_time: DateTime<Utc>,
    pub units: HashMap<String, String>,
    pub state: HashMap<String, f64>,
}

impl RawRecording {
    /// Bridge balance compensation in ohms. Zero unless the amplifier had it enabled.
    pub fn bridge_balance(&self) -> f64 {
        let enabled = self
            .state
            .get(BRIDGE_BALANCE_ENABLE)
            .map_or(false, |&v| v != 0.0);
        if enabled {
            self.state
                .get(BRIDGE_BALANCE_RESISTANCE)
                .copied()
                .unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_with_state(state: &[(&str, f64)]) -> RawRecording {
        RawRecording {
            primary: Vec::new(),
            command: None,
            times: Vec::new(),
            start_time: Utc::now(),
            units: HashMap::new(),
            state: state.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    #[test]
    fn bridge_balance_requires_enable_flag() {
        let off = recording_with_state(&[(BRIDGE_BALANCE_RESISTANCE, 12e6)]);
        assert_eq!(off.bridge_balance(), 0.0);

        let on = recording_with_state(&[
            (BRIDGE_BALANCE_RESISTANCE, 12e6),
            (BRIDGE_BALANCE_ENABLE, 1.0),
        ]);
        assert_eq!(on.bridge_balance(), 12e6);
    }
}
