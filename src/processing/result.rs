//! Test pulse results, derived once per cycle from a completed recording.

use super::analysis::Analyzer;
use super::signal::{downsample, mean_of_repetitions};
use crate::error::PulseError;
use crate::hardware::{RawRecording, TaskDescriptor};
use crate::params::{ClampMode, ResolvedParameters};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One channel of a recording with its own time axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TSeries {
    pub channel_id: String,
    pub data: Vec<f64>,
    pub time_values: Vec<f64>,
    pub units: String,
    pub start_time: DateTime<Utc>,
}

impl TSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn sample_period(&self) -> Option<f64> {
        match self.time_values.as_slice() {
            [t0, t1, ..] => Some(t1 - t0),
            _ => None,
        }
    }
}

/// Averaged, baseline-corrected traces of one test pulse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchClampRecording {
    pub device_id: String,
    pub clamp_mode: ClampMode,
    pub start_time: DateTime<Utc>,
    pub primary: TSeries,
    /// Stimulus with the holding level subtracted.
    pub command: TSeries,
    /// Holding potential (VC) or holding current (IC).
    pub holding: f64,
    /// Bridge balance compensation in ohms; current clamp only.
    pub bridge_balance: Option<f64>,
}

/// Electrical parameters reported by the analysis collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PulseAnalysis {
    pub baseline_potential: f64,
    pub baseline_current: f64,
    pub steady_state_resistance: f64,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestPulseResult {
    pub recording: PatchClampRecording,
    pub analysis: PulseAnalysis,
}

impl TestPulseResult {
    pub fn clamp_mode(&self) -> ClampMode {
        self.recording.clamp_mode
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.recording.start_time
    }
}

/// Average the repetitions, rebuild the command trace and run the analysis.
///
/// `resolved` must be the parameter set the task was built from.
pub fn derive_result(
    task: &TaskDescriptor,
    raw: &RawRecording,
    resolved: &ResolvedParameters,
    analyzer: &dyn Analyzer,
) -> Result<TestPulseResult, PulseError> {
    let mode = task.mode;
    let average = resolved.shape.average.max(1);
    let pulse_len = raw.primary.len() / average;
    if pulse_len == 0 {
        return Err(PulseError::Recording(format!(
            "{} primary samples cannot hold {} repetitions",
            raw.primary.len(),
            average
        )));
    }

    let times: Vec<f64> = if raw.times.len() >= pulse_len {
        raw.times[..pulse_len].to_vec()
    } else {
        let dt = task.downsample as f64 / task.sample_rate;
        (0..pulse_len).map(|i| i as f64 * dt).collect()
    };

    let primary = TSeries {
        channel_id: "primary".to_string(),
        data: mean_of_repetitions(&raw.primary, average),
        time_values: times.clone(),
        units: mode.primary_units().to_string(),
        start_time: raw.start_time,
    };

    let ds = task.downsample.max(1);
    let cmd_end = (pulse_len * ds).min(task.command.len());
    let mut command = downsample(&task.command[..cmd_end], ds);
    command.truncate(pulse_len);
    if command.len() < pulse_len {
        return Err(PulseError::Recording(format!(
            "command trace has {} samples, primary has {}",
            command.len(),
            pulse_len
        )));
    }

    // Analysis adds the holding level back itself.
    let holding = resolved.holding.unwrap_or(command[0]);
    for sample in &mut command {
        *sample -= holding;
    }

    let command = TSeries {
        channel_id: "command".to_string(),
        data: command,
        time_values: times,
        units: mode.command_units().to_string(),
        start_time: raw.start_time,
    };

    let bridge_balance = if mode.is_voltage_clamp() {
        None
    } else {
        Some(raw.bridge_balance())
    };

    let recording = PatchClampRecording {
        device_id: task.clamp_device.clone(),
        clamp_mode: mode,
        start_time: raw.start_time,
        primary,
        command,
        holding,
        bridge_balance,
    };

    let analysis = analyzer.analyze(&recording)?;
    let result = TestPulseResult {
        recording,
        analysis,
    };

    Ok(match &resolved.post_processing {
        Some(hook) => hook.apply(result),
        None => result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AnalysisError;
    use crate::hardware::{BRIDGE_BALANCE_ENABLE, BRIDGE_BALANCE_RESISTANCE};
    use crate::params::{ParameterSet, ParamValue, PostProcessor};
    use std::collections::HashMap;

    struct NullAnalyzer;

    impl Analyzer for NullAnalyzer {
        fn analyze(&self, _rec: &PatchClampRecording) -> Result<PulseAnalysis, AnalysisError> {
            Ok(PulseAnalysis::default())
        }
    }

    fn descriptor(mode: ClampMode, command: Vec<f64>, downsample: usize) -> TaskDescriptor {
        TaskDescriptor {
            clamp_device: "Clamp1".to_string(),
            daq_device: "DAQ".to_string(),
            mode,
            num_pts: command.len(),
            points_per_pulse: command.len(),
            command,
            sample_rate: 1000.0,
            downsample,
            holding: 0.0,
            duration: 0.0,
            record_state: Vec::new(),
        }
    }

    fn raw(primary: Vec<f64>, state: &[(&str, f64)]) -> RawRecording {
        RawRecording {
            times: (0..primary.len()).map(|i| i as f64 * 1e-3).collect(),
            primary,
            command: None,
            start_time: Utc::now(),
            units: HashMap::new(),
            state: state.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn resolved(mode: ClampMode, updates: Vec<(&str, ParamValue)>) -> ResolvedParameters {
        ParameterSet::default()
            .with_updates(updates)
            .unwrap()
            .resolve_for_mode(mode)
    }

    #[test]
    fn primary_is_mean_of_repetitions() {
        // average = 4, pulse_len = 3
        let primary = vec![
            1.0, 2.0, 3.0, //
            3.0, 4.0, 5.0, //
            5.0, 6.0, 7.0, //
            7.0, 8.0, 9.0,
        ];
        let params = resolved(ClampMode::VoltageClamp, vec![("downsample", 1usize.into())]);
        let task = descriptor(ClampMode::VoltageClamp, vec![0.0; 12], 1);

        let result = derive_result(&task, &raw(primary, &[]), &params, &NullAnalyzer).unwrap();

        assert_eq!(result.recording.primary.data, vec![4.0, 5.0, 6.0]);
        assert_eq!(result.recording.primary.time_values, vec![0.0, 1e-3, 2e-3]);
        assert_eq!(result.recording.primary.units, "A");
        assert_eq!(result.recording.command.units, "V");
    }

    #[test]
    fn constant_command_at_holding_becomes_zero() {
        let params = resolved(
            ClampMode::VoltageClamp,
            vec![("holding", ParamValue::from(5.0)), ("downsample", 2usize.into())],
        );
        let task = descriptor(ClampMode::VoltageClamp, vec![5.0; 16], 2);

        let result = derive_result(&task, &raw(vec![0.0; 8], &[]), &params, &NullAnalyzer).unwrap();

        assert_eq!(result.recording.command.data, vec![0.0, 0.0]);
        assert_eq!(result.recording.holding, 5.0);
    }

    #[test]
    fn holding_defaults_to_first_command_sample() {
        let params = resolved(ClampMode::CurrentClamp, vec![("downsample", 1usize.into())]);
        let mut command = vec![-20e-12; 8];
        command[1] = -30e-12;
        let task = descriptor(ClampMode::CurrentClamp, command, 1);
        let state = [(BRIDGE_BALANCE_RESISTANCE, 10e6), (BRIDGE_BALANCE_ENABLE, 1.0)];

        let result =
            derive_result(&task, &raw(vec![-0.06; 8], &state), &params, &NullAnalyzer).unwrap();

        assert_eq!(result.recording.holding, -20e-12);
        assert_eq!(result.recording.command.data[0], 0.0);
        assert!((result.recording.command.data[1] + 10e-12).abs() < 1e-24);
        assert_eq!(result.recording.bridge_balance, Some(10e6));
        assert_eq!(result.recording.primary.units, "V");
    }

    #[test]
    fn post_processing_hook_replaces_result() {
        let hook = PostProcessor::new(|mut r: TestPulseResult| {
            r.analysis.extra.insert("seen".to_string(), 1.0);
            r
        });
        let params = resolved(
            ClampMode::VoltageClamp,
            vec![("downsample", 1usize.into()), ("post_processing", hook.into())],
        );
        let task = descriptor(ClampMode::VoltageClamp, vec![0.0; 8], 1);

        let result = derive_result(&task, &raw(vec![0.0; 8], &[]), &params, &NullAnalyzer).unwrap();
        assert_eq!(result.analysis.extra.get("seen"), Some(&1.0));
    }

    #[test]
    fn too_few_samples_is_an_error() {
        let params = resolved(ClampMode::VoltageClamp, vec![]);
        let task = descriptor(ClampMode::VoltageClamp, vec![0.0; 8], 20);
        let err = derive_result(&task, &raw(vec![0.0; 3], &[]), &params, &NullAnalyzer);
        assert!(matches!(err, Err(PulseError::Recording(_))));
    }
}
