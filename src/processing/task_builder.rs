use crate::error::ParameterError;
use crate::hardware::{
    Amplifier, TaskDescriptor, BRIDGE_BALANCE_ENABLE, BRIDGE_BALANCE_RESISTANCE,
};
use crate::params::ResolvedParameters;

// Upper bound on raw points per task (all repetitions).
pub const MAX_TASK_POINTS: usize = 1 << 26;

// Absorbs float noise in duration * rate products (0.02 * 5e5 must give 10000, not 9999).
const SAMPLE_EPSILON: f64 = 1e-6;

fn samples(duration: f64, sample_rate: f64) -> usize {
    (duration * sample_rate + SAMPLE_EPSILON).floor() as usize
}

/// Raw points per repetition: floor(duration * rate * downsample) / downsample, rounded
/// down to a whole number of downsampled samples.
pub fn points_per_pulse(duration: f64, sample_rate: f64, downsample: usize) -> usize {
    let downsample = downsample.max(1);
    let raw = (duration * sample_rate * downsample as f64 + SAMPLE_EPSILON).floor() as usize
        / downsample;
    raw - raw % downsample
}

/// Turns resolved parameters into a task descriptor. Performs no I/O.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    clamp_name: String,
    daq_name: String,
}

impl TaskBuilder {
    pub fn new(clamp_name: impl Into<String>, daq_name: impl Into<String>) -> Self {
        Self {
            clamp_name: clamp_name.into(),
            daq_name: daq_name.into(),
        }
    }

    pub fn for_amplifier(amplifier: &dyn Amplifier) -> Self {
        Self::new(amplifier.name(), amplifier.daq_name("primary"))
    }

    pub fn clamp_name(&self) -> &str {
        &self.clamp_name
    }

    /// Holding level for the pulse: the explicit override, else the amplifier's.
    pub fn holding_for(resolved: &ResolvedParameters, amplifier: &dyn Amplifier) -> f64 {
        resolved
            .holding
            .unwrap_or_else(|| amplifier.holding(resolved.clamp_mode))
    }

    /// `holding` is the level the stimulus sits on, normally from [`Self::holding_for`].
    pub fn build(
        &self,
        resolved: &ResolvedParameters,
        holding: f64,
    ) -> Result<TaskDescriptor, ParameterError> {
        let shape = resolved.shape;
        let duration = shape.duration();
        let num_pts = points_per_pulse(duration, resolved.sample_rate, resolved.downsample);
        if num_pts == 0 {
            return Err(ParameterError::InvalidValue {
                name: "sample_rate".to_string(),
                reason: format!(
                    "{} s at {} Hz yields no samples after downsampling by {}",
                    duration, resolved.sample_rate, resolved.downsample
                ),
            });
        }

        let total = num_pts
            .checked_mul(shape.average)
            .filter(|&total| total <= MAX_TASK_POINTS)
            .ok_or_else(|| ParameterError::InvalidValue {
                name: "average".to_string(),
                reason: format!(
                    "{} repetitions of {} points exceed the {} point limit",
                    shape.average, num_pts, MAX_TASK_POINTS
                ),
            })?;
        let mut command = vec![holding; total];

        let pre = samples(shape.pre_duration, resolved.sample_rate);
        let width = samples(shape.pulse_duration, resolved.sample_rate);
        for rep in 0..shape.average {
            let start = (num_pts * rep + pre).min(total);
            let stop = (start + width).min(num_pts * (rep + 1));
            for sample in &mut command[start..stop.max(start)] {
                *sample += shape.amplitude;
            }
        }

        Ok(TaskDescriptor {
            clamp_device: self.clamp_name.clone(),
            daq_device: self.daq_name.clone(),
            mode: resolved.clamp_mode,
            command,
            sample_rate: resolved.sample_rate,
            num_pts: total,
            points_per_pulse: num_pts,
            downsample: resolved.downsample,
            holding,
            duration: duration * shape.average as f64,
            record_state: vec![
                BRIDGE_BALANCE_RESISTANCE.to_string(),
                BRIDGE_BALANCE_ENABLE.to_string(),
            ],
        })
    }
}
