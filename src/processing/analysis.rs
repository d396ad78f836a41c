use super::result::{PatchClampRecording, PulseAnalysis};
use super::signal::mean;
use crate::error::AnalysisError;

/// Converts an averaged test pulse into electrical parameters.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, recording: &PatchClampRecording) -> Result<PulseAnalysis, AnalysisError>;
}

impl<F> Analyzer for F
where
    F: Fn(&PatchClampRecording) -> Result<PulseAnalysis, AnalysisError> + Send + Sync,
{
    fn analyze(&self, recording: &PatchClampRecording) -> Result<PulseAnalysis, AnalysisError> {
        self(recording)
    }
}

/// Window-average analysis: baseline before the pulse, steady state at the end of it.
#[derive(Debug, Clone)]
pub struct BaselineAnalyzer {
    /// Fraction of the pulse, counted back from its end, averaged for the steady state.
    pub steady_state_fraction: f64,
}

impl Default for BaselineAnalyzer {
    fn default() -> Self {
        Self {
            steady_state_fraction: 0.2,
        }
    }
}

impl BaselineAnalyzer {
    fn pulse_window(command: &[f64]) -> Option<(usize, usize)> {
        let peak = command.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if peak == 0.0 {
            return None;
        }
        let threshold = peak / 2.0;
        let start = command.iter().position(|v| v.abs() >= threshold)?;
        let last = command.iter().rposition(|v| v.abs() >= threshold)?;
        Some((start, last + 1))
    }
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        f64::INFINITY
    } else {
        numerator / denominator
    }
}

impl Analyzer for BaselineAnalyzer {
    fn analyze(&self, recording: &PatchClampRecording) -> Result<PulseAnalysis, AnalysisError> {
        let primary = &recording.primary.data;
        let command = &recording.command.data;
        if primary.len() != command.len() {
            return Err(AnalysisError::InsufficientData(format!(
                "primary has {} samples, command has {}",
                primary.len(),
                command.len()
            )));
        }

        let (start, end) = Self::pulse_window(command).ok_or(AnalysisError::NoPulse)?;
        let baseline = mean(&primary[..start]).ok_or_else(|| {
            AnalysisError::InsufficientData("no baseline before the pulse".to_string())
        })?;
        let amplitude = mean(&command[start..end]).ok_or(AnalysisError::NoPulse)?;

        let width = end - start;
        let tail = ((width as f64 * self.steady_state_fraction) as usize).clamp(1, width);
        let steady = mean(&primary[end - tail..end]).ok_or_else(|| {
            AnalysisError::InsufficientData("empty steady state window".to_string())
        })?;

        let mut analysis = PulseAnalysis::default();
        if recording.clamp_mode.is_voltage_clamp() {
            analysis.baseline_current = baseline;
            analysis.baseline_potential = recording.holding;
            analysis.steady_state_resistance = ratio(amplitude, steady - baseline);

            let peak = primary[start..end]
                .iter()
                .map(|v| v - baseline)
                .fold(0.0_f64, |acc, v| if v.abs() > acc.abs() { v } else { acc });
            analysis
                .extra
                .insert("peak_resistance".to_string(), ratio(amplitude, peak));
        } else {
            analysis.baseline_potential = baseline;
            analysis.baseline_current = recording.holding;
            analysis.steady_state_resistance = ratio(steady - baseline, amplitude);
        }
        analysis
            .extra
            .insert("pulse_amplitude".to_string(), amplitude);

        Ok(analysis)
    }
}
