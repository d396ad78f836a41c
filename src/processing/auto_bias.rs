use super::result::TestPulseResult;
use crate::error::HardwareError;
use crate::hardware::Amplifier;
use crate::params::{AutoBiasParams, ClampMode};

// Never panics on inverted bounds; the upper bound wins.
fn clip(value: f64, lo: f64, hi: f64) -> f64 {
    value.max(lo).min(hi)
}

/// What the controller wrote to the amplifier, if anything.
#[derive(Debug, Clone, PartialEq)]
pub enum BiasUpdate {
    /// Voltage clamp pulse: current clamp holding seeded from the baseline current.
    CarriedOver { ic_holding: f64 },
    /// Current clamp pulse: holding current stepped toward the target potential.
    Adjusted { previous: f64, holding: f64 },
    /// Measurement unusable; amplifier left alone.
    Skipped(String),
}

/// Proportional holding-current controller. Stateless between pulses.
#[derive(Debug, Clone)]
pub struct AutoBiasController {
    pub min_resistance: f64,
    pub max_resistance: f64,
}

impl Default for AutoBiasController {
    fn default() -> Self {
        Self {
            min_resistance: 1e6,
            max_resistance: 1e10,
        }
    }
}

impl AutoBiasController {
    pub fn new(min_resistance: f64, max_resistance: f64) -> Self {
        Self {
            min_resistance,
            max_resistance,
        }
    }

    pub fn update(
        &self,
        result: &TestPulseResult,
        params: &AutoBiasParams,
        amplifier: &dyn Amplifier,
    ) -> Result<BiasUpdate, HardwareError> {
        let analysis = &result.analysis;

        if result.clamp_mode().is_voltage_clamp() {
            let ic_holding = analysis.baseline_current * params.vc_carryover;
            if !ic_holding.is_finite() {
                return Ok(BiasUpdate::Skipped(format!(
                    "baseline current {} is not finite",
                    analysis.baseline_current
                )));
            }
            amplifier.set_holding(ClampMode::CurrentClamp, ic_holding)?;
            return Ok(BiasUpdate::CarriedOver { ic_holding });
        }

        let rm = analysis.steady_state_resistance;
        let vm = analysis.baseline_potential;
        if rm.is_nan() || !vm.is_finite() {
            return Ok(BiasUpdate::Skipped(format!(
                "resistance {} / potential {} unusable",
                rm, vm
            )));
        }
        let rm = clip(rm, self.min_resistance, self.max_resistance);

        let target = params
            .target
            .unwrap_or_else(|| amplifier.holding(ClampMode::VoltageClamp));
        let di = (target - vm) / rm;

        let mode = ClampMode::CurrentClamp;
        let previous = amplifier.holding(mode);
        let holding = clip(
            previous + di * params.follow_rate,
            params.min_current,
            params.max_current,
        );

        amplifier.set_holding(mode, holding)?;
        Ok(BiasUpdate::Adjusted { previous, holding })
    }
}
