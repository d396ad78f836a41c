//! Versioned test pulse parameters.
//!
//! A [`ParameterSet`] is never mutated once published. Updates go through
//! [`ParameterStore::set_parameters`], which validates the whole batch against a copy,
//! bumps the version and swaps the shared snapshot in one step.

use crate::error::ParameterError;
use crate::processing::result::TestPulseResult;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

// -----------------------------------------------------------------------------
// CLAMP MODE
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClampMode {
    #[serde(rename = "VC")]
    VoltageClamp,
    #[serde(rename = "IC")]
    CurrentClamp,
    #[serde(rename = "I=0")]
    CurrentZero,
}

impl ClampMode {
    /// Mode used to build the pulse. I=0 is pulsed as current clamp.
    pub fn pulse_mode(self) -> ClampMode {
        match self {
            ClampMode::CurrentZero => ClampMode::CurrentClamp,
            other => other,
        }
    }

    pub fn is_voltage_clamp(self) -> bool {
        self == ClampMode::VoltageClamp
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClampMode::VoltageClamp => "VC",
            ClampMode::CurrentClamp => "IC",
            ClampMode::CurrentZero => "I=0",
        }
    }

    /// Unit of the measured (primary) channel.
    pub fn primary_units(self) -> &'static str {
        if self.is_voltage_clamp() {
            "A"
        } else {
            "V"
        }
    }

    /// Unit of the stimulus (command) channel.
    pub fn command_units(self) -> &'static str {
        if self.is_voltage_clamp() {
            "V"
        } else {
            "A"
        }
    }
}

impl fmt::Display for ClampMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClampMode {
    type Err = ParameterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "VC" => Ok(ClampMode::VoltageClamp),
            "IC" => Ok(ClampMode::CurrentClamp),
            "I=0" => Ok(ClampMode::CurrentZero),
            _ => Err(ParameterError::InvalidValue {
                name: "clamp_mode".to_string(),
                reason: format!("'{}' is not one of VC, IC, I=0", s),
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// POST-PROCESSING HOOK
// -----------------------------------------------------------------------------

/// User hook applied to every finished result before it is published.
#[derive(Clone)]
pub struct PostProcessor(Arc<dyn Fn(TestPulseResult) -> TestPulseResult + Send + Sync>);

impl PostProcessor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(TestPulseResult) -> TestPulseResult + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, result: TestPulseResult) -> TestPulseResult {
        (self.0)(result)
    }

    pub fn ptr_eq(&self, other: &PostProcessor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PostProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostProcessor(..)")
    }
}

// -----------------------------------------------------------------------------
// PARAMETER VALUES
// -----------------------------------------------------------------------------

/// A single typed parameter value, as passed to `set_parameters`.
#[derive(Debug, Clone)]
pub enum ParamValue {
    Number(f64),
    Count(usize),
    Flag(bool),
    Mode(ClampMode),
    Hook(PostProcessor),
    Unset,
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ParamValue::Number(a), ParamValue::Number(b)) => a == b,
            (ParamValue::Count(a), ParamValue::Count(b)) => a == b,
            (ParamValue::Flag(a), ParamValue::Flag(b)) => a == b,
            (ParamValue::Mode(a), ParamValue::Mode(b)) => a == b,
            (ParamValue::Hook(a), ParamValue::Hook(b)) => a.ptr_eq(b),
            (ParamValue::Unset, ParamValue::Unset) => true,
            _ => false,
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        ParamValue::Number(value)
    }
}

impl From<usize> for ParamValue {
    fn from(value: usize) -> Self {
        ParamValue::Count(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Flag(value)
    }
}

impl From<ClampMode> for ParamValue {
    fn from(value: ClampMode) -> Self {
        ParamValue::Mode(value)
    }
}

impl From<PostProcessor> for ParamValue {
    fn from(value: PostProcessor) -> Self {
        ParamValue::Hook(value)
    }
}

impl<T: Into<ParamValue>> From<Option<T>> for ParamValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ParamValue::Unset, Into::into)
    }
}

// -----------------------------------------------------------------------------
// PARAMETER GROUPS
// -----------------------------------------------------------------------------

/// Pulse timing and amplitude for one clamp mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseShape {
    pub pre_duration: f64,
    pub pulse_duration: f64,
    pub post_duration: f64,
    pub amplitude: f64,
    pub average: usize,
}

impl PulseShape {
    pub fn duration(&self) -> f64 {
        self.pre_duration + self.pulse_duration + self.post_duration
    }

    pub fn voltage_clamp_default() -> Self {
        Self {
            pre_duration: 5e-3,
            pulse_duration: 10e-3,
            post_duration: 5e-3,
            amplitude: -10e-3,
            average: 4,
        }
    }

    pub fn current_clamp_default() -> Self {
        Self {
            pre_duration: 10e-3,
            pulse_duration: 80e-3,
            post_duration: 80e-3,
            amplitude: -10e-12,
            average: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBiasParams {
    pub enabled: bool,
    /// Target membrane potential. `None` follows the voltage clamp holding.
    pub target: Option<f64>,
    pub follow_rate: f64,
    pub min_current: f64,
    pub max_current: f64,
    pub vc_carryover: f64,
}

impl Default for AutoBiasParams {
    fn default() -> Self {
        Self {
            enabled: true,
            target: Some(-70e-3),
            follow_rate: 0.5,
            min_current: -1.5e-9,
            max_current: 1.5e-9,
            vc_carryover: 0.7,
        }
    }
}

/// The full, mode-aware parameter table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestPulseParams {
    /// Forced clamp mode. `None` follows the amplifier.
    pub clamp_mode: Option<ClampMode>,
    /// Seconds between cycle starts. `None` runs cycles back to back.
    pub interval: Option<f64>,
    pub sample_rate: f64,
    pub downsample: usize,
    /// Holding override. `None` uses the amplifier's holding for the pulse mode.
    pub holding: Option<f64>,
    pub auto_bias: AutoBiasParams,
    pub vc: PulseShape,
    pub ic: PulseShape,
    #[serde(skip)]
    pub post_processing: Option<PostProcessor>,
}

impl Default for TestPulseParams {
    fn default() -> Self {
        Self {
            clamp_mode: None,
            interval: None,
            sample_rate: 500_000.0,
            downsample: 20,
            holding: None,
            auto_bias: AutoBiasParams::default(),
            vc: PulseShape::voltage_clamp_default(),
            ic: PulseShape::current_clamp_default(),
            post_processing: None,
        }
    }
}

/// Every name accepted by `set_parameters` and `get_parameter`.
pub const PARAMETER_NAMES: &[&str] = &[
    "post_processing",
    "clamp_mode",
    "interval",
    "auto_bias_enabled",
    "auto_bias_target",
    "auto_bias_follow_rate",
    "auto_bias_min_current",
    "auto_bias_max_current",
    "auto_bias_vc_carryover",
    "sample_rate",
    "downsample",
    "holding",
    "vc_pre_duration",
    "vc_pulse_duration",
    "vc_post_duration",
    "vc_amplitude",
    "vc_average",
    "ic_pre_duration",
    "ic_pulse_duration",
    "ic_post_duration",
    "ic_amplitude",
    "ic_average",
];

fn invalid(name: &str, reason: impl Into<String>) -> ParameterError {
    ParameterError::InvalidValue {
        name: name.to_string(),
        reason: reason.into(),
    }
}

fn number(name: &str, value: &ParamValue) -> Result<f64, ParameterError> {
    match *value {
        ParamValue::Number(x) if x.is_finite() => Ok(x),
        ParamValue::Number(x) => Err(invalid(name, format!("{} is not finite", x))),
        ParamValue::Count(n) => Ok(n as f64),
        _ => Err(invalid(name, format!("expected a number, got {:?}", value))),
    }
}

fn optional_number(name: &str, value: &ParamValue) -> Result<Option<f64>, ParameterError> {
    match value {
        ParamValue::Unset => Ok(None),
        other => number(name, other).map(Some),
    }
}

fn positive(name: &str, value: &ParamValue) -> Result<f64, ParameterError> {
    let x = number(name, value)?;
    if x > 0.0 {
        Ok(x)
    } else {
        Err(invalid(name, format!("{} must be positive", x)))
    }
}

fn duration(name: &str, value: &ParamValue) -> Result<f64, ParameterError> {
    let x = number(name, value)?;
    if x >= 0.0 {
        Ok(x)
    } else {
        Err(invalid(name, format!("{} is a negative duration", x)))
    }
}

fn count(name: &str, value: &ParamValue) -> Result<usize, ParameterError> {
    let n = match *value {
        ParamValue::Count(n) => n,
        ParamValue::Number(x) if x.is_finite() && x.fract() == 0.0 && x >= 0.0 => x as usize,
        _ => return Err(invalid(name, format!("expected a whole number, got {:?}", value))),
    };
    if n == 0 {
        return Err(invalid(name, "must be at least 1"));
    }
    Ok(n)
}

fn flag(name: &str, value: &ParamValue) -> Result<bool, ParameterError> {
    match *value {
        ParamValue::Flag(b) => Ok(b),
        _ => Err(invalid(name, format!("expected a bool, got {:?}", value))),
    }
}

impl TestPulseParams {
    /// Assign one named value in place. Callers work on a copy.
    fn assign(&mut self, name: &str, value: &ParamValue) -> Result<(), ParameterError> {
        match name {
            "post_processing" => {
                self.post_processing = match value {
                    ParamValue::Hook(hook) => Some(hook.clone()),
                    ParamValue::Unset => None,
                    other => return Err(invalid(name, format!("expected a hook, got {:?}", other))),
                }
            }
            "clamp_mode" => {
                self.clamp_mode = match value {
                    ParamValue::Mode(mode) => Some(*mode),
                    ParamValue::Unset => None,
                    other => {
                        return Err(invalid(name, format!("expected a clamp mode, got {:?}", other)))
                    }
                }
            }
            "interval" => {
                self.interval = match optional_number(name, value)? {
                    Some(x) if x < 0.0 => return Err(invalid(name, "must not be negative")),
                    other => other,
                }
            }
            "auto_bias_enabled" => self.auto_bias.enabled = flag(name, value)?,
            "auto_bias_target" => self.auto_bias.target = optional_number(name, value)?,
            "auto_bias_follow_rate" => self.auto_bias.follow_rate = number(name, value)?,
            "auto_bias_min_current" => self.auto_bias.min_current = number(name, value)?,
            "auto_bias_max_current" => self.auto_bias.max_current = number(name, value)?,
            "auto_bias_vc_carryover" => self.auto_bias.vc_carryover = number(name, value)?,
            "sample_rate" => self.sample_rate = positive(name, value)?,
            "downsample" => self.downsample = count(name, value)?,
            "holding" => self.holding = optional_number(name, value)?,
            "vc_pre_duration" => self.vc.pre_duration = duration(name, value)?,
            "vc_pulse_duration" => self.vc.pulse_duration = duration(name, value)?,
            "vc_post_duration" => self.vc.post_duration = duration(name, value)?,
            "vc_amplitude" => self.vc.amplitude = number(name, value)?,
            "vc_average" => self.vc.average = count(name, value)?,
            "ic_pre_duration" => self.ic.pre_duration = duration(name, value)?,
            "ic_pulse_duration" => self.ic.pulse_duration = duration(name, value)?,
            "ic_post_duration" => self.ic.post_duration = duration(name, value)?,
            "ic_amplitude" => self.ic.amplitude = number(name, value)?,
            "ic_average" => self.ic.average = count(name, value)?,
            _ => return Err(ParameterError::Unknown(name.to_string())),
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<ParamValue, ParameterError> {
        let value = match name {
            "post_processing" => self.post_processing.clone().into(),
            "clamp_mode" => self.clamp_mode.into(),
            "interval" => self.interval.into(),
            "auto_bias_enabled" => self.auto_bias.enabled.into(),
            "auto_bias_target" => self.auto_bias.target.into(),
            "auto_bias_follow_rate" => self.auto_bias.follow_rate.into(),
            "auto_bias_min_current" => self.auto_bias.min_current.into(),
            "auto_bias_max_current" => self.auto_bias.max_current.into(),
            "auto_bias_vc_carryover" => self.auto_bias.vc_carryover.into(),
            "sample_rate" => self.sample_rate.into(),
            "downsample" => self.downsample.into(),
            "holding" => self.holding.into(),
            "vc_pre_duration" => self.vc.pre_duration.into(),
            "vc_pulse_duration" => self.vc.pulse_duration.into(),
            "vc_post_duration" => self.vc.post_duration.into(),
            "vc_amplitude" => self.vc.amplitude.into(),
            "vc_average" => self.vc.average.into(),
            "ic_pre_duration" => self.ic.pre_duration.into(),
            "ic_pulse_duration" => self.ic.pulse_duration.into(),
            "ic_post_duration" => self.ic.post_duration.into(),
            "ic_amplitude" => self.ic.amplitude.into(),
            "ic_average" => self.ic.average.into(),
            _ => return Err(ParameterError::Unknown(name.to_string())),
        };
        Ok(value)
    }
}

// -----------------------------------------------------------------------------
// PARAMETER SET
// -----------------------------------------------------------------------------

/// An immutable, versioned snapshot of the parameter table.
#[derive(Debug, Clone)]
pub struct ParameterSet {
    params: TestPulseParams,
    version: u64,
}

impl ParameterSet {
    pub fn new(params: TestPulseParams) -> Self {
        Self { params, version: 0 }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn params(&self) -> &TestPulseParams {
        &self.params
    }

    pub fn get(&self, name: &str) -> Result<ParamValue, ParameterError> {
        self.params.get(name)
    }

    /// Apply a batch of updates to a copy. Any bad entry rejects the whole batch.
    pub fn with_updates<I, K>(&self, updates: I) -> Result<ParameterSet, ParameterError>
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: AsRef<str>,
    {
        let mut params = self.params.clone();
        for (name, value) in updates {
            params.assign(name.as_ref(), &value)?;
        }
        Ok(ParameterSet {
            params,
            version: self.version + 1,
        })
    }

    /// Collapse the `vc`/`ic` groups into the mode-neutral parameters for `mode`.
    pub fn resolve_for_mode(&self, mode: ClampMode) -> ResolvedParameters {
        let clamp_mode = mode.pulse_mode();
        let shape = if clamp_mode.is_voltage_clamp() {
            self.params.vc
        } else {
            self.params.ic
        };
        ResolvedParameters {
            version: self.version,
            clamp_mode,
            shape,
            sample_rate: self.params.sample_rate,
            downsample: self.params.downsample,
            holding: self.params.holding,
            interval: self.params.interval,
            auto_bias: self.params.auto_bias,
            post_processing: self.params.post_processing.clone(),
        }
    }
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self::new(TestPulseParams::default())
    }
}

/// Parameters for a single clamp mode, with the mode prefixes stripped.
#[derive(Debug, Clone)]
pub struct ResolvedParameters {
    pub version: u64,
    /// Always `VoltageClamp` or `CurrentClamp`.
    pub clamp_mode: ClampMode,
    pub shape: PulseShape,
    pub sample_rate: f64,
    pub downsample: usize,
    pub holding: Option<f64>,
    pub interval: Option<f64>,
    pub auto_bias: AutoBiasParams,
    pub post_processing: Option<PostProcessor>,
}

impl ResolvedParameters {
    pub fn pre_duration(&self) -> f64 {
        self.shape.pre_duration
    }

    pub fn pulse_duration(&self) -> f64 {
        self.shape.pulse_duration
    }

    pub fn post_duration(&self) -> f64 {
        self.shape.post_duration
    }

    pub fn amplitude(&self) -> f64 {
        self.shape.amplitude
    }

    pub fn average(&self) -> usize {
        self.shape.average
    }
}

// -----------------------------------------------------------------------------
// PARAMETER STORE
// -----------------------------------------------------------------------------

/// Shared holder of the active [`ParameterSet`]. Readers take cheap snapshots.
#[derive(Debug)]
pub struct ParameterStore {
    current: RwLock<Arc<ParameterSet>>,
}

impl ParameterStore {
    pub fn new(params: TestPulseParams) -> Self {
        Self {
            current: RwLock::new(Arc::new(ParameterSet::new(params))),
        }
    }

    pub fn snapshot(&self) -> Arc<ParameterSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn version(&self) -> u64 {
        self.snapshot().version()
    }

    pub fn set_parameters<I, K>(&self, updates: I) -> Result<Arc<ParameterSet>, ParameterError>
    where
        I: IntoIterator<Item = (K, ParamValue)>,
        K: AsRef<str>,
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(current.with_updates(updates)?);
        *current = next.clone();
        log::debug!("Test pulse parameters updated to version {}", next.version());
        Ok(next)
    }

    pub fn get_parameter(&self, name: &str) -> Result<ParamValue, ParameterError> {
        self.snapshot().get(name)
    }

    pub fn resolve_for_mode(&self, mode: ClampMode) -> ResolvedParameters {
        self.snapshot().resolve_for_mode(mode)
    }
}

impl Default for ParameterStore {
    fn default() -> Self {
        Self::new(TestPulseParams::default())
    }
}
