use crate::error::ConfigError;
use crate::params::TestPulseParams;
use crate::processing::auto_bias::AutoBiasController;
use crate::processing::runner::RunnerConfig;
use crate::processing::scheduler::SchedulerConfig;

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub pulse: TestPulseParams,
    pub rig: RigConfig,
    pub scheduler: SchedulerTimingConfig,
    pub logging: LoggingConfig,
}

/// Per-rig constants of the auto-bias controller and task handling.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RigConfig {
    pub min_resistance: f64,
    pub max_resistance: f64,
    pub reuse_tasks: bool,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            min_resistance: 1e6,
            max_resistance: 1e10,
            reuse_tasks: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerTimingConfig {
    pub poll_interval_ms: u64,
    pub sleep_slice_ms: u64,
    pub error_cooldown_ms: u64,
    pub stop_timeout_ms: u64,
    pub task_timeout_ms: u64,
}

impl Default for SchedulerTimingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            sleep_slice_ms: 30,
            error_cooldown_ms: 2000,
            stop_timeout_ms: 10_000,
            task_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct LoggingConfig {
    pub verbose: bool,
    /// File name under `logs/` that receives a copy of every log line.
    pub log_file: Option<String>,
    /// CSV file that receives one summary row per pulse.
    pub results_csv: Option<String>,
}

impl Config {
    pub fn auto_bias(&self) -> AutoBiasController {
        AutoBiasController::new(self.rig.min_resistance, self.rig.max_resistance)
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.scheduler.poll_interval_ms),
            task_timeout: Duration::from_millis(self.scheduler.task_timeout_ms),
            reuse_tasks: self.rig.reuse_tasks,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            sleep_slice: Duration::from_millis(self.scheduler.sleep_slice_ms),
            error_cooldown: Duration::from_millis(self.scheduler.error_cooldown_ms),
            stop_timeout: Duration::from_millis(self.scheduler.stop_timeout_ms),
        }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let config_str = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&config_str)?)
}

pub fn save_config<P: AsRef<Path>>(config: &Config, path: P) -> Result<(), ConfigError> {
    let yaml = serde_yaml::to_string(config)?;
    fs::write(path, yaml)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ClampMode;

    #[test]
    fn partial_file_fills_in_defaults() {
        let yaml = "
pulse:
  interval: 0.25
  clamp_mode: IC
  ic:
    pre_duration: 0.01
    pulse_duration: 0.05
    post_duration: 0.05
    amplitude: -2.0e-11
    average: 2
rig:
  max_resistance: 5.0e9
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.pulse.interval, Some(0.25));
        assert_eq!(config.pulse.clamp_mode, Some(ClampMode::CurrentClamp));
        assert_eq!(config.pulse.ic.average, 2);
        assert_eq!(config.pulse.vc.average, 4);
        assert_eq!(config.pulse.sample_rate, 500_000.0);
        assert_eq!(config.rig.min_resistance, 1e6);
        assert_eq!(config.rig.max_resistance, 5e9);
        assert_eq!(config.scheduler.stop_timeout_ms, 10_000);
    }

    #[test]
    fn durations_convert_from_milliseconds() {
        let config = Config::default();
        assert_eq!(config.runner().poll_interval, Duration::from_millis(10));
        assert_eq!(config.scheduler().sleep_slice, Duration::from_millis(30));
        assert_eq!(config.scheduler().error_cooldown, Duration::from_secs(2));
    }

    #[test]
    fn save_then_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testpulse.yaml");
        let mut config = Config::default();
        config.pulse.auto_bias.target = None;
        config.logging.results_csv = Some("pulses.csv".to_string());

        save_config(&config, &path).unwrap();
        let loaded = load_config(&path).unwrap();

        assert_eq!(loaded.pulse.auto_bias.target, None);
        assert_eq!(loaded.logging.results_csv.as_deref(), Some("pulses.csv"));
    }
}
