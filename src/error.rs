//! Error types for the test pulse engine.
//!
//! Parameter and shutdown errors reach direct callers. Everything raised inside a
//! pulse cycle is caught by the scheduler loop, logged and retried.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Rejected parameter access. A failed update never changes the store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParameterError {
    #[error("Unknown parameter {0}")]
    Unknown(String),

    #[error("Invalid value for parameter {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Faults reported by the amplifier or the task service.
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("Task creation failed: {0}")]
    TaskCreation(String),

    #[error("Device reservation failed: {0}")]
    Reservation(String),

    #[error("Task execution failed: {0}")]
    Execution(String),

    #[error("Task did not complete within {0:?}")]
    Timeout(Duration),

    #[error("Recording unavailable: {0}")]
    Recording(String),

    #[error("Amplifier error: {0}")]
    Amplifier(String),
}

/// Failures of the analysis collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    #[error("Not enough samples for analysis: {0}")]
    InsufficientData(String),

    #[error("No pulse found in command trace")]
    NoPulse,

    #[error("Analysis failed: {0}")]
    Failed(String),
}

/// Configuration file loading and saving errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Umbrella error for pulse cycles and the scheduler lifecycle.
#[derive(Error, Debug)]
pub enum PulseError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("Recording does not match the task: {0}")]
    Recording(String),

    /// Cooperative cancellation. Never reported as a failure.
    #[error("Stop requested")]
    StopRequested,

    #[error("Timed out after {0:?} waiting for test pulse thread exit")]
    ShutdownTimeout(Duration),

    #[error("Failed to spawn test pulse thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Test pulse cycle panicked: {0}")]
    Panicked(String),

    #[error("Test pulse runner lock poisoned")]
    Poisoned,
}

impl PulseError {
    pub fn is_stop_request(&self) -> bool {
        matches!(self, PulseError::StopRequested)
    }
}

pub type Result<T, E = PulseError> = std::result::Result<T, E>;
