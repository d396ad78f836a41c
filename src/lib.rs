pub mod config;
pub mod error;
pub mod events;
pub mod hardware;
pub mod local;
pub mod params;
pub mod processing;
pub mod utils;

pub use error::{PulseError, Result};
pub use params::{ClampMode, ParamValue, ParameterStore};
pub use processing::runner::{CycleOutcome, PulseRunner, StopFlag};
pub use processing::scheduler::TestPulseScheduler;
