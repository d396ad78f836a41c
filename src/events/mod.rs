//! Observers of finished test pulses. Sinks are injected when the runner is built.

use crate::processing::result::TestPulseResult;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::warn;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Receives each published test pulse exactly once.
pub trait PulseSink: Send + Sync {
    fn pulse_finished(&self, channel: &str, result: &TestPulseResult);
}

// FAN-OUT ---------------------------------------------------------------------

impl PulseSink for Vec<Arc<dyn PulseSink>> {
    fn pulse_finished(&self, channel: &str, result: &TestPulseResult) {
        for sink in self {
            sink.pulse_finished(channel, result);
        }
    }
}

/// Discards every result.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl PulseSink for NullSink {
    fn pulse_finished(&self, _channel: &str, _result: &TestPulseResult) {}
}

// CLOSURE ---------------------------------------------------------------------

pub struct FnSink<F>(pub F);

impl<F> PulseSink for FnSink<F>
where
    F: Fn(&str, &TestPulseResult) + Send + Sync,
{
    fn pulse_finished(&self, channel: &str, result: &TestPulseResult) {
        (self.0)(channel, result)
    }
}

// CHANNEL ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PulseEvent {
    pub channel: String,
    pub result: TestPulseResult,
}

/// Forwards results to another thread (a UI loop, a recorder).
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<PulseEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<PulseEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl PulseSink for ChannelSink {
    fn pulse_finished(&self, channel: &str, result: &TestPulseResult) {
        let event = PulseEvent {
            channel: channel.to_string(),
            result: result.clone(),
        };
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

// CSV -------------------------------------------------------------------------

pub const CSV_HEADERS: &[&str] = &[
    "timestamp",
    "channel",
    "clamp_mode",
    "holding",
    "baseline_potential",
    "baseline_current",
    "steady_state_resistance",
    "bridge_balance",
];

/// Appends one summary row per pulse; writes the header when the file is new.
pub struct CsvSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CsvSink {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, channel: &str, result: &TestPulseResult) -> Result<(), csv::Error> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file_exists = self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = csv::Writer::from_writer(file);

        if !file_exists {
            writer.write_record(CSV_HEADERS)?;
        }

        let recording = &result.recording;
        let analysis = &result.analysis;
        writer.write_record([
            recording.start_time.to_rfc3339(),
            channel.to_string(),
            recording.clamp_mode.to_string(),
            recording.holding.to_string(),
            analysis.baseline_potential.to_string(),
            analysis.baseline_current.to_string(),
            analysis.steady_state_resistance.to_string(),
            recording
                .bridge_balance
                .map(|b| b.to_string())
                .unwrap_or_default(),
        ])?;
        writer.flush()?;
        Ok(())
    }
}

impl PulseSink for CsvSink {
    fn pulse_finished(&self, channel: &str, result: &TestPulseResult) {
        if let Err(e) = self.append(channel, result) {
            warn!("Failed to write test pulse row to {}: {}", self.path.display(), e);
        }
    }
}
