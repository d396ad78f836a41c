use chrono::Utc;
use patch_testpulse::events::{ChannelSink, CsvSink, NullSink, PulseSink, CSV_HEADERS};
use patch_testpulse::processing::result::{
    PatchClampRecording, PulseAnalysis, TSeries, TestPulseResult,
};
use patch_testpulse::ClampMode;

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn series(channel: &str, units: &str) -> TSeries {
    TSeries {
        channel_id: channel.to_string(),
        data: vec![0.0; 4],
        time_values: vec![0.0, 1e-4, 2e-4, 3e-4],
        units: units.to_string(),
        start_time: Utc::now(),
    }
}

fn result(mode: ClampMode, bridge_balance: Option<f64>) -> TestPulseResult {
    TestPulseResult {
        recording: PatchClampRecording {
            device_id: "amp0".to_string(),
            clamp_mode: mode,
            start_time: Utc::now(),
            primary: series("primary", mode.primary_units()),
            command: series("command", mode.command_units()),
            holding: -0.07,
            bridge_balance,
        },
        analysis: PulseAnalysis {
            baseline_potential: -0.07,
            baseline_current: -20e-12,
            steady_state_resistance: 100e6,
            ..PulseAnalysis::default()
        },
    }
}

#[test]
fn csv_sink_writes_header_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("runs").join("pulses.csv");
    let sink = CsvSink::new(&path);

    sink.pulse_finished("amp0", &result(ClampMode::VoltageClamp, None));
    sink.pulse_finished("amp0", &result(ClampMode::CurrentClamp, Some(8e6)));

    let contents = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], CSV_HEADERS.join(","));
    assert!(lines[1].contains(",amp0,VC,"));
    assert!(lines[1].ends_with(','));
    assert!(lines[2].contains(",amp0,IC,"));
    assert!(lines[2].ends_with(",8000000"));
}

#[test]
fn csv_sink_survives_unwritable_path() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the file should be.
    let sink = CsvSink::new(dir.path());

    sink.pulse_finished("amp0", &result(ClampMode::VoltageClamp, None));
}

#[test]
fn channel_sink_forwards_events() {
    let (sink, events) = ChannelSink::new();

    sink.pulse_finished("amp1", &result(ClampMode::CurrentClamp, Some(0.0)));

    let event = events.try_recv().unwrap();
    assert_eq!(event.channel, "amp1");
    assert_eq!(event.result.clamp_mode(), ClampMode::CurrentClamp);
    assert_eq!(event.result.recording.bridge_balance, Some(0.0));
}

#[test]
fn channel_sink_ignores_dropped_receiver() {
    let (sink, events) = ChannelSink::new();
    drop(events);
    sink.pulse_finished("amp1", &result(ClampMode::VoltageClamp, None));
}

#[test]
fn fan_out_reaches_every_sink() {
    struct Counting(AtomicUsize);
    impl PulseSink for Counting {
        fn pulse_finished(&self, _channel: &str, _result: &TestPulseResult) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let a = Arc::new(Counting(AtomicUsize::new(0)));
    let b = Arc::new(Counting(AtomicUsize::new(0)));
    let sinks: Vec<Arc<dyn PulseSink>> = vec![a.clone() as Arc<dyn PulseSink>, b.clone(), Arc::new(NullSink)];

    sinks.pulse_finished("amp0", &result(ClampMode::VoltageClamp, None));
    sinks.pulse_finished("amp0", &result(ClampMode::VoltageClamp, None));

    assert_eq!(a.0.load(Ordering::SeqCst), 2);
    assert_eq!(b.0.load(Ordering::SeqCst), 2);
}
