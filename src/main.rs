use colored::Colorize;
use crossbeam_channel::RecvTimeoutError;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use patch_testpulse::config::{load_config, save_config, Config};
use patch_testpulse::events::{ChannelSink, CsvSink, PulseEvent, PulseSink};
use patch_testpulse::local::simulated::{CellModel, SimulatedAmplifier, SimulatedTaskService};
use patch_testpulse::processing::analysis::BaselineAnalyzer;
use patch_testpulse::utils::log as logging;
use patch_testpulse::{ClampMode, ParameterStore, PulseRunner, TestPulseScheduler};

const DEFAULT_RUN_SECONDS: f64 = 5.0;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let outcome = if args.len() > 1 {
        match args[1].as_str() {
            "run" => run(args.get(2).map(String::as_str), args.get(3).map(String::as_str)),
            "config" => match args.get(2) {
                Some(path) => write_default_config(path),
                None => {
                    println!("Please specify the path to write the config to");
                    Ok(())
                }
            },
            _ => {
                println!("Invalid argument, please use 'run' or 'config'");
                Ok(())
            }
        }
    } else {
        println!("Please specify 'run [config.yaml] [seconds]' or 'config <path>' as argument");
        Ok(())
    };

    if let Err(e) = outcome {
        eprintln!("{} {}", "Error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn write_default_config(path: &str) -> Result<(), Box<dyn Error>> {
    save_config(&Config::default(), path)?;
    println!("Wrote default config to {}", path.green());
    Ok(())
}

/// Drive a simulated rig for a fixed time and print every published pulse.
fn run(config_path: Option<&str>, seconds: Option<&str>) -> Result<(), Box<dyn Error>> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    let seconds: f64 = match seconds {
        Some(s) => s.parse()?,
        None => DEFAULT_RUN_SECONDS,
    };
    logging::init(config.logging.verbose, config.logging.log_file.as_deref())?;

    let start_mode = config.pulse.clamp_mode.unwrap_or(ClampMode::CurrentClamp);
    let amplifier = Arc::new(SimulatedAmplifier::new("amp0", start_mode));
    let tasks = Arc::new(SimulatedTaskService::new(
        Arc::clone(&amplifier),
        CellModel::default(),
    ));

    let (channel_sink, events) = ChannelSink::new();
    let mut sinks: Vec<Arc<dyn PulseSink>> = vec![Arc::new(channel_sink)];
    if let Some(csv_path) = &config.logging.results_csv {
        sinks.push(Arc::new(CsvSink::new(csv_path)));
    }

    let params = Arc::new(ParameterStore::new(config.pulse.clone()));
    let runner = PulseRunner::new(
        amplifier,
        tasks,
        Arc::new(BaselineAnalyzer::default()),
        params,
        Arc::new(sinks),
    )
    .with_config(config.runner())
    .with_auto_bias(config.auto_bias());

    let mut scheduler = TestPulseScheduler::with_config(runner, config.scheduler());
    scheduler.start()?;

    let deadline = Instant::now() + Duration::try_from_secs_f64(seconds)?;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match events.recv_timeout(remaining) {
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => break,
        }
    }

    scheduler.stop(true)?;
    Ok(())
}

fn print_event(event: &PulseEvent) {
    let recording = &event.result.recording;
    let analysis = &event.result.analysis;
    let mode = match recording.clamp_mode {
        ClampMode::VoltageClamp => "VC".cyan(),
        _ => "IC".magenta(),
    };
    println!(
        "{} {} holding {:>10.3e}  Vm {:>8.2} mV  I {:>8.2} pA  R {:>8.2} MOhm",
        event.channel.bold(),
        mode,
        recording.holding,
        analysis.baseline_potential * 1e3,
        analysis.baseline_current * 1e12,
        analysis.steady_state_resistance / 1e6,
    );
}
