use colored::Colorize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use ::log::{Level, LevelFilter, Log, Metadata, Record};

pub const LOG_DIR: &str = "logs";

/// Global logger: colored lines on stderr, plain copies in an optional file.
pub struct ConsoleLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl ConsoleLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self { level, file: None }
    }

    /// Also append every line to `logs/<filename>`.
    pub fn with_file(mut self, filename: &str) -> io::Result<Self> {
        self.file = Some(Mutex::new(open_log_file(Path::new(LOG_DIR), filename)?));
        Ok(self)
    }
}

/// Opens `dir/filename` for appending, creating the directory if it doesn't exist.
pub fn open_log_file(dir: &Path, filename: &str) -> io::Result<File> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    let path: PathBuf = dir.join(filename);
    OpenOptions::new().create(true).append(true).open(path)
}

fn format_line(record: &Record) -> String {
    format!(
        "{} [{}] {}: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        record.target(),
        record.args()
    )
}

fn level_tag(level: Level) -> colored::ColoredString {
    let tag = format!("[{}]", level);
    match level {
        Level::Error => tag.red().bold(),
        Level::Warn => tag.yellow(),
        Level::Info => tag.green(),
        Level::Debug => tag.blue(),
        Level::Trace => tag.dimmed(),
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        eprintln!("{} {}", level_tag(record.level()), record.args());

        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            // Losing a log line is not worth failing the caller.
            let _ = writeln!(file, "{}", format_line(record));
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
    }
}

/// Install the console logger as the global `log` backend.
///
/// `verbose` lowers the level from info to debug. A second call leaves the first logger
/// in place and only reports the failure on stderr.
pub fn init(verbose: bool, log_file: Option<&str>) -> io::Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let mut logger = ConsoleLogger::new(level);
    if let Some(filename) = log_file {
        logger = logger.with_file(filename)?;
    }

    if let Err(e) = ::log::set_boxed_logger(Box::new(logger)).map(|()| ::log::set_max_level(level)) {
        eprintln!("{} {}", "Logger already installed:".yellow(), e);
    }
    Ok(())
}
