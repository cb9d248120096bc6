//! Tracing setup for the CLI.
//!
//! Logs go to stderr from the start. Once a launch knows its work
//! directory, the same events are also written to `<timestamp>.log` there,
//! and the level is adjusted for the run. Only rank 0 writes the file;
//! other ranks keep logging ERROR to stderr.

use anyhow::{Context, Result};
use keel_training::{LaunchEvent, ProgressSink, TracingProgressSink};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::warn;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, Registry};

/// Map a level name to a filter. Accepts the usual names in any case plus
/// `warning`, `critical` and `fatal`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.to_ascii_lowercase().as_str() {
        "trace" => Some(LevelFilter::TRACE),
        "debug" => Some(LevelFilter::DEBUG),
        "info" => Some(LevelFilter::INFO),
        "warn" | "warning" => Some(LevelFilter::WARN),
        "error" | "critical" | "fatal" => Some(LevelFilter::ERROR),
        "off" => Some(LevelFilter::OFF),
        _ => None,
    }
}

/// Destination of the file layer; empty until a run log is opened.
#[derive(Clone, Default)]
struct RunLogFile(Arc<Mutex<Option<File>>>);

struct RunLogWriter(Arc<Mutex<Option<File>>>);

impl Write for RunLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.0.lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(file) => file.write(buf),
                None => Ok(buf.len()),
            },
            Err(_) => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.0.lock() {
            Ok(mut guard) => guard.as_mut().map_or(Ok(()), File::flush),
            Err(_) => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RunLogFile {
    type Writer = RunLogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter(self.0.clone())
    }
}

/// Handles to the installed subscriber.
#[derive(Clone)]
pub struct Logging {
    level: reload::Handle<LevelFilter, Registry>,
    file: RunLogFile,
    /// Level given on the command line; wins over the config's `log_level`.
    explicit: Option<LevelFilter>,
}

impl Logging {
    pub fn set_level(&self, level: LevelFilter) -> Result<()> {
        self.level.modify(|filter| *filter = level).context("Failed to change the log level")
    }

    pub fn attach_file(&self, path: &Path) -> Result<()> {
        let file = File::create(path).with_context(|| format!("Failed to create log file {}", path.display()))?;
        let mut slot = self.file.0.lock().map_err(|_| anyhow::anyhow!("log file lock poisoned"))?;
        *slot = Some(file);
        Ok(())
    }
}

/// Install the global subscriber.
pub fn init(level: Option<&str>) -> Result<Logging> {
    let explicit = match level {
        Some(name) => Some(parse_level(name).with_context(|| format!("Unknown log level: {name}"))?),
        None => None,
    };
    let (filter, handle) = reload::Layer::new(explicit.unwrap_or(LevelFilter::INFO));
    let file = RunLogFile::default();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().without_time().with_target(false).with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_target(false).with_writer(file.clone()))
        .try_init()
        .context("Failed to install the tracing subscriber")?;

    Ok(Logging { level: handle, file, explicit })
}

/// Progress sink that wires the run log into the subscriber.
pub struct RunLogSink {
    logging: Logging,
}

impl RunLogSink {
    pub fn new(logging: Logging) -> Self {
        Self { logging }
    }

    fn open_run_log(&self, log_file: &Path, rank: usize, log_level: &str) -> Result<()> {
        if rank != 0 {
            return self.logging.set_level(LevelFilter::ERROR);
        }
        let level = match self.logging.explicit {
            Some(level) => level,
            None => parse_level(log_level).unwrap_or(LevelFilter::INFO),
        };
        self.logging.set_level(level)?;
        self.logging.attach_file(log_file)
    }
}

impl ProgressSink for RunLogSink {
    fn on_event(&self, event: &LaunchEvent) {
        if let LaunchEvent::WorkDirReady { log_file, rank, log_level, .. } = event {
            if let Err(err) = self.open_run_log(log_file, *rank, log_level) {
                warn!("{err:#}");
            }
        }
        TracingProgressSink.on_event(event);
    }
}
