//! Logging setup. Everything goes to stderr unless `--log` names a file, stdout
//! carries the command output.
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{Layer, Registry};

#[derive(ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[cfg(debug_assertions)]
const DEFAULT_LOG_LEVEL: Level = Level::DEBUG;

/// The library reports tolerated races as warnings
#[cfg(not(debug_assertions))]
const DEFAULT_LOG_LEVEL: Level = Level::WARN;

#[derive(Debug, Default)]
pub struct ObservabilityConfig {
    pub debug: bool,
    pub level: Option<Level>,
    pub file: Option<PathBuf>,
    pub format: LogFormat,
}

impl ObservabilityConfig {
    /// An explicit level wins over `--debug`
    fn level(&self) -> Level {
        match self.level {
            Some(level) => level,
            None if self.debug => Level::DEBUG,
            None => DEFAULT_LOG_LEVEL,
        }
    }

    fn writer(&self) -> Result<BoxMakeWriter> {
        match &self.file {
            Some(path) => Ok(BoxMakeWriter::new(open_log_file(path)?)),
            None => Ok(BoxMakeWriter::new(std::io::stderr)),
        }
    }
}

impl From<&crate::Opts> for ObservabilityConfig {
    fn from(opts: &crate::Opts) -> Self {
        Self {
            debug: opts.global.debug,
            level: opts.global.log_level,
            file: opts.global.log.clone(),
            format: opts.global.log_format,
        }
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))
}

fn fmt_layer(config: &ObservabilityConfig) -> Result<Box<dyn Layer<Registry> + Send + Sync>> {
    let writer = config.writer()?;
    let layer = match config.format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_span_list(false)
            .with_writer(writer)
            .boxed(),
    };

    Ok(layer)
}

pub fn init<T>(config: T) -> Result<()>
where
    T: Into<ObservabilityConfig>,
{
    let config = config.into();
    let filter = LevelFilter::from(config.level());

    tracing_subscriber::registry()
        .with(fmt_layer(&config)?.with_filter(filter))
        .try_init()
        .map_err(|err| anyhow!("failed to init logger: {err}"))
}
