//! Install the global `tracing` subscriber.

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{self, InitError, RollingFileAppender},
};
use tracing_subscriber::{
    filter::ParseError, fmt, layer::SubscriberExt, EnvFilter, Layer, Registry,
};

/// Errors that can occur when installing the subscriber.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid log level: {0}")]
    Level(#[from] ParseError),
    #[error("failed to create log directory {path:?}: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("failed to open log file: {0}")]
    Appender(#[from] InitError),
    #[error("subscriber already set: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// How often the log file is rotated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Minutely,
    Hourly,
    #[default]
    Daily,
    Never,
}

impl Rotation {
    /// Time covered by one file (`None` if the file is never rotated).
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Minutely => Some(Duration::from_secs(60)),
            Self::Hourly => Some(Duration::from_secs(60 * 60)),
            Self::Daily => Some(Duration::from_secs(24 * 60 * 60)),
            Self::Never => None,
        }
    }

    /// Number of files that cover `max_age`.
    pub fn max_files(&self, max_age: Duration) -> Option<usize> {
        let period = self.period()?.as_secs();
        let files = max_age.as_secs().div_ceil(period).max(1);
        Some(usize::try_from(files).unwrap_or(usize::MAX))
    }
}

impl From<Rotation> for rolling::Rotation {
    fn from(rotation: Rotation) -> Self {
        match rotation {
            Rotation::Minutely => rolling::Rotation::MINUTELY,
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

/// File output.
#[derive(Clone, Debug)]
pub struct File {
    /// Path of the log file. Rotated files are named `<stem>.<date>.<extension>` next to it.
    pub path: PathBuf,

    pub rotation: Rotation,

    /// Rotated files older than this are deleted.
    pub max_age: Duration,
}

/// Where and how logs are written.
#[derive(Clone, Debug)]
pub struct Config {
    /// Filter directive (`info`, `debug`, `commonware_guardian=trace`, ...).
    pub level: String,

    /// Emit JSON lines.
    pub json: bool,

    /// Write to a file (in addition to stdout). Parent directories are created.
    pub file: Option<File>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Initialize logging with the given configuration.
///
/// May only be called once per process. File output is written by a background worker that
/// flushes when the returned guard is dropped.
pub fn init(cfg: Config) -> Result<Option<WorkerGuard>, Error> {
    // Create a filter layer from the configured directive
    let filter = EnvFilter::try_new(&cfg.level)?;

    // Create fmt layers for stdout and (optionally) the log file
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);
    layers.push(if cfg.json {
        fmt::layer().json().with_line_number(true).with_file(true).boxed()
    } else {
        fmt::layer().boxed()
    });
    let mut guard = None;
    if let Some(file) = &cfg.file {
        let (writer, worker) = tracing_appender::non_blocking(appender(file)?);
        guard = Some(worker);
        layers.push(if cfg.json {
            fmt::layer()
                .json()
                .with_line_number(true)
                .with_file(true)
                .with_writer(writer)
                .boxed()
        } else {
            fmt::layer().with_ansi(false).with_writer(writer).boxed()
        });
    }

    // Set the global subscriber
    let subscriber = Registry::default().with(layers).with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(guard)
}

fn appender(file: &File) -> Result<RollingFileAppender, Error> {
    let directory = file.path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(directory).map_err(|source| Error::Directory {
        path: directory.to_path_buf(),
        source,
    })?;
    let rotation = file.rotation.into();
    let mut builder = RollingFileAppender::builder().rotation(rotation);
    if let Some(stem) = file.path.file_stem() {
        builder = builder.filename_prefix(stem.to_string_lossy());
    }
    if let Some(extension) = file.path.extension() {
        builder = builder.filename_suffix(extension.to_string_lossy());
    }
    if let Some(max_files) = file.rotation.max_files(file.max_age) {
        builder = builder.max_log_files(max_files);
    }
    Ok(builder.build(directory)?)
}
