//! Logging setup on the `tracing` ecosystem
//!
//! The library itself only emits `tracing` events. Hosts that have no
//! subscriber of their own can call [`init_logging_default`] once at startup.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard tracing filter, wins over everything else
//!   (e.g. "info", "device_arbiter=trace")
//! - `ARBITER_LOG_LEVEL`: plain level (error, warn, info, debug, trace)
//! - `ARBITER_LOG_FORMAT`: "human" or "json"
//! - `ARBITER_LOG_FILE`: optional path, written as JSON lines

use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Set once a subscriber has been installed by this module
static TRACING_INITIALIZED: OnceCell<()> = OnceCell::new();

pub const LOG_LEVEL_ENV: &str = "ARBITER_LOG_LEVEL";
pub const LOG_FORMAT_ENV: &str = "ARBITER_LOG_FORMAT";
pub const LOG_FILE_ENV: &str = "ARBITER_LOG_FILE";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid log format: {0}")]
    InvalidLogFormat(String),

    #[error("failed to open log file {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another global subscriber was installed first
    #[error("tracing subscriber already set: {0}")]
    AlreadySet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl FromStr for LogLevel {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(LoggingError::InvalidLogLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

impl FromStr for LogFormat {
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "json" | "structured" => Ok(LogFormat::Json),
            other => Err(LoggingError::InvalidLogFormat(other.to_string())),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Include file and line in console output
    pub with_file_info: bool,
    /// Emit an event when a span closes
    pub with_span_events: bool,
    /// JSON log file, in addition to the console
    pub log_file: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_info(mut self, with_file_info: bool) -> Self {
        self.with_file_info = with_file_info;
        self
    }

    pub fn with_span_events(mut self, with_span_events: bool) -> Self {
        self.with_span_events = with_span_events;
        self
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// Read `ARBITER_LOG_*`. Unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(level) = std::env::var(LOG_LEVEL_ENV).ok().and_then(|s| s.parse().ok()) {
            config.level = level;
        }
        if let Some(format) = std::env::var(LOG_FORMAT_ENV).ok().and_then(|s| s.parse().ok()) {
            config.format = format;
        }
        if let Ok(path) = std::env::var(LOG_FILE_ENV) {
            if !path.trim().is_empty() {
                config.log_file = Some(PathBuf::from(path));
            }
        }
        config
    }
}

/// Initialize from the environment, ignoring failures. Idempotent.
///
/// ```ignore
/// device_arbiter::logging::init_logging_default();
/// tracing::info!("scheduler started");
/// ```
pub fn init_logging_default() {
    if let Err(e) = init_with_config(&LoggingConfig::from_env()) {
        eprintln!("logging disabled: {}", e);
    }
}

/// Install a global subscriber for `config`.
///
/// Only the first successful call has an effect; later calls return `Ok`.
pub fn init_with_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    TRACING_INITIALIZED
        .get_or_try_init(|| install(config))
        .map(|_| ())
}

fn install(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.level)?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::with_capacity(2);

    layers.push(match config.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(false)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
        LogFormat::Human => fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_file(config.with_file_info)
            .with_line_number(config.with_file_info)
            .with_span_events(span_events(config.with_span_events))
            .boxed(),
    });

    if let Some(path) = &config.log_file {
        let file = open_log_file(path)?;
        layers.push(
            fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_target(false)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_span_events(span_events(config.with_span_events))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| LoggingError::AlreadySet(e.to_string()))
}

fn span_events(enabled: bool) -> FmtSpan {
    if enabled {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Open `path` for appending, creating parent directories.
fn open_log_file(path: &Path) -> Result<File, LoggingError> {
    let to_err = |source| LoggingError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(to_err)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(to_err)
}

/// `RUST_LOG` first, then `ARBITER_LOG_LEVEL`, then `default_level`.
fn build_env_filter(default_level: LogLevel) -> Result<EnvFilter, LoggingError> {
    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        return EnvFilter::try_new(rust_log)
            .map_err(|e| LoggingError::InvalidLogLevel(e.to_string()));
    }
    let level = std::env::var(LOG_LEVEL_ENV)
        .ok()
        .and_then(|s| s.parse::<LogLevel>().ok())
        .unwrap_or(default_level);
    Ok(EnvFilter::new(level.as_filter_str()))
}

pub fn is_initialized() -> bool {
    TRACING_INITIALIZED.get().is_some()
}
