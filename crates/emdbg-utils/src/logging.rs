//! # Logging Utilities
//!
//! Logging for the emdbg tools, built on `tracing`.
//!
//! Console output goes to stderr so that command output on stdout stays
//! machine readable. A copy can be written to a daily rolling file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use emdbg_utils::init_logging;
//!
//! // Reads RUST_LOG, EMDBG_LOG_FORMAT and EMDBG_LOG_FILE
//! let _guard = init_logging().expect("Failed to initialize logging");
//! tracing::info!("Loaded debug information");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: level or filter directives (e.g. `RUST_LOG=emdbg_core=trace`)
//! - `EMDBG_LOG_FORMAT`: `pretty` (default) or `json`
//! - `EMDBG_LOG_FILE`: optional log file path; the date is appended per day
//!
//! Keep the returned [`LoggingGuard`] alive until the program exits, or
//! buffered file output is lost.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format
pub const LOG_FORMAT_VAR: &str = "EMDBG_LOG_FORMAT";
/// Environment variable naming the log file
pub const LOG_FILE_VAR: &str = "EMDBG_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat
{
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event, with span context
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(s.to_string())),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Error,
    Warn,
    Info,
    Debug,
    /// Per-DIE and per-opcode detail
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(s.to_string())),
        }
    }
}

/// Where and how to log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig
{
    /// Overrides `RUST_LOG` when set
    pub level: Option<LogLevel>,
    pub format: LogFormat,
    /// Base path of the rolling log file
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Configuration from `EMDBG_LOG_FORMAT` and `EMDBG_LOG_FILE`
    ///
    /// ## Errors
    ///
    /// `InvalidFormat` if `EMDBG_LOG_FORMAT` holds an unknown format.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        let format = match env::var(LOG_FORMAT_VAR) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        };
        Ok(Self {
            level: None,
            format,
            file: env::var_os(LOG_FILE_VAR).map(PathBuf::from),
        })
    }

    /// Filter for this configuration; `rust_log` is the value of `RUST_LOG`
    ///
    /// An explicit level wins, then valid `RUST_LOG` directives, then `info`.
    fn filter(&self, rust_log: Option<&str>) -> EnvFilter
    {
        if let Some(level) = self.level {
            return EnvFilter::new(Level::from(level).to_string());
        }
        rust_log
            .and_then(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(Level::INFO.to_string()))
    }
}

/// Keeps the background file writer running
#[derive(Debug, Default)]
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard
{
    _file_writer: Option<WorkerGuard>,
}

/// Initialize logging from the environment
///
/// ## Errors
///
/// Invalid `EMDBG_LOG_FORMAT`, or a global subscriber is already installed.
pub fn init_logging() -> Result<LoggingGuard, LoggingError>
{
    init_logging_with_config(&LoggingConfig::from_env()?)
}

/// Initialize logging with an explicit level and format
///
/// `EMDBG_LOG_FILE` is still honoured.
///
/// ## Example
///
/// ```rust,no_run
/// use emdbg_utils::{init_logging_with_level, LogFormat, LogLevel};
///
/// let _guard = init_logging_with_level(LogLevel::Debug, LogFormat::Json).expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// A global subscriber is already installed.
pub fn init_logging_with_level(level: LogLevel, format: LogFormat) -> Result<LoggingGuard, LoggingError>
{
    init_logging_with_config(&LoggingConfig {
        level: Some(level),
        format,
        file: env::var_os(LOG_FILE_VAR).map(PathBuf::from),
    })
}

/// Initialize logging from `config`
///
/// ## Errors
///
/// `InitializationFailed` if a global subscriber is already installed.
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError>
{
    let rust_log = env::var("RUST_LOG").ok();
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format, config.filter(rust_log.as_deref()))];

    let mut guard = LoggingGuard::default();
    if let Some(path) = &config.file {
        let (layer, writer_guard) = file_layer(path, config.format, config.filter(rust_log.as_deref()));
        layers.push(layer);
        guard._file_writer = Some(writer_guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|error| LoggingError::InitializationFailed(error.to_string()))?;
    tracing::debug!(format = ?config.format, file = ?config.file, "Logging initialized");
    Ok(guard)
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter) -> (BoxedLayer, WorkerGuard)
{
    let directory = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().unwrap_or_else(|| "emdbg.log".as_ref());
    let appender = tracing_appender::rolling::daily(directory, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(writer)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_timer(ChronoUtc::rfc_3339())
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    };
    (layer, guard)
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    #[error("Unknown log format {0:?}, use 'pretty' or 'json'")]
    InvalidFormat(String),

    #[error("Unknown log level {0:?}, use 'error', 'warn', 'info', 'debug' or 'trace'")]
    InvalidLevel(String),

    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}
