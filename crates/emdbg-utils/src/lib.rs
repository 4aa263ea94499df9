//! # emdbg Utilities
//!
//! Logging setup shared by the emdbg tools.
//!
//! Library crates of the workspace only emit `tracing` events; binaries call
//! one of the `init_logging*` functions once at start-up.

pub mod logging;

pub use logging::{
    init_logging, init_logging_with_config, init_logging_with_level, LogFormat, LogLevel, LoggingConfig, LoggingError,
    LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
