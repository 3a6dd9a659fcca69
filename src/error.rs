//! Custom error types for the application.
//!
//! This module defines the primary error type, `ExpError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized way to report the
//! failures that can terminate a measurement, from bad operator input to a
//! dropped instrument connection.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: the caller supplied an invalid configuration (inverted
//!   frequency span, zero step, out-of-range bandwidth, ...). Never retried;
//!   fix the input and call again.
//! - **`Settings`**: wraps errors from `figment` while loading the TOML file and
//!   environment overrides.
//! - **`InstrumentFault`**: a command or query to a physical instrument failed,
//!   timed out, or returned a reading outside a physically valid range.
//! - **`Protocol`**: a reply was received but is malformed, e.g. a trace array
//!   of the wrong length. Indicates an instrument/firmware mismatch.
//! - **`SafetyLimitExceeded`**: a computed set-point would exceed the configured
//!   hard limit. The run stops before the value reaches the instrument.
//! - **`Cancelled`**: a cooperative cancellation request was honoured at a step
//!   boundary.
//! - **`Storage`** / **`Io`**: a sweep record could not be persisted.
//! - **`FeatureNotEnabled`**: functionality that was not compiled in (VISA
//!   transport) was requested.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ExpError>;

/// Coarse failure class reported to the operator when a run terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    InstrumentFault,
    Protocol,
    SafetyLimit,
    Cancelled,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::InstrumentFault => "instrument_fault",
            ErrorKind::Protocol => "protocol",
            ErrorKind::SafetyLimit => "safety_limit",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Storage => "storage",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ExpError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Settings load error: {0}")]
    Settings(#[from] figment::Error),

    #[error("Instrument fault on '{instrument}': {message}")]
    InstrumentFault { instrument: String, message: String },

    #[error("Protocol error from '{instrument}': {message}")]
    Protocol { instrument: String, message: String },

    #[error("Set-point {setpoint} exceeds hard limit {limit}")]
    SafetyLimitExceeded { setpoint: f64, limit: f64 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl ExpError {
    pub fn instrument(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        ExpError::InstrumentFault {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    pub fn protocol(instrument: impl Into<String>, message: impl Into<String>) -> Self {
        ExpError::Protocol {
            instrument: instrument.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        ExpError::Config(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ExpError::Config(_) | ExpError::Settings(_) | ExpError::FeatureNotEnabled(_) => {
                ErrorKind::Config
            }
            ExpError::InstrumentFault { .. } => ErrorKind::InstrumentFault,
            ExpError::Protocol { .. } => ErrorKind::Protocol,
            ExpError::SafetyLimitExceeded { .. } => ErrorKind::SafetyLimit,
            ExpError::Cancelled => ErrorKind::Cancelled,
            ExpError::Storage(_) | ExpError::Io(_) => ErrorKind::Storage,
        }
    }
}

impl From<csv::Error> for ExpError {
    fn from(err: csv::Error) -> Self {
        ExpError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for ExpError {
    fn from(err: serde_json::Error) -> Self {
        ExpError::Storage(format!("metadata serialization failed: {}", err))
    }
}
