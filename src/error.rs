//! Error handling for the prefork core.
//!
//! Every error carries a structured [`ErrorCode`] for programmatic handling and
//! metrics, a human-readable message and, where one exists, the underlying
//! source error.
//!
//! # Error Taxonomy
//!
//! * **Fatal startup errors**: a listener cannot be bound, the admission gate
//!   cannot be created, or the configuration is malformed. These abort
//!   [`Server::run`](crate::Server::run) before any connection is accepted.
//! * **Transient accept errors**: never surface as an [`Error`]; they are logged
//!   and the accept loop continues.
//! * **Worker death**: recovered by the supervisor, reported only through logs.
//! * **Stuck connections**: recovered inside the worker by the watchdog.
//!
//! # Usage
//!
//! ```no_run
//! use proc_prefork::{Error, Result};
//! use std::fs::File;
//!
//! fn open_status_file(path: &str) -> Result<File> {
//!     File::open(path).map_err(|err| {
//!         Error::io_with_source(format!("Failed to open status file: {path}"), err)
//!     })
//! }
//! ```

use std::net::SocketAddr;

/// Result type alias for prefork operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error code enum for categorizing and identifying errors
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[non_exhaustive]
pub enum ErrorCode {
    // Configuration errors: 1000-1999
    ConfigInvalid = 1000,
    ConfigParse = 1001,
    ConfigMissing = 1002,

    // Signal handling errors: 2000-2999
    SignalRegisterFailed = 2000,
    SignalSendFailed = 2001,

    // Listener errors: 3000-3999
    ListenerBind = 3000,
    ListenerSocket = 3001,
    ListenerEmpty = 3002,

    // Admission gate errors: 4000-4999
    AdmissionLockFile = 4000,
    AdmissionLockHeld = 4001,

    // Status table errors: 5000-5999
    SlotOutOfRange = 5000,
    ScoreboardPersist = 5001,

    // Worker errors: 6000-6999
    WorkerPanic = 6000,
    MissingRuntime = 6002,

    // IO errors: 7000-7999
    IoError = 7000,

    // Timeout errors: 8000-8999
    TimeoutOperation = 8000,
    TimeoutConnection = 8001,

    // State errors: 9000-9999
    InvalidStateValue = 9001,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.as_str(), *self as i32)
    }
}

impl ErrorCode {
    /// Convert error code to string representation
    pub const fn as_str(self) -> &'static str {
        match self {
            // Configuration errors
            Self::ConfigInvalid => "CONFIG_INVALID",
            Self::ConfigParse => "CONFIG_PARSE",
            Self::ConfigMissing => "CONFIG_MISSING",

            // Signal errors
            Self::SignalRegisterFailed => "SIGNAL_REGISTER_FAILED",
            Self::SignalSendFailed => "SIGNAL_SEND_FAILED",

            // Listener errors
            Self::ListenerBind => "LISTENER_BIND",
            Self::ListenerSocket => "LISTENER_SOCKET",
            Self::ListenerEmpty => "LISTENER_EMPTY",

            // Admission errors
            Self::AdmissionLockFile => "ADMISSION_LOCK_FILE",
            Self::AdmissionLockHeld => "ADMISSION_LOCK_HELD",

            // Status table errors
            Self::SlotOutOfRange => "SLOT_OUT_OF_RANGE",
            Self::ScoreboardPersist => "SCOREBOARD_PERSIST",

            // Worker errors
            Self::WorkerPanic => "WORKER_PANIC",
            Self::MissingRuntime => "MISSING_RUNTIME",

            // IO errors
            Self::IoError => "IO_ERROR",

            // Timeout errors
            Self::TimeoutOperation => "TIMEOUT_OPERATION",
            Self::TimeoutConnection => "TIMEOUT_CONNECTION",

            // State errors
            Self::InvalidStateValue => "INVALID_STATE_VALUE",
        }
    }
}

/// Error type for all prefork operations.
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration loading or validation errors
    #[error("Configuration error [{code}]: {message}")]
    Config {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Signal handling errors
    #[error("Signal handling error [{code}]: {message}{signal:?}")]
    Signal {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Signal number if applicable
        signal: Option<i32>,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Listening socket errors
    #[error("Listener error [{code}] on {address:?}: {message}")]
    Listener {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Address that failed, if any
        address: Option<SocketAddr>,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Admission gate errors
    #[error("Admission gate error [{code}]: {message}")]
    Admission {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Status table errors
    #[error("Scoreboard error [{code}]: {message}{slot:?}")]
    Scoreboard {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Slot index if applicable
        slot: Option<usize>,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Worker lifecycle errors
    #[error("Worker error [{code}]: {message}")]
    Worker {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// I/O operation errors
    #[error("I/O error [{code}]: {message}")]
    Io {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Timeout errors
    #[error("Operation timed out [{code}] after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },

    /// Invalid state errors
    #[error("Invalid state [{code}]: {message}")]
    InvalidState {
        /// Error code for structured error handling
        code: ErrorCode,
        /// Human-readable error message
        message: String,
        /// Optional source error for better context
        #[source]
        #[cfg_attr(feature = "serde", serde(skip))]
        source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
    },
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            code: ErrorCode::ConfigInvalid,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new configuration error with specific code and source.
    pub fn config_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        code: ErrorCode,
        message: S,
        source: E,
    ) -> Self {
        Self::Config {
            code,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new signal error with signal number.
    pub fn signal_with_number<S: Into<String>>(message: S, signal: i32) -> Self {
        Self::Signal {
            code: ErrorCode::SignalRegisterFailed,
            message: message.into(),
            signal: Some(signal),
            source: None,
        }
    }

    /// Create a new signal error with specific code.
    pub fn signal_with_code<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self::Signal {
            code,
            message: message.into(),
            signal: None,
            source: None,
        }
    }

    /// Create a new listener error.
    pub fn listener<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self::Listener {
            code,
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new listener error for an address, with source.
    pub fn listener_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        address: SocketAddr,
        message: S,
        source: E,
    ) -> Self {
        Self::Listener {
            code: ErrorCode::ListenerBind,
            message: message.into(),
            address: Some(address),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new admission gate error.
    pub fn admission<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self::Admission {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new admission gate error with source.
    pub fn admission_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Admission {
            code: ErrorCode::AdmissionLockFile,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an error for a status table write outside the table.
    pub fn slot_out_of_range(slot: usize, limit: usize) -> Self {
        Self::Scoreboard {
            code: ErrorCode::SlotOutOfRange,
            message: format!("slot index outside table of {limit} entries: "),
            slot: Some(slot),
            source: None,
        }
    }

    /// Create a new status table error with source.
    pub fn scoreboard_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Scoreboard {
            code: ErrorCode::ScoreboardPersist,
            message: message.into(),
            slot: None,
            source: Some(Box::new(source)),
        }
    }

    /// Create a new worker error.
    pub fn worker<S: Into<String>>(code: ErrorCode, message: S) -> Self {
        Self::Worker {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new I/O error.
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            code: ErrorCode::IoError,
            message: message.into(),
            source: None,
        }
    }

    /// Create a new I/O error with source.
    pub fn io_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Io {
            code: ErrorCode::IoError,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new timeout error.
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            code: ErrorCode::TimeoutOperation,
            operation: operation.into(),
            timeout_ms,
            source: None,
        }
    }

    /// Create a timeout error for a connection abandoned by its watchdog.
    pub fn connection_timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            code: ErrorCode::TimeoutConnection,
            operation: operation.into(),
            timeout_ms,
            source: None,
        }
    }

    /// Create a new invalid state error.
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            code: ErrorCode::InvalidStateValue,
            message: message.into(),
            source: None,
        }
    }

    /// Get the structured error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Config { code, .. }
            | Self::Signal { code, .. }
            | Self::Listener { code, .. }
            | Self::Admission { code, .. }
            | Self::Scoreboard { code, .. }
            | Self::Worker { code, .. }
            | Self::Io { code, .. }
            | Self::Timeout { code, .. }
            | Self::InvalidState { code, .. } => *code,
        }
    }

    /// Check if this error must abort the server before it accepts connections.
    #[must_use]
    pub const fn is_fatal_startup(&self) -> bool {
        matches!(
            self,
            Self::Config { .. } | Self::Listener { .. } | Self::Admission { .. } | Self::Signal { .. }
        )
    }

    /// Check if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is configuration-related.
    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::Config { .. })
    }

    /// Get the error category for metrics/logging.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Signal { .. } => "signal",
            Self::Listener { .. } => "listener",
            Self::Admission { .. } => "admission",
            Self::Scoreboard { .. } => "scoreboard",
            Self::Worker { .. } => "worker",
            Self::Io { .. } => "io",
            Self::Timeout { .. } => "timeout",
            Self::InvalidState { .. } => "state",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::io_with_source("I/O operation failed", err)
    }
}

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::config_with_source(ErrorCode::ConfigParse, "Configuration loading failed", err)
    }
}

#[cfg(feature = "toml")]
impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source(ErrorCode::ConfigParse, "TOML parsing failed", err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::scoreboard_with_source("Status table serialization failed", err)
    }
}

/// Helper macro for creating errors with formatted messages.
#[macro_export]
macro_rules! prefork_error {
    ($kind:ident, $($arg:tt)*) => {
        $crate::Error::$kind(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::config("test message");
        assert!(err.is_config_error());
        assert!(err.is_fatal_startup());
        assert_eq!(err.category(), "config");
        assert_eq!(err.code(), ErrorCode::ConfigInvalid);
    }

    #[test]
    fn test_slot_out_of_range() {
        let err = Error::slot_out_of_range(300, 256);
        assert_eq!(err.code(), ErrorCode::SlotOutOfRange);
        assert_eq!(err.category(), "scoreboard");
        assert!(!err.is_fatal_startup());
        assert!(err.to_string().contains("SLOT_OUT_OF_RANGE(5000)"));
        assert!(err.to_string().contains("300"));
    }

    #[test]
    fn test_listener_error_keeps_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let err = Error::listener_with_source(addr, "bind failed", io_err);
        assert!(err.is_fatal_startup());
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains("127.0.0.1:8080"));
    }

    #[test]
    fn test_timeout_error() {
        let err = Error::timeout("reclaim", 3000);
        assert!(err.is_timeout());
        assert_eq!(err.code(), ErrorCode::TimeoutOperation);
        assert_eq!(err.category(), "timeout");
    }

    #[test]
    fn test_error_macro() {
        let err = prefork_error!(io, "failed after {} tries", 3);
        assert_eq!(err.category(), "io");
        assert!(err.to_string().contains("failed after 3 tries"));
    }
}
