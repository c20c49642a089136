//! Error types for the acquisition driver.
//!
//! Errors are defined per component with `thiserror` and folded into the
//! session-level [`SessionError`] that the streaming node surfaces upstream.
//!
//! ## Error Hierarchy
//!
//! - **`DeviceError`**: failures of the native platform surface (open, read,
//!   configure, tare, status). Open/disconnect failures are fatal to the
//!   session; timeouts are transient and handled by the diagnostics retry
//!   budget.
//! - **`PersistenceError`**: configuration save/load failures. Always a
//!   warning: a failed save never keeps the device from closing.
//! - **`ZeroError`**: tare timeout or rejection. Recoverable; streaming
//!   continues with the previous offset.
//! - **`SessionError`**: the taxonomy the [`crate::node::StreamingNode`]
//!   reports. Use [`SessionError::kind`] / [`SessionError::is_fatal`] to
//!   decide whether the session must end.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Convenience alias for results using the session error type.
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by the native platform surface.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    /// No platform answered at the requested index/serial.
    #[error("Force platform not found: {message}")]
    NotFound { message: String },

    /// The native resource is already claimed by another handle.
    #[error("Force platform '{serial}' is busy (already claimed by another handle)")]
    Busy { serial: String },

    /// The vendor library could not be loaded or did not initialise.
    #[error("Driver mismatch: {message}")]
    DriverMismatch { message: String },

    /// The platform went away mid-session.
    #[error("Force platform disconnected: {message}")]
    Disconnected { message: String },

    /// A bounded native operation did not complete in time.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The platform refused a command or configuration.
    #[error("Force platform rejected {operation}: {message}")]
    Rejected {
        operation: &'static str,
        message: String,
    },

    /// The handle was used after `close()`.
    #[error("Device handle for '{serial}' is closed")]
    Closed { serial: String },

    /// A requested setting is outside what the platform supports.
    #[error("Unsupported setting: {message}")]
    Unsupported { message: String },
}

impl DeviceError {
    /// Whether this error ends the current session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout { .. } | Self::Rejected { .. })
    }

    /// Check if this is a "device not found" type error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if the device is busy.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }
}

/// Errors from the configuration store.
#[derive(Error, Debug)]
pub enum PersistenceError {
    /// Reading, writing or renaming a configuration file failed.
    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be encoded.
    #[error("Failed to encode device configuration: {0}")]
    Encode(#[from] toml::ser::Error),

    /// A persisted file exists but is not a valid configuration record.
    #[error("Failed to parse '{}': {message}", path.display())]
    Parse { path: PathBuf, message: String },
}

impl PersistenceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Outcome errors of a zero (tare) episode.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ZeroError {
    /// The platform did not acknowledge the tare in time.
    #[error("Tare not acknowledged within {0:?}")]
    Timeout(Duration),

    /// The platform reported the tare as rejected.
    #[error("Tare rejected by platform: {0}")]
    Rejected(String),
}

/// Broad classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Device not found, already claimed, disconnected, or diagnostics faulted.
    Connection,
    /// Persisted configuration incompatible with the connected hardware.
    ConfigMismatch,
    /// A single missed or late read; recovered by the retry budget.
    TransientRead,
    /// Tare timeout or rejection.
    Zero,
    /// Configuration save/load failure.
    Persistence,
    /// Invalid node options.
    Options,
    /// Start/stop called in the wrong state.
    Lifecycle,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Connection => "connection",
            ErrorKind::ConfigMismatch => "config_mismatch",
            ErrorKind::TransientRead => "transient_read",
            ErrorKind::Zero => "zero",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Options => "options",
            ErrorKind::Lifecycle => "lifecycle",
        };
        write!(f, "{}", label)
    }
}

/// Session-level error surfaced by the streaming node.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Fatal connection problem; the session is torn down.
    #[error("Connection error: {0}")]
    Connection(DeviceError),

    /// The diagnostics monitor exhausted its retry budget.
    #[error("Diagnostics faulted after {consecutive_faults} consecutive faults: {last_fault}")]
    DiagnosticsFaulted {
        consecutive_faults: u32,
        last_fault: String,
    },

    /// Persisted or requested configuration does not fit the platform.
    #[error("Configuration mismatch for platform '{serial}': {message}")]
    ConfigMismatch { serial: String, message: String },

    /// A recoverable read problem.
    #[error("Transient read fault: {0}")]
    TransientRead(DeviceError),

    /// Zero calibration failed; streaming continues.
    #[error("Zero calibration failed: {0}")]
    Zero(#[from] ZeroError),

    /// Configuration persistence failed.
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Options failed validation.
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// Options could not be extracted from file/environment.
    #[error("Failed to load options: {0}")]
    OptionsLoad(#[from] Box<figment::Error>),

    /// `start()` called on a running node.
    #[error("Streaming node is already running")]
    AlreadyRunning,

    /// `stop()` or a control call on a node that is not running.
    #[error("Streaming node is not running")]
    NotRunning,
}

impl SessionError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) | SessionError::DiagnosticsFaulted { .. } => {
                ErrorKind::Connection
            }
            SessionError::ConfigMismatch { .. } => ErrorKind::ConfigMismatch,
            SessionError::TransientRead(_) => ErrorKind::TransientRead,
            SessionError::Zero(_) => ErrorKind::Zero,
            SessionError::Persistence(_) => ErrorKind::Persistence,
            SessionError::InvalidOptions(_) | SessionError::OptionsLoad(_) => ErrorKind::Options,
            SessionError::AlreadyRunning | SessionError::NotRunning => ErrorKind::Lifecycle,
        }
    }

    /// Whether the error ends (or prevents) the session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::ConfigMismatch | ErrorKind::Options
        )
    }
}

impl From<DeviceError> for SessionError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::Timeout { .. } => SessionError::TransientRead(err),
            DeviceError::Unsupported { message } => SessionError::InvalidOptions(message),
            other => SessionError::Connection(other),
        }
    }
}

impl From<figment::Error> for SessionError {
    fn from(err: figment::Error) -> Self {
        SessionError::OptionsLoad(Box::new(err))
    }
}
