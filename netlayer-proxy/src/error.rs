//! Error types for layer operations

use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LayerError>;

#[derive(Debug, Error)]
pub enum LayerError {
    #[error("{layer} layer does not support {operation}")]
    Unsupported {
        layer: &'static str,
        operation: &'static str,
    },

    #[error("Connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    #[error("Layer {layer} not ready after {waited:?}")]
    NotReady { layer: String, waited: Duration },

    #[error("Invalid control parameters: {0}")]
    InvalidParameters(String),

    #[error("SOCKS protocol error: {0}")]
    Socks(#[from] SocksError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl LayerError {
    /// Closest `io::ErrorKind` for this error, used when a protocol needs to
    /// pick a reply code for a failed downstream connect.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            LayerError::Io(e) => e.kind(),
            LayerError::ConnectTimeout { .. } => io::ErrorKind::TimedOut,
            LayerError::Unsupported { .. } => io::ErrorKind::Unsupported,
            LayerError::NotReady { .. } => io::ErrorKind::NotConnected,
            LayerError::Socks(SocksError::ConnectFailed { kind, .. }) => *kind,
            LayerError::InvalidParameters(_) | LayerError::Socks(_) => io::ErrorKind::Other,
        }
    }
}

impl From<LayerError> for io::Error {
    fn from(err: LayerError) -> Self {
        match err {
            LayerError::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }
}

/// Failures while negotiating a SOCKS session
#[derive(Debug, Error)]
pub enum SocksError {
    #[error("Unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("Unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported SOCKS5 address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("Invalid destination domain name")]
    InvalidDomain,

    #[error("Truncated SOCKS message")]
    Truncated,

    #[error("Client I/O error: {0}")]
    ClientIo(#[source] io::Error),

    #[error("Connect to {target} failed: {message}")]
    ConnectFailed {
        target: String,
        kind: io::ErrorKind,
        message: String,
    },
}

/// Limit violation posted by the control watchdog.
///
/// Surfaced to readers and writers as an `io::Error` of kind `TimedOut`
/// whose inner error downcasts to this type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ControlViolation {
    #[error("overall timeout: connection open for {elapsed:?}, limit {limit:?}")]
    OverallTimeout { limit: Duration, elapsed: Duration },

    #[error("throughput too low: {transferred} bytes in {window:?}, minimum {minimum}")]
    ThroughputTooLow {
        window: Duration,
        transferred: u64,
        minimum: u64,
    },
}

impl ControlViolation {
    pub fn to_io_error(&self) -> io::Error {
        io::Error::new(io::ErrorKind::TimedOut, self.clone())
    }

    /// Recover the violation from an error raised by a controlled stream
    pub fn from_io_error(err: &io::Error) -> Option<&ControlViolation> {
        err.get_ref()?.downcast_ref::<ControlViolation>()
    }
}
