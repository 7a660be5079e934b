//! Error types shared across the beaconwatch crates.
//!
//! Errors are serializable so they can be forwarded to consumers (for example
//! as JSON lines from the CLI) without losing their structure.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Result type alias using BeaconwatchError as the error type.
pub type Result<T> = std::result::Result<T, BeaconwatchError>;

/// Top-level error type for configuration and I/O plumbing.
#[derive(Debug, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum BeaconwatchError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] IoError),
}

/// Errors related to configuration.
///
/// These errors occur when loading, parsing, or validating configuration files.
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ConfigError {
    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigError {
    /// Creates a file not found error.
    pub fn file_not_found(path: impl Into<String>) -> Self {
        Self::FileNotFound { path: path.into() }
    }

    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Serializable, cloneable snapshot of an I/O error.
///
/// `std::io::Error` is neither `Clone` nor `Serialize`; this keeps the kind and
/// the rendered message so a failure can be fanned out to several consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct IoError {
    pub kind: IoErrorKind,
    pub message: String,
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<&io::Error> for IoError {
    fn from(err: &io::Error) -> Self {
        Self {
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

impl From<io::Error> for BeaconwatchError {
    fn from(err: io::Error) -> Self {
        BeaconwatchError::Io(err.into())
    }
}

/// Serializable version of std::io::ErrorKind, limited to what a datagram socket reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoErrorKind {
    NotFound,
    PermissionDenied,
    ConnectionRefused,
    ConnectionReset,
    ConnectionAborted,
    NotConnected,
    AddrInUse,
    AddrNotAvailable,
    BrokenPipe,
    WouldBlock,
    InvalidInput,
    InvalidData,
    TimedOut,
    Interrupted,
    UnexpectedEof,
    Other,
}

impl From<io::ErrorKind> for IoErrorKind {
    fn from(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::NotFound => IoErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => IoErrorKind::PermissionDenied,
            io::ErrorKind::ConnectionRefused => IoErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionReset => IoErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted => IoErrorKind::ConnectionAborted,
            io::ErrorKind::NotConnected => IoErrorKind::NotConnected,
            io::ErrorKind::AddrInUse => IoErrorKind::AddrInUse,
            io::ErrorKind::AddrNotAvailable => IoErrorKind::AddrNotAvailable,
            io::ErrorKind::BrokenPipe => IoErrorKind::BrokenPipe,
            io::ErrorKind::WouldBlock => IoErrorKind::WouldBlock,
            io::ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
            io::ErrorKind::InvalidData => IoErrorKind::InvalidData,
            io::ErrorKind::TimedOut => IoErrorKind::TimedOut,
            io::ErrorKind::Interrupted => IoErrorKind::Interrupted,
            io::ErrorKind::UnexpectedEof => IoErrorKind::UnexpectedEof,
            _ => IoErrorKind::Other,
        }
    }
}
