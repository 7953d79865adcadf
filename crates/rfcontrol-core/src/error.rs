//! Error types
//!
//! Every failure in the core maps onto one of four categories. None of them
//! abort processing: codecs log and keep scanning, connectors log and drop the
//! write, and public device operations hand the error back to the caller.

use thiserror::Error;

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing connector, malformed settings, unknown kinds
    Configuration,
    /// Connect failure, write while disconnected, I/O errors
    Transport,
    /// Checksum mismatch, malformed or rejected frames, out-of-range fields
    Protocol,
    /// A command was dropped after the maximum number of negative acknowledgments
    RetryExhausted,
}

/// Errors that can occur while talking to a device
#[derive(Error, Debug)]
pub enum Error {
    /// The device has no connector installed
    #[error("No connector set up")]
    NoConnector,

    /// A setting is present but unusable
    #[error("Invalid value for '{key}': {message}")]
    InvalidSetting {
        /// Setting key
        key: String,
        /// What is wrong with the value
        message: String,
    },

    /// Connector kind name not recognized
    #[error("Unknown connector type: {0}")]
    UnknownConnector(String),

    /// Device kind name not recognized
    #[error("Unknown device type: {0}")]
    UnknownDevice(String),

    /// The transport could not be opened
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Error reported by the serial port driver
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Socket or file I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A complete frame failed its checksum
    #[error("Checksum mismatch in frame {frame}")]
    ChecksumMismatch {
        /// Frame bytes in hex
        frame: String,
    },

    /// Bytes that cannot form a valid frame or reply
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A value outside what the device accepts
    #[error("{what} outside the range [{min}, {max}], got {value}")]
    OutOfRange {
        /// Name of the value
        what: &'static str,
        /// Rejected value
        value: i64,
        /// Lowest accepted value
        min: i64,
        /// Highest accepted value
        max: i64,
    },

    /// Mode not supported by this device
    #[error("Unsupported mode: {0}")]
    UnsupportedMode(String),

    /// A reply field could not be read
    #[error("Parse error: {0}")]
    Parse(String),

    /// The device answered a command with a refusal
    #[error("Command '{0}' was rejected by the device")]
    CommandRejected(String),

    /// A command was dropped after too many negative acknowledgments
    #[error("Command {command} unsuccessful after {attempts} attempts")]
    RetryExhausted {
        /// Frame bytes in hex
        command: String,
        /// Attempts made
        attempts: u32,
    },
}

impl Error {
    /// Map this error onto its category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::NoConnector
            | Error::InvalidSetting { .. }
            | Error::UnknownConnector(_)
            | Error::UnknownDevice(_) => ErrorCategory::Configuration,
            Error::ConnectionFailed(_) | Error::Serial(_) | Error::Io(_) => {
                ErrorCategory::Transport
            }
            Error::ChecksumMismatch { .. }
            | Error::MalformedFrame(_)
            | Error::OutOfRange { .. }
            | Error::UnsupportedMode(_)
            | Error::Parse(_)
            | Error::CommandRejected(_) => ErrorCategory::Protocol,
            Error::RetryExhausted { .. } => ErrorCategory::RetryExhausted,
        }
    }
}

impl From<serialport::Error> for Error {
    fn from(e: serialport::Error) -> Self {
        Error::Serial(e.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
