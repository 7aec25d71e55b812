//! # DSMR Error Handling
//!
//! This module defines the error types used by the dsmr-rs crate:
//!
//! - [`DsmrError`] is returned from fallible crate operations.
//! - [`TelegramError`] describes why a single telegram was rejected.
//! - [`ErrorStatus`] is the category reported to telegram listeners and the
//!   bridge status; it is what an operator sees.

use crate::telegram::smarty::CryptoError;
use thiserror::Error;

/// Represents the different error types that can occur in the DSMR crate.
#[derive(Debug, Error)]
pub enum DsmrError {
    /// Indicates invalid or incomplete configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Indicates a telegram that could not be decoded.
    #[error("Telegram error: {0}")]
    Telegram(#[from] TelegramError),

    /// Indicates a Smarty decryption problem.
    #[error("Decryption error: {0}")]
    Crypto(#[from] CryptoError),

    /// Indicates an I/O error, e.g. while reading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Indicates the device was used in a state that does not allow it.
    #[error("Device error: {0}")]
    Device(String),
}

/// Reasons a single telegram is rejected by the parser.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TelegramError {
    #[error("CRC mismatch: expected {expected:04X}, calculated {calculated:04X}")]
    CrcMismatch { expected: u16, calculated: u16 },

    #[error("Invalid CRC digits: {0:?}")]
    InvalidCrc(String),

    #[error("Telegram exceeds {limit} bytes")]
    Overflow { limit: usize },

    #[error("Malformed line: {0}")]
    MalformedLine(String),

    #[error("Invalid value for {obis}: {reason}")]
    InvalidValue { obis: String, reason: String },

    #[error("Unknown OBIS identifier: {0}")]
    UnknownObject(String),

    #[error("Telegram has no header line")]
    MissingHeader,

    #[error("Invalid encrypted frame: {0}")]
    InvalidFrame(String),

    #[error("Encrypted frame failed authentication")]
    AuthenticationFailed,

    #[error("Incomplete telegram")]
    Incomplete,
}

/// Error categories reported to listeners.
///
/// Only [`ErrorStatus::InvalidDecryptionKey`] is fatal; all other categories
/// are transient and the pipeline recovers by itself (resync or restart).
#[derive(Debug, Error, Clone, PartialEq, Eq, serde::Serialize)]
pub enum ErrorStatus {
    /// The configured serial port does not exist.
    #[error("serial port does not exist")]
    PortDoesNotExist,
    /// The serial port is owned by another process.
    #[error("serial port is in use")]
    PortInUse,
    /// The device is not a serial port or refuses the settings.
    #[error("port is not a compatible serial port")]
    PortNotCompatible,
    /// Opening the port failed for another reason.
    #[error("opening port failed: {0}")]
    PortOpenFailed(String),
    /// None of the serial settings produced a telegram.
    #[error("no serial port settings produced a telegram")]
    PortSettingsDetectionFailed,
    /// Connecting to a P1 gateway over TCP failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Reading from the connection failed or the peer closed it.
    #[error("reading data failed: {0}")]
    SerialDataReadError(String),
    /// No telegram was received within the timeout.
    #[error("no telegram received")]
    TelegramNoData,
    /// Telegram rejected because of a checksum mismatch.
    #[error("telegram CRC mismatch")]
    TelegramCrcError,
    /// Telegram rejected because of malformed content or framing.
    #[error("corrupt telegram: {0}")]
    TelegramDataCorruption(String),
    /// Telegram received but no supported meter in it.
    #[error("no supported meter in telegram")]
    UnsupportedMeter,
    /// Smarty frames cannot be decrypted with the configured key.
    #[error("invalid decryption key")]
    InvalidDecryptionKey,
}

impl ErrorStatus {
    /// Fatal errors stop the reader; they need a configuration change.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ErrorStatus::InvalidDecryptionKey)
    }

    /// Errors that mean the link itself is down, as opposed to bad telegrams.
    pub fn is_communication_error(&self) -> bool {
        matches!(
            self,
            ErrorStatus::PortDoesNotExist
                | ErrorStatus::PortInUse
                | ErrorStatus::PortNotCompatible
                | ErrorStatus::PortOpenFailed(_)
                | ErrorStatus::PortSettingsDetectionFailed
                | ErrorStatus::ConnectionFailed(_)
                | ErrorStatus::SerialDataReadError(_)
                | ErrorStatus::TelegramNoData
        )
    }
}

impl From<&TelegramError> for ErrorStatus {
    fn from(err: &TelegramError) -> Self {
        match err {
            TelegramError::CrcMismatch { .. } => ErrorStatus::TelegramCrcError,
            other => ErrorStatus::TelegramDataCorruption(other.to_string()),
        }
    }
}
