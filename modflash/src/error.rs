//! Error types for modflash.

use std::io;
use thiserror::Error;

/// Result type for modflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for modflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The port could not be opened at any of the negotiated baud rates.
    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable {
        /// Port name/path.
        port: String,
        /// Error reported by the last open attempt.
        reason: String,
    },

    /// Bad or absent HELLO reply from the bootloader.
    #[error("Protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The bootloader reported a maximum payload below the required minimum.
    #[error("Programmer reports {reported} as maximum payload size ({required} is needed)")]
    PayloadTooSmall {
        /// Size reported by the device.
        reported: u16,
        /// Minimum size required.
        required: u16,
    },

    /// Expected `OK` acknowledgment was not received.
    #[error("Missing ack on {operation}: got {received:?}")]
    AckMissing {
        /// Operation that was waiting for the ack (erase, write, read, checksum).
        operation: &'static str,
        /// Bytes received in place of the ack.
        received: Vec<u8>,
    },

    /// Data read back from flash differs from what was written.
    #[error("Flash data does not match written data at offset {offset:#x}")]
    VerifyMismatch {
        /// Absolute flash offset of the first differing byte.
        offset: u32,
    },

    /// Device-computed digest differs from the locally computed one.
    #[error("Integrity check failed: device {device}, expected {expected}")]
    IntegrityFailure {
        /// Hex digest reported by the device.
        device: String,
        /// Hex digest computed over the source buffer.
        expected: String,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An expected AT response never arrived; carries what was received.
    #[error("Timeout waiting for {expected:?}, got {received:?}")]
    ResponseTimeout {
        /// Substring that was expected.
        expected: String,
        /// Everything received before the deadline.
        received: String,
    },

    /// Unsupported module identifier.
    #[error("Unknown module: {0}")]
    UnknownModule(String),

    /// Certificate could not be loaded or converted.
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// TLS handshake used to scrape a certificate failed.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Encoded certificate region exceeds the module's limit.
    #[error("Certificates data {size} exceeds limit of {limit} bytes")]
    CertificatesTooLarge {
        /// Encoded size.
        size: usize,
        /// Region capacity.
        limit: usize,
    },

    /// External programmer failed.
    #[error("Error during loader flashing: {0}")]
    Programmer(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Unsupported module or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation interrupted through a cancel token.
    #[error("Operation cancelled")]
    Cancelled,

    /// All upload attempts failed.
    #[error("Operation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the final attempt.
        #[source]
        last: Box<Error>,
    },
}

impl Error {
    /// Whether a retry of the whole upload sequence may succeed.
    ///
    /// Cancellation and bad input never improve on retry.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Cancelled
                | Self::UnknownModule(_)
                | Self::CertificatesTooLarge { .. }
                | Self::Unsupported(_)
                | Self::Config(_)
        )
    }

    /// Whether this error (or the final error of an exhausted retry) is a timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::ResponseTimeout { .. } => true,
            Self::RetriesExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}
