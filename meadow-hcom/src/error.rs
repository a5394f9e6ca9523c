//! Error types for meadow-hcom.
//!
//! Each layer has its own taxonomy: [`FrameError`] for the codec,
//! [`TransportError`] for a serial session, [`TransferError`] for the file
//! transfer pipeline and [`DiscoveryError`] for USB context misuse. The
//! crate-level [`Error`] wraps all of them for the typed device commands.

use std::{io, time::Duration};
use thiserror::Error;

/// Result type for meadow-hcom operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A frame could not be decoded. Always recovered by discarding the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Frame ended before a complete header and checksum were read.
    #[error("truncated frame: {len} bytes")]
    Truncated {
        /// Number of unescaped bytes available.
        len: usize,
    },

    /// Trailing checksum does not match header and payload.
    #[error("frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumInvalid {
        /// Checksum carried by the frame.
        expected: u16,
        /// Checksum computed over the received bytes.
        actual: u16,
    },

    /// Header payload length disagrees with the bytes actually received.
    #[error("payload length mismatch: header says {declared}, frame carries {actual}")]
    LengthMismatch {
        /// Length declared in the header.
        declared: usize,
        /// Length of the received payload.
        actual: usize,
    },

    /// An escape byte was followed by something other than a valid substitute.
    #[error("invalid escape sequence at offset {offset}")]
    InvalidEscape {
        /// Offset of the escape byte inside the frame body.
        offset: usize,
    },

    /// Header type code is not a known response type.
    #[error("unknown response type {0:#06x}")]
    UnknownType(u16),

    /// Payload does not fit in a single frame.
    #[error("payload of {len} bytes exceeds frame limit of {max}")]
    PayloadTooLarge {
        /// Requested payload length.
        len: usize,
        /// Maximum payload length per frame.
        max: usize,
    },
}

/// A request on an open session failed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Another request is already awaiting its response on this session.
    #[error("session busy: a request is already in flight")]
    Busy,

    /// No matching response arrived within the request timeout.
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The serial connection is gone; the session cannot be used again.
    #[error("serial port closed")]
    PortClosed,

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// The response frame for this request was corrupted.
    #[error("corrupted response: {0}")]
    Frame(#[from] FrameError),

    /// Writing to the port failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether a retry policy may re-issue the request.
    ///
    /// Timeouts and corrupted response frames are transient on a serial line.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Frame(FrameError::ChecksumInvalid { .. })
        )
    }
}

/// A file transfer did not complete.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Reading the source file failed.
    #[error("cannot read source file: {0}")]
    Io(#[from] io::Error),

    /// A step exhausted its retries; carries the last transport failure.
    #[error("transfer aborted: {0}")]
    Aborted(#[source] TransportError),

    /// The source file changed size after its checksum was computed.
    #[error("source file changed during transfer: expected {expected} bytes, found {actual}")]
    SourceChanged {
        /// Size at checksum time.
        expected: u64,
        /// Size observed while sending.
        actual: u64,
    },

    /// The device refused a transfer step.
    #[error("device rejected transfer: {0}")]
    DeviceRejected(String),

    /// The transfer ran past its overall deadline.
    #[error("transfer exceeded overall timeout of {0:?}")]
    OverallTimeout(Duration),

    /// The caller cancelled the transfer.
    #[error("transfer cancelled")]
    Cancelled,

    /// The file does not fit the protocol's 32-bit size field.
    #[error("file too large for transfer: {0} bytes")]
    FileTooLarge(u64),
}

/// USB context misuse or enumeration failure.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A USB context is already alive in this process.
    #[error("USB context already initialized")]
    AlreadyInitialized,

    /// The USB context was disposed; no further enumeration is possible.
    #[error("USB context has been disposed")]
    Disposed,

    /// Handles derived from the context are still alive.
    #[error("cannot dispose USB context: {0} device handle(s) still in use")]
    HandlesOutstanding(usize),

    /// libusb reported an error.
    #[cfg(feature = "usb")]
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    /// The hot-plug watcher could not be started.
    #[error("hot-plug watch failed: {0}")]
    Watch(String),
}

/// Error type for meadow-hcom operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Frame codec error.
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    /// Session request error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// File transfer error.
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// USB discovery or lifecycle error.
    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// The device answered with a rejection.
    #[error("Device rejected request: {0}")]
    DeviceRejected(String),

    /// The device answered with a response of the wrong shape.
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// No suitable serial port was found.
    #[error("No Meadow device found")]
    DeviceNotFound,
}
