use std::io;

use thiserror::Error;

use crate::ble::ConnectFailure;
use crate::ota::{ImageKind, NackReason};

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
    #[error("Error when opening serial port {}: {}", _0, _1)]
    SerialOpen(String, serialport::Error),
    #[error("Serial port error: {}", _0)]
    Serial(#[from] serialport::Error),
    #[error("Timed out waiting for the transport")]
    TransportTimeout,
    #[error("No response to {}", command)]
    NoResponse { command: String },
    #[error("Unexpected response to {}: {:?}", command, String::from_utf8_lossy(response))]
    UnexpectedResponse { command: String, response: Vec<u8> },
    #[error("An AT request is already outstanding")]
    RequestPending,
    #[error("The BLE module is not in the mode required for this operation")]
    WrongMode,
    #[error("Connection attempt failed: {}", _0)]
    ConnectFailed(ConnectFailure),
    #[error("Invalid value: {}", _0)]
    InvalidValue(String),
    #[error("Update session failed: {}", _0)]
    Session(#[from] SessionError),
    #[error("The receiver refused packet #{}: {:?}", number, reason)]
    Refused { number: u16, reason: NackReason },
}

/// Reasons an update session ends in `Aborted`
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum SessionError {
    #[error("No packet arrived within the retry ceiling")]
    TransportTimeout,
    #[error("Image of {} bytes exceeds the staging capacity of {} bytes", declared, capacity)]
    CapacityExceeded { declared: u32, capacity: u32 },
    #[error("Image checksum mismatch (expected {:#010x}, calculated {:#010x})", expected, actual)]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("Image length mismatch (declared {}, received {})", declared, received)]
    LengthMismatch { declared: u32, received: u32 },
    #[error("The BLE connection was lost")]
    ConnectionLost,
    #[error("Could not write to the staging region")]
    FlashWriteFailed,
    #[error("The peer aborted the update")]
    AbortedByPeer,
    #[error("Unknown image kind {}", _0)]
    UnknownImageKind(u8),
}

/// Errors reported by a flash staging service
#[derive(Debug, Error)]
pub enum FlashError {
    #[error("Write of {} bytes at offset {} exceeds the {:?} region", len, offset, region)]
    OutOfBounds {
        region: ImageKind,
        offset: u32,
        len: usize,
    },
    #[error("The {:?} region has not been erased", _0)]
    NotErased(ImageKind),
    #[error("I/O error: {}", _0)]
    Io(#[from] io::Error),
}
