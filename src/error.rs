//! Error taxonomy for the update and control paths.
//!
//! Network, parse and protocol errors are recovered locally (a skipped cycle,
//! "no candidate", a dropped command). Integrity and flash errors abort the
//! current update session and leave the staging partition inert.

use thiserror::Error;

use crate::ota::PartitionId;

/// Transport-level failures: the link, the HTTP server or the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("network link is down: {0}")]
    LinkDown(String),

    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("session closed")]
    Closed,
}

/// A manifest line that does not name a firmware file in the expected pattern.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{input}' does not match {expected}")]
pub struct ParseError {
    pub input: String,
    pub expected: String,
}

/// The staged bytes are not the image the server announced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("received {received} bytes, declared {declared}")]
    LengthMismatch { declared: u64, received: u64 },

    #[error("no image bytes received")]
    Empty,

    #[error("bad image header byte 0x{found:02x} (expected 0x{expected:02x})")]
    BadHeader { expected: u8, found: u8 },

    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

/// Storage failures and misuse of the staging sequence.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlashError {
    #[error("no inactive partition available for staging")]
    NoStagingPartition,

    #[error("erase of {partition} failed: {reason}")]
    Erase { partition: PartitionId, reason: String },

    #[error("write to {partition} at offset {offset} failed: {reason}")]
    Write {
        partition: PartitionId,
        offset: u64,
        reason: String,
    },

    #[error("out-of-order write: expected offset {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },

    #[error("image exceeds {partition} capacity of {capacity} bytes")]
    Overflow { partition: PartitionId, capacity: u64 },

    #[error("{got} is not the partition being staged ({staging})")]
    WrongPartition { staging: PartitionId, got: PartitionId },

    #[error("operation not valid while {0}")]
    InvalidState(&'static str),

    #[error("setting boot partition {partition} failed: {reason}")]
    SetBoot { partition: PartitionId, reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

/// Anything that ends an update session early.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    #[error("network: {0}")]
    Network(#[from] NetworkError),

    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("flash: {0}")]
    Flash(#[from] FlashError),
}

/// A command payload that could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty command payload")]
    Empty,

    #[error("unknown command '{0}'")]
    Unknown(String),

    #[error("invalid argument '{value}' for {command}")]
    InvalidArgument { command: &'static str, value: String },
}
