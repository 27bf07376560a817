//! Error categories surfaced by the core.
//!
//! Validation errors are synchronous and reported on the response frame of
//! the causing order; asynchronous faults (endstop, thermal) promote to the
//! global stop state instead (see `state`). Nothing is retried inside the
//! core.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::protocol::QueueInfo;

/// Application-level error codes, as carried in response frames.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AppError {
    UnknownOrder = 0x01,
    BadParameterFormat = 0x02,
    BadParameterValue = 0x03,
    InvalidDeviceType = 0x04,
    InvalidDeviceNumber = 0x05,
    IncorrectMode = 0x06,
    Busy = 0x07,
    Failed = 0x08,
    FirmwareError = 0x09,
    CannotActivateDevice = 0x0A,
}

/// Failure classes for the queue-command-blocks order.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum QueueErrorType {
    QueueFull = 0x01,
    UnknownBlock = 0x02,
    MalformedBlock = 0x03,
    ErrorInBlock = 0x04,
}

/// One failed sub-block, before the enqueue walker attaches its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockError {
    pub kind: QueueErrorType,
    pub code: AppError,
    pub reason: &'static str,
}

impl BlockError {
    pub fn full() -> Self {
        Self {
            kind: QueueErrorType::QueueFull,
            code: AppError::Busy,
            reason: "queue full",
        }
    }

    pub fn malformed(reason: &'static str) -> Self {
        Self {
            kind: QueueErrorType::MalformedBlock,
            code: AppError::BadParameterFormat,
            reason,
        }
    }

    pub fn in_block(code: AppError, reason: &'static str) -> Self {
        Self {
            kind: QueueErrorType::ErrorInBlock,
            code,
            reason,
        }
    }
}

/// Error response for an enqueue order: which sub-block failed and why,
/// plus the queue occupancy triple the host uses for flow control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnqueueError {
    pub error_type: QueueErrorType,
    pub block_index: u8,
    pub code: AppError,
    pub reason: &'static str,
    pub info: QueueInfo,
}

/// Configuration-table errors: mutation after the freeze, or a value the
/// tables cannot hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    /// The configuration freeze has happened; tables are immutable.
    Frozen,
    /// Referenced device/axis index is not present.
    InvalidDevice,
    /// Value outside the representable or sane range.
    OutOfRange,
    /// Table capacity exhausted.
    TooMany,
    /// Setting requires a different control mode.
    IncorrectMode,
}

/// A record that could not be decoded by the consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordDecodeError {
    UnknownTag(u8),
    Truncated,
}
