//! Custom error types for the control server.
//!
//! This module defines the primary error type, `ControlError`, shared by the
//! frame codec, the hardware drivers, the scheduler and the gateway. Using the
//! `thiserror` crate, it provides a centralized and consistent way to report
//! the failure taxonomy clients observe on the wire.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: a submission was rejected before it reached the queue
//!   (unknown channel, unknown mode, malformed parameters).
//! - **`DeviceFault`**: the switch or the instrument answered with an error.
//! - **`Timeout`**: no answer within the configured deadline.
//! - **`ProtocolFault`**: a reply arrived but failed frame validation.
//! - **`LinkFault`**: the transport to the hardware failed (I/O error, EOF).
//! - **`NotFound`**: unknown or evicted task id.
//! - **`Cancelled`**: the caller or the server aborted the operation.
//! - **`NotSupported`**: the hardware cannot perform the requested query.
//!
//! Ambient variants (`Config`, `Io`, `SerialFeatureDisabled`) only occur while
//! the process is starting up.
//!
//! Every variant maps to an [`ErrorCode`] via [`ControlError::code`]; the code's
//! wire name is what status and result messages carry.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the control error type.
pub type ControlResult<T> = std::result::Result<T, ControlError>;

/// Errors raised anywhere between the gateway and the hardware.
#[derive(Error, Debug)]
pub enum ControlError {
    /// Rejected at submission; the task was never enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Switch or instrument reported an error.
    #[error("Device fault: {0}")]
    DeviceFault(String),

    /// Deadline elapsed while waiting on the named operation.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Reply present but rejected by the frame codec.
    #[error("Protocol fault: {0}")]
    ProtocolFault(String),

    /// Transport-level failure on the device link.
    #[error("Link fault: {0}")]
    LinkFault(String),

    /// Unknown or evicted task id.
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Aborted by the caller or by shutdown.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Operation unavailable on this hardware model.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Local I/O outside a device exchange (listener bind, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serial switch was configured without the serial backend compiled in.
    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,
}

impl ControlError {
    /// Wire-level classification of this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            ControlError::Validation(_) | ControlError::Config(_) => ErrorCode::ValidationError,
            ControlError::DeviceFault(_) | ControlError::SerialFeatureDisabled => {
                ErrorCode::DeviceFault
            }
            ControlError::Timeout(_) => ErrorCode::Timeout,
            ControlError::ProtocolFault(_) => ErrorCode::ProtocolFault,
            ControlError::LinkFault(_) | ControlError::Io(_) => ErrorCode::LinkFault,
            ControlError::NotFound(_) => ErrorCode::NotFound,
            ControlError::Cancelled(_) => ErrorCode::Cancelled,
            ControlError::NotSupported(_) => ErrorCode::NotSupported,
        }
    }

    /// Snapshot suitable for storing on a task and sending to clients.
    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

impl From<figment::Error> for ControlError {
    fn from(value: figment::Error) -> Self {
        ControlError::Config(Box::new(value))
    }
}

/// Failure taxonomy as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Bad channel, mode or params at submission.
    ValidationError,
    /// Switch or instrument error reply.
    DeviceFault,
    /// Deadline elapsed.
    Timeout,
    /// Frame failed validation.
    ProtocolFault,
    /// Transport failure.
    LinkFault,
    /// Unknown task id.
    NotFound,
    /// Caller-initiated abort.
    Cancelled,
    /// Hardware lacks the capability.
    NotSupported,
}

impl ErrorCode {
    /// Name used on the wire and in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "ValidationError",
            ErrorCode::DeviceFault => "DeviceFault",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::ProtocolFault => "ProtocolFault",
            ErrorCode::LinkFault => "LinkFault",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::NotSupported => "NotSupported",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Taxonomy code.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl From<&ControlError> for ErrorInfo {
    fn from(value: &ControlError) -> Self {
        value.to_info()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_link_and_io_errors_to_link_fault() {
        let link = ControlError::LinkFault("connection reset".into());
        assert_eq!(link.code(), ErrorCode::LinkFault);

        let io = ControlError::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        assert_eq!(io.code(), ErrorCode::LinkFault);
    }

    #[test]
    fn error_info_carries_code_and_message() {
        let err = ControlError::ProtocolFault("missing end marker".into());
        let info = err.to_info();
        assert_eq!(info.code, ErrorCode::ProtocolFault);
        assert!(info.message.contains("missing end marker"));
    }

    #[test]
    fn error_code_serializes_as_taxonomy_name() {
        let json = serde_json::to_string(&ErrorCode::ValidationError).unwrap();
        assert_eq!(json, "\"ValidationError\"");
        assert_eq!(ErrorCode::Timeout.to_string(), "Timeout");
    }
}
