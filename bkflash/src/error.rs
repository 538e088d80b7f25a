//! Error types for bkflash.

use {
    crate::{download::Stage, protocol::ValidationError},
    std::io,
    thiserror::Error,
};

/// Result type for bkflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bkflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The serial link could not be opened or used.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No link-check reply after every reset attempt.
    #[error("No response from boot ROM after {attempts} link attempts")]
    LinkEstablishment {
        /// Number of reset + link-check attempts made.
        attempts: u32,
    },

    /// A command failed after its retries were exhausted, or was rejected.
    #[error("{command} failed after {tries} tries: {reason}")]
    Command {
        /// Command name.
        command: &'static str,
        /// Number of times the frame was sent.
        tries: u32,
        /// Last failure observed.
        reason: CommandFailure,
    },

    /// A flash-level operation could not be completed.
    #[error("Flash operation failed: {0}")]
    FlashOperation(String),

    /// Read-back or CRC comparison found different contents.
    #[error("Verification failed for region starting at {address:#010x}")]
    VerifyMismatch {
        /// Start address of the region that failed to verify.
        address: u32,
    },

    /// A download stage failed.
    #[error("{stage} failed: {source}")]
    Stage {
        /// Stage that was running.
        stage: Stage,
        /// Underlying cause.
        #[source]
        source: Box<Error>,
    },

    /// The chip identifier is not in the supported table.
    #[error("Unsupported chip id {id:#x}{}", secondary_suffix(.second_id))]
    UnsupportedChip {
        /// Primary chip identifier.
        id: u32,
        /// Secondary identifier, if one was read.
        second_id: Option<u32>,
    },

    /// Unsupported operation for the current link.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No serial port could be selected.
    #[error("No serial port found")]
    DeviceNotFound,

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,
}

#[allow(clippy::ref_option)]
fn secondary_suffix(second_id: &Option<u32>) -> String {
    second_id
        .map(|id| format!(" (secondary id {id:#010x})"))
        .unwrap_or_default()
}

/// Why a single command failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandFailure {
    /// Fewer bytes than expected arrived before the deadline.
    #[error("timed out ({received} of {expected} bytes received)")]
    Timeout {
        /// Expected response length.
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },

    /// The response was received but did not validate.
    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl Error {
    /// Wrap this error with the download stage it happened in.
    #[must_use]
    pub fn in_stage(self, stage: Stage) -> Self {
        match self {
            // Keep cancellation recognisable at the top level.
            Self::Cancelled => Self::Cancelled,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Returns `true` if this error (or its cause) is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Stage { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Stage in which the error happened, if known.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Status reported by the device, if the error is an explicit rejection.
    pub fn device_status(&self) -> Option<crate::protocol::FlashStatus> {
        match self {
            Self::Command {
                reason: CommandFailure::Invalid(ValidationError::Status(status)),
                ..
            } => Some(*status),
            Self::Stage { source, .. } => source.device_status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::protocol::FlashStatus};

    #[test]
    fn test_stage_wrapping_keeps_cause() {
        let err = Error::FlashOperation("erase timed out".into()).in_stage(Stage::Erase);
        assert_eq!(err.stage(), Some(Stage::Erase));
        assert!(err.to_string().contains("erase"));
        assert!(err.to_string().contains("erase timed out"));
    }

    #[test]
    fn test_cancelled_is_not_wrapped() {
        let err = Error::Cancelled.in_stage(Stage::Program);
        assert!(matches!(err, Error::Cancelled));
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_device_status_through_stage() {
        let err = Error::Command {
            command: "FlashWrite4K",
            tries: 1,
            reason: CommandFailure::Invalid(ValidationError::Status(FlashStatus::PermissionDenied)),
        }
        .in_stage(Stage::Program);
        assert_eq!(err.device_status(), Some(FlashStatus::PermissionDenied));
    }

    #[test]
    fn test_unsupported_chip_message() {
        let err = Error::UnsupportedChip {
            id: 0x7236,
            second_id: Some(0x1234_5678),
        };
        let msg = err.to_string();
        assert!(msg.contains("0x7236"));
        assert!(msg.contains("0x12345678"));
    }
}
