//! Status byte carried by flash sub-dialect responses.

use std::fmt;

/// Flash command status reported by the boot ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlashStatus {
    /// Command completed (0x00).
    Normal,
    /// Flash is busy (0x01).
    FlashBusy,
    /// SPI transfer timed out (0x02).
    SpiTimeout,
    /// Flash operation timed out (0x03).
    FlashOpTimeout,
    /// Payload length error (0x04).
    PayloadLengthError,
    /// Packet length error (0x05).
    PacketLengthError,
    /// Parameter error (0x06).
    ParameterError,
    /// Unknown command (0x07).
    UnknownCommand,
    /// Permission denied (0x0A).
    PermissionDenied,
    /// Any other status byte.
    Unknown(u8),
}

impl FlashStatus {
    /// Raw status byte.
    pub fn code(self) -> u8 {
        match self {
            Self::Normal => 0x00,
            Self::FlashBusy => 0x01,
            Self::SpiTimeout => 0x02,
            Self::FlashOpTimeout => 0x03,
            Self::PayloadLengthError => 0x04,
            Self::PacketLengthError => 0x05,
            Self::ParameterError => 0x06,
            Self::UnknownCommand => 0x07,
            Self::PermissionDenied => 0x0A,
            Self::Unknown(code) => code,
        }
    }

    /// Whether the status reports success.
    pub fn is_normal(self) -> bool {
        self == Self::Normal
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::FlashBusy => "flash busy",
            Self::SpiTimeout => "SPI timeout",
            Self::FlashOpTimeout => "flash operation timeout",
            Self::PayloadLengthError => "payload length error",
            Self::PacketLengthError => "packet length error",
            Self::ParameterError => "parameter error",
            Self::UnknownCommand => "unknown command",
            Self::PermissionDenied => "permission denied",
            Self::Unknown(_) => "unknown status",
        }
    }
}

impl From<u8> for FlashStatus {
    fn from(code: u8) -> Self {
        match code {
            0x00 => Self::Normal,
            0x01 => Self::FlashBusy,
            0x02 => Self::SpiTimeout,
            0x03 => Self::FlashOpTimeout,
            0x04 => Self::PayloadLengthError,
            0x05 => Self::PacketLengthError,
            0x06 => Self::ParameterError,
            0x07 => Self::UnknownCommand,
            0x0A => Self::PermissionDenied,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#04x})", self.label(), self.code())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    fn test_documented_codes_round_trip() {
        for code in [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0A] {
            let status = FlashStatus::from(code);
            assert!(!matches!(status, FlashStatus::Unknown(_)), "{code:#x}");
            assert_eq!(status.code(), code);
        }
    }

    #[test]
    fn test_labels_are_distinct() {
        let labels: HashSet<_> = [0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x0A]
            .into_iter()
            .map(|code| FlashStatus::from(code).label())
            .collect();
        assert_eq!(labels.len(), 9);
    }

    #[test]
    fn test_undocumented_code_is_unknown() {
        assert_eq!(FlashStatus::from(0x08), FlashStatus::Unknown(0x08));
        assert_eq!(FlashStatus::from(0xEE).to_string(), "unknown status (0xee)");
        assert_eq!(FlashStatus::PermissionDenied.to_string(), "permission denied (0x0a)");
    }
}
