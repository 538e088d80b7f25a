//! Session configuration.
//!
//! A [`SessionConfig`] is built once before a download and then only read,
//! so one instance can be shared by every port of a batch.

use {
    crate::error::{Error, Result},
    std::{fmt, str::FromStr, time::Duration},
};

/// Default baud rate for link establishment.
pub const DEFAULT_LINK_BAUD: u32 = 115_200;

/// Default baud rate for flash operations.
pub const DEFAULT_WORK_BAUD: u32 = 1_500_000;

/// Highest baud rate the boot ROM switches to directly.
pub const MAX_WORK_BAUD: u32 = 2_600_000;

/// How the target is forced into its boot ROM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ResetKind {
    /// Pulse the DTR/RTS lines (code 0).
    #[default]
    DtrRts,
    /// Send the ASCII `reboot` console command (code 1).
    AsciiReboot,
    /// Send the binary reboot frame (code 2).
    HexReboot,
    /// Rotate through all techniques, one per attempt (code 3).
    Multi,
}

impl ResetKind {
    /// Numeric code used on the command line.
    pub fn code(self) -> u8 {
        match self {
            Self::DtrRts => 0,
            Self::AsciiReboot => 1,
            Self::HexReboot => 2,
            Self::Multi => 3,
        }
    }

    /// The concrete technique to use for a 1-based attempt number.
    pub fn technique(self, attempt: u32) -> Self {
        match self {
            Self::Multi => match attempt.saturating_sub(1) % 3 {
                0 => Self::DtrRts,
                1 => Self::AsciiReboot,
                _ => Self::HexReboot,
            },
            other => other,
        }
    }
}

impl TryFrom<u8> for ResetKind {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::DtrRts),
            1 => Ok(Self::AsciiReboot),
            2 => Ok(Self::HexReboot),
            3 => Ok(Self::Multi),
            other => Err(Error::Config(format!(
                "unknown reset type {other} (expected 0-3)"
            ))),
        }
    }
}

impl FromStr for ResetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s
            .to_lowercase()
            .as_str()
        {
            "0" | "dtr-rts" | "dtr" => Ok(Self::DtrRts),
            "1" | "ascii" | "reboot" => Ok(Self::AsciiReboot),
            "2" | "hex" => Ok(Self::HexReboot),
            "3" | "multi" => Ok(Self::Multi),
            other => Err(Error::Config(format!("unknown reset type '{other}'"))),
        }
    }
}

impl fmt::Display for ResetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DtrRts => write!(f, "dtr-rts"),
            Self::AsciiReboot => write!(f, "ascii"),
            Self::HexReboot => write!(f, "hex"),
            Self::Multi => write!(f, "multi"),
        }
    }
}

/// Which link-check handshake to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum LinkCheckKind {
    /// Boot ROM handshake.
    #[default]
    BootRom,
    /// Secondary bootloader handshake.
    Bootloader,
    /// Try the boot ROM first, then the bootloader.
    Mixed,
}

impl FromStr for LinkCheckKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s
            .to_lowercase()
            .as_str()
        {
            "rom" | "bootrom" | "boot-rom" => Ok(Self::BootRom),
            "bootloader" | "bl" => Ok(Self::Bootloader),
            "mixed" | "auto" => Ok(Self::Mixed),
            other => Err(Error::Config(format!("unknown link check '{other}'"))),
        }
    }
}

impl fmt::Display for LinkCheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BootRom => write!(f, "rom"),
            Self::Bootloader => write!(f, "bootloader"),
            Self::Mixed => write!(f, "mixed"),
        }
    }
}

/// Parameters of one flashing session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Baud rate used while establishing the link.
    pub link_baud: u32,
    /// Baud rate used for flash operations.
    pub work_baud: u32,
    /// Reset technique.
    pub reset: ResetKind,
    /// Link-check handshake.
    pub link_check: LinkCheckKind,
    /// Reset + link-check attempts before giving up.
    pub max_link_attempts: u32,
    /// Extra tries per command after the first.
    pub retries: u32,
    /// Per-try response timeout for ordinary commands.
    pub command_timeout: Duration,
    /// Wait for a link-check reply.
    pub link_check_timeout: Duration,
    /// Per-try timeout of a sector or block erase.
    pub erase_timeout: Duration,
    /// Timeout of a full-chip erase.
    pub erase_all_timeout: Duration,
    /// How long the reset lines are held.
    pub reset_pulse: Duration,
    /// Pause after a reset before the link check.
    pub post_reset_delay: Duration,
    /// Pause after the link is established.
    pub post_link_delay: Duration,
    /// Delay the device waits before switching baud rate.
    pub baud_switch_delay_ms: u8,
    /// Chip identifier to use instead of reading it.
    pub chip_id: Option<u32>,
    /// Key unlocking the extended boot ROM dialect.
    pub link_key: Option<Vec<u8>>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            link_baud: DEFAULT_LINK_BAUD,
            work_baud: DEFAULT_WORK_BAUD,
            reset: ResetKind::default(),
            link_check: LinkCheckKind::default(),
            max_link_attempts: 100,
            retries: 5,
            command_timeout: Duration::from_millis(1000),
            link_check_timeout: Duration::from_millis(10),
            erase_timeout: Duration::from_secs(3),
            erase_all_timeout: Duration::from_secs(20),
            reset_pulse: Duration::from_millis(50),
            post_reset_delay: Duration::from_millis(5),
            post_link_delay: Duration::from_millis(100),
            baud_switch_delay_ms: 20,
            chip_id: None,
            link_key: None,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the link baud rate.
    #[must_use]
    pub fn with_link_baud(mut self, baud: u32) -> Self {
        self.link_baud = baud;
        self
    }

    /// Set the working baud rate.
    #[must_use]
    pub fn with_work_baud(mut self, baud: u32) -> Self {
        self.work_baud = baud;
        self
    }

    /// Set the reset technique.
    #[must_use]
    pub fn with_reset(mut self, reset: ResetKind) -> Self {
        self.reset = reset;
        self
    }

    /// Set the link-check handshake.
    #[must_use]
    pub fn with_link_check(mut self, kind: LinkCheckKind) -> Self {
        self.link_check = kind;
        self
    }

    /// Set the number of link attempts.
    #[must_use]
    pub fn with_link_attempts(mut self, attempts: u32) -> Self {
        self.max_link_attempts = attempts;
        self
    }

    /// Set the per-command retry count.
    #[must_use]
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Skip reading the chip identifier and use `id`.
    #[must_use]
    pub fn with_chip_id(mut self, id: u32) -> Self {
        self.chip_id = Some(id);
        self
    }

    /// Unlock the extended dialect with `key`.
    #[must_use]
    pub fn with_link_key(mut self, key: Vec<u8>) -> Self {
        self.link_key = Some(key);
        self
    }

    /// Reject values that cannot lead to a working session.
    pub fn validate(&self) -> Result<()> {
        if self.max_link_attempts == 0 {
            return Err(Error::Config("link attempts must be at least 1".into()));
        }
        if self.link_baud == 0 || self.work_baud == 0 {
            return Err(Error::Config("baud rate must be non-zero".into()));
        }
        if self.work_baud > MAX_WORK_BAUD {
            return Err(Error::Config(format!(
                "baud rate {} exceeds the boot ROM maximum of {MAX_WORK_BAUD}",
                self.work_baud
            )));
        }
        if let Some(key) = &self.link_key {
            if key.is_empty() || key.len() > 32 {
                return Err(Error::Config("link key must be 1 to 32 bytes".into()));
            }
        }
        Ok(())
    }
}
