//! Techniques for forcing the target back into its boot ROM.

use {
    super::Transport,
    crate::{
        config::ResetKind,
        error::Result,
        port::Port,
        protocol::{Command, DialectSet},
    },
    log::debug,
    std::{thread::sleep, time::Duration},
};

/// Console command understood by Beken application firmware.
pub const ASCII_REBOOT: &[u8] = b"reboot\r\n";

/// Some strategy for resetting a target device.
pub trait ResetStrategy {
    /// Perform the reset.
    fn reset<P: Port>(&self, transport: &mut Transport<P>) -> Result<()>;
}

/// Pull the chip enable line through RTS.
#[derive(Debug, Clone, Copy)]
pub struct DtrRtsReset {
    pulse: Duration,
}

impl DtrRtsReset {
    /// Hold the target in reset for `pulse`.
    pub fn new(pulse: Duration) -> Self {
        Self { pulse }
    }
}

impl ResetStrategy for DtrRtsReset {
    fn reset<P: Port>(&self, transport: &mut Transport<P>) -> Result<()> {
        debug!("Using DTR/RTS reset with a {:?} pulse", self.pulse);

        transport.set_reset_lines(false, true)?; // CEN = LOW, chip in reset
        sleep(self.pulse);
        transport.set_reset_lines(false, false)?; // CEN = HIGH, chip boots

        Ok(())
    }
}

/// Ask running application firmware to reboot itself.
#[derive(Debug, Clone, Copy)]
pub struct AsciiRebootReset;

impl ResetStrategy for AsciiRebootReset {
    fn reset<P: Port>(&self, transport: &mut Transport<P>) -> Result<()> {
        debug!("Using ASCII reboot reset");
        transport.write(ASCII_REBOOT)
    }
}

/// Send the binary reboot frame.
#[derive(Debug, Clone, Copy)]
pub struct HexRebootReset;

impl ResetStrategy for HexRebootReset {
    fn reset<P: Port>(&self, transport: &mut Transport<P>) -> Result<()> {
        debug!("Using hex reboot reset");
        transport.write(&Command::Reboot.encode(DialectSet::BOOT_ROM))
    }
}

/// Reset the target with the technique `kind` selects for `attempt`.
pub fn reset_target<P: Port>(
    transport: &mut Transport<P>,
    kind: ResetKind,
    attempt: u32,
    pulse: Duration,
) -> Result<()> {
    match kind.technique(attempt) {
        ResetKind::AsciiReboot => AsciiRebootReset.reset(transport),
        ResetKind::HexReboot => HexRebootReset.reset(transport),
        ResetKind::DtrRts | ResetKind::Multi => DtrRtsReset::new(pulse).reset(transport),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::testing::{Line, MockPort},
    };

    #[test]
    fn test_dtr_rts_sequence() {
        let port = MockPort::new();
        let mut transport = Transport::new(port.clone());
        reset_target(&mut transport, ResetKind::DtrRts, 1, Duration::ZERO).unwrap();
        assert_eq!(
            port.state().lines,
            vec![
                Line::Dtr(false),
                Line::Rts(true),
                Line::Dtr(false),
                Line::Rts(false)
            ]
        );
        assert!(port.state().tx.is_empty());
    }

    #[test]
    fn test_ascii_and_hex_resets() {
        let port = MockPort::new();
        let mut transport = Transport::new(port.clone());
        reset_target(&mut transport, ResetKind::AsciiReboot, 1, Duration::ZERO).unwrap();
        reset_target(&mut transport, ResetKind::HexReboot, 1, Duration::ZERO).unwrap();

        let mut expected = b"reboot\r\n".to_vec();
        expected.extend_from_slice(&[0x01, 0xE0, 0xFC, 0x02, 0x0E, 0xA5]);
        assert_eq!(port.state().tx, expected);
    }

    #[test]
    fn test_multi_uses_attempt_number() {
        let port = MockPort::new();
        let mut transport = Transport::new(port.clone());
        reset_target(&mut transport, ResetKind::Multi, 2, Duration::ZERO).unwrap();
        assert_eq!(port.state().tx, b"reboot\r\n".to_vec());
        assert!(port.state().lines.is_empty());
    }
}
