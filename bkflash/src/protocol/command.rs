//! Boot ROM commands.
//!
//! Every opcode is one variant of [`Command`]; the variant knows its
//! dialect, how to encode its payload and what its response looks like.

use {
    super::{
        crc::encode_page_with_crc,
        frame::{Dialect, DialectSet, Expectation, ValidationError, encode_command},
    },
    byteorder::{ByteOrder, LittleEndian},
};

/// Size of one flash page as transferred by the 4K read/write commands.
pub const PAGE_SIZE: usize = 4096;

/// Register holding the primary chip identifier.
pub const CHIP_ID_REG: u32 = 0x4401_0000;

/// Register holding the secondary chip identifier.
pub const SECOND_ID_REG: u32 = 0x4401_0004;

/// JEDEC "read identification" instruction passed to [`Command::GetFlashMid`].
pub const JEDEC_READ_ID: u32 = 0x9F;

/// Magic byte carried by the reboot command.
pub const REBOOT_MAGIC: u8 = 0xA5;

/// Request and reply opcodes.
pub mod opcode {
    /// Boot ROM link check.
    pub const LINK_CHECK: u8 = 0x00;
    /// Reply to [`LINK_CHECK`].
    pub const LINK_CHECK_REPLY: u8 = 0x01;
    /// Write a 32-bit register.
    pub const WRITE_REG: u8 = 0x01;
    /// Read a 32-bit register.
    pub const READ_REG: u8 = 0x03;
    /// Reboot the chip.
    pub const REBOOT: u8 = 0x0E;
    /// Change the UART baud rate.
    pub const SET_BAUDRATE: u8 = 0x0F;
    /// CRC32 over a flash range.
    pub const CHECK_CRC: u8 = 0x10;
    /// Secondary bootloader link check.
    pub const BOOTLOADER_LINK_CHECK: u8 = 0x20;
    /// Reply to [`BOOTLOADER_LINK_CHECK`].
    pub const BOOTLOADER_LINK_CHECK_REPLY: u8 = 0x21;

    /// Write one 4K page.
    pub const FLASH_WRITE_4K: u8 = 0x07;
    /// Read one 4K page.
    pub const FLASH_READ_4K: u8 = 0x09;
    /// Erase the whole chip.
    pub const FLASH_ERASE_ALL: u8 = 0x0A;
    /// Read a flash status register.
    pub const FLASH_READ_SR: u8 = 0x0C;
    /// Write a flash status register.
    pub const FLASH_WRITE_SR: u8 = 0x0D;
    /// Read the flash manufacturer/device ID.
    pub const FLASH_GET_MID: u8 = 0x0E;
    /// Erase a sector or block selected by an erase instruction.
    pub const FLASH_ERASE: u8 = 0x0F;
}

/// Flash erase granularity, selected by the SPI erase instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseSize {
    /// 4 KiB sector, 3-byte address (0x20).
    Sector4K,
    /// 64 KiB block, 3-byte address (0xD8).
    Block64K,
    /// 4 KiB sector, 4-byte address (0x21).
    Sector4KExt,
    /// 64 KiB block, 4-byte address (0xDC).
    Block64KExt,
}

impl EraseSize {
    /// SPI instruction byte.
    pub fn instruction(self) -> u8 {
        match self {
            Self::Sector4K => 0x20,
            Self::Block64K => 0xD8,
            Self::Sector4KExt => 0x21,
            Self::Block64KExt => 0xDC,
        }
    }

    /// Number of bytes erased.
    pub fn bytes(self) -> u32 {
        match self {
            Self::Sector4K | Self::Sector4KExt => 0x1000,
            Self::Block64K | Self::Block64KExt => 0x1_0000,
        }
    }
}

/// A single boot ROM command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Boot ROM link check, optionally carrying a link key.
    LinkCheck {
        /// Key unlocking the extended dialect.
        key: Option<Vec<u8>>,
    },
    /// Secondary bootloader link check.
    BootloaderLinkCheck,
    /// Read a 32-bit register.
    ReadReg {
        /// Register address.
        address: u32,
    },
    /// Write a 32-bit register.
    WriteReg {
        /// Register address.
        address: u32,
        /// Value to write.
        value: u32,
    },
    /// Reboot into the application. Has no response.
    Reboot,
    /// Switch the UART to a new baud rate after `delay_ms`.
    SetBaudrate {
        /// New baud rate.
        baud: u32,
        /// Delay before the device switches.
        delay_ms: u8,
    },
    /// CRC32 of the inclusive flash range `start..=end`.
    CheckCrc {
        /// First byte.
        start: u32,
        /// Last byte (inclusive).
        end: u32,
    },
    /// Program one 4K page.
    FlashWrite4K {
        /// Page address.
        address: u32,
        /// Exactly [`PAGE_SIZE`] bytes.
        data: Vec<u8>,
    },
    /// Read one 4K page.
    FlashRead4K {
        /// Page address.
        address: u32,
    },
    /// Erase the whole flash.
    FlashEraseAll,
    /// Erase one sector or block.
    FlashErase {
        /// Granularity.
        size: EraseSize,
        /// Address inside the sector or block.
        address: u32,
    },
    /// Read a flash status register.
    FlashReadSr {
        /// SPI read-status instruction.
        register: u8,
    },
    /// Write a flash status register.
    FlashWriteSr {
        /// SPI write-status instruction.
        register: u8,
        /// New value.
        value: u8,
    },
    /// Read the JEDEC manufacturer/device ID.
    GetFlashMid,
}

impl Command {
    /// Command name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LinkCheck { .. } => "LinkCheck",
            Self::BootloaderLinkCheck => "BootloaderLinkCheck",
            Self::ReadReg { .. } => "ReadReg",
            Self::WriteReg { .. } => "WriteReg",
            Self::Reboot => "Reboot",
            Self::SetBaudrate { .. } => "SetBaudrate",
            Self::CheckCrc { .. } => "CheckCrc",
            Self::FlashWrite4K { .. } => "FlashWrite4K",
            Self::FlashRead4K { .. } => "FlashRead4K",
            Self::FlashEraseAll => "FlashEraseAll",
            Self::FlashErase { .. } => "FlashErase",
            Self::FlashReadSr { .. } => "FlashReadSr",
            Self::FlashWriteSr { .. } => "FlashWriteSr",
            Self::GetFlashMid => "GetFlashMid",
        }
    }

    /// Request opcode.
    pub fn opcode(&self) -> u8 {
        match self {
            Self::LinkCheck { .. } => opcode::LINK_CHECK,
            Self::BootloaderLinkCheck => opcode::BOOTLOADER_LINK_CHECK,
            Self::ReadReg { .. } => opcode::READ_REG,
            Self::WriteReg { .. } => opcode::WRITE_REG,
            Self::Reboot => opcode::REBOOT,
            Self::SetBaudrate { .. } => opcode::SET_BAUDRATE,
            Self::CheckCrc { .. } => opcode::CHECK_CRC,
            Self::FlashWrite4K { .. } => opcode::FLASH_WRITE_4K,
            Self::FlashRead4K { .. } => opcode::FLASH_READ_4K,
            Self::FlashEraseAll => opcode::FLASH_ERASE_ALL,
            Self::FlashErase { .. } => opcode::FLASH_ERASE,
            Self::FlashReadSr { .. } => opcode::FLASH_READ_SR,
            Self::FlashWriteSr { .. } => opcode::FLASH_WRITE_SR,
            Self::GetFlashMid => opcode::FLASH_GET_MID,
        }
    }

    /// Whether the command travels in the flash sub-dialect.
    pub fn is_flash(&self) -> bool {
        matches!(
            self,
            Self::FlashWrite4K { .. }
                | Self::FlashRead4K { .. }
                | Self::FlashEraseAll
                | Self::FlashErase { .. }
                | Self::FlashReadSr { .. }
                | Self::FlashWriteSr { .. }
                | Self::GetFlashMid
        )
    }

    /// Dialect the command is sent in over a link speaking `dialects`.
    pub fn dialect(&self, dialects: DialectSet) -> Dialect {
        if self.is_flash() {
            dialects.flash
        } else {
            Dialect::App
        }
    }

    /// Request payload.
    pub fn payload(&self, dialects: DialectSet) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::LinkCheck { key } => {
                if let Some(key) = key {
                    out.extend_from_slice(key);
                }
            },
            Self::BootloaderLinkCheck | Self::FlashEraseAll => {},
            Self::ReadReg { address } | Self::FlashRead4K { address } => {
                out.extend_from_slice(&address.to_le_bytes());
            },
            Self::WriteReg { address, value } => {
                out.extend_from_slice(&address.to_le_bytes());
                out.extend_from_slice(&value.to_le_bytes());
            },
            Self::Reboot => out.push(REBOOT_MAGIC),
            Self::SetBaudrate { baud, delay_ms } => {
                out.extend_from_slice(&baud.to_le_bytes());
                out.push(*delay_ms);
            },
            Self::CheckCrc { start, end } => {
                out.extend_from_slice(&start.to_le_bytes());
                out.extend_from_slice(&end.to_le_bytes());
            },
            Self::FlashWrite4K { address, data } => {
                debug_assert_eq!(data.len(), PAGE_SIZE, "page must be exactly 4 KiB");
                out.extend_from_slice(&address.to_le_bytes());
                if dialects.page_crc {
                    out.extend_from_slice(&encode_page_with_crc(data));
                } else {
                    out.extend_from_slice(data);
                }
            },
            Self::FlashErase { size, address } => {
                out.push(size.instruction());
                out.extend_from_slice(&address.to_le_bytes());
            },
            Self::FlashReadSr { register } => out.push(*register),
            Self::FlashWriteSr { register, value } => {
                out.push(*register);
                out.push(*value);
            },
            Self::GetFlashMid => out.extend_from_slice(&JEDEC_READ_ID.to_le_bytes()),
        }
        out
    }

    /// Encode the full request frame.
    pub fn encode(&self, dialects: DialectSet) -> Vec<u8> {
        encode_command(self.dialect(dialects), self.opcode(), &self.payload(dialects))
    }

    /// Shape of the response, or `None` if the device does not answer.
    pub fn expectation(&self, dialects: DialectSet) -> Option<Expectation> {
        let (opcode, payload_len) = match self {
            Self::Reboot => return None,
            Self::LinkCheck { .. } => (opcode::LINK_CHECK_REPLY, 1),
            Self::BootloaderLinkCheck => (opcode::BOOTLOADER_LINK_CHECK_REPLY, 1),
            Self::ReadReg { .. } | Self::WriteReg { .. } => (self.opcode(), 8),
            Self::SetBaudrate { .. } => (self.opcode(), 5),
            Self::CheckCrc { .. } | Self::FlashWrite4K { .. } | Self::GetFlashMid => {
                (self.opcode(), 4)
            },
            Self::FlashRead4K { .. } => (self.opcode(), 4 + PAGE_SIZE),
            Self::FlashEraseAll => (self.opcode(), 0),
            Self::FlashErase { .. } => (self.opcode(), 5),
            Self::FlashReadSr { .. } | Self::FlashWriteSr { .. } => (self.opcode(), 2),
        };
        Some(Expectation {
            dialect: self.dialect(dialects),
            opcode,
            payload_len,
            // The ROM overstates the MID response length by one.
            length_slack: matches!(self, Self::GetFlashMid),
        })
    }

    /// Check that a validated response payload echoes this request.
    pub fn check_echo(&self, payload: &[u8]) -> Result<(), ValidationError> {
        let echoes = |offset: usize, expected: u32| {
            payload
                .get(offset..offset + 4)
                .is_some_and(|bytes| LittleEndian::read_u32(bytes) == expected)
        };
        let ok = match self {
            Self::LinkCheck { .. } | Self::BootloaderLinkCheck => payload.first() == Some(&0x00),
            Self::ReadReg { address }
            | Self::FlashWrite4K { address, .. }
            | Self::FlashRead4K { address } => echoes(0, *address),
            Self::WriteReg { address, value } => echoes(0, *address) && echoes(4, *value),
            Self::SetBaudrate { baud, delay_ms } => {
                echoes(0, *baud) && payload.get(4) == Some(delay_ms)
            },
            Self::FlashErase { size, address } => {
                payload.first() == Some(&size.instruction()) && echoes(1, *address)
            },
            Self::FlashReadSr { register } => payload.first() == Some(register),
            Self::FlashWriteSr { register, value } => payload == [*register, *value],
            Self::Reboot | Self::CheckCrc { .. } | Self::FlashEraseAll | Self::GetFlashMid => true,
        };
        if ok {
            Ok(())
        } else {
            Err(ValidationError::EchoMismatch(self.name()))
        }
    }
}
