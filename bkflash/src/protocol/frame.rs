//! Frame codec for the Beken boot ROM v2 protocol.
//!
//! Two request framings share the same serial link:
//!
//! ```text
//! application level:
//! +----------+-----+--------+-----------+
//! | 01 E0 FC | len | opcode |  payload  |    len = 1 + payload
//! +----------+-----+--------+-----------+
//!
//! flash sub-dialect:
//! +----------------+---------+--------+-----------+
//! | 01 E0 FC FF F4 | len u16 | opcode |  payload  |    len = 1 + payload
//! +----------------+---------+--------+-----------+
//! ```
//!
//! and the matching responses:
//!
//! ```text
//! +-------+-----+----------+--------+-----------+
//! | 04 0E | len | 01 E0 FC | opcode |  payload  |    len = 4 + payload
//! +-------+-----+----------+--------+-----------+
//!
//! +----------------------+---------+--------+-----------+
//! | 04 0E FF 01 E0 FC F4 | len u16 | status |  payload  |    len = 1 + payload
//! +----------------------+---------+--------+-----------+
//! ```
//!
//! The v2 flash length is little-endian; the legacy v1.4 flash sub-dialect
//! spoken by secondary bootloaders carries the same field big-endian.
//! Every function here is pure.

use {
    super::status::FlashStatus,
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    thiserror::Error,
};

/// Application-level request header.
pub const APP_REQUEST_HEADER: [u8; 3] = [0x01, 0xE0, 0xFC];

/// Flash sub-dialect request header.
pub const FLASH_REQUEST_HEADER: [u8; 5] = [0x01, 0xE0, 0xFC, 0xFF, 0xF4];

/// Application-level response header (before the length byte).
pub const APP_RESPONSE_HEADER: [u8; 2] = [0x04, 0x0E];

/// Marker that follows the length byte of an application-level response.
pub const APP_RESPONSE_MARKER: [u8; 3] = [0x01, 0xE0, 0xFC];

/// Flash sub-dialect response header (before the length field).
pub const FLASH_RESPONSE_HEADER: [u8; 7] = [0x04, 0x0E, 0xFF, 0x01, 0xE0, 0xFC, 0xF4];

/// Bytes of an application-level response before its payload.
pub const APP_RESPONSE_OVERHEAD: usize = 7;

/// Bytes of a flash response before its payload (header, length, status).
pub const FLASH_RESPONSE_OVERHEAD: usize = 10;

/// Wire dialect of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Application-level frame with an 8-bit length.
    App,
    /// v2 flash sub-dialect, little-endian 16-bit length.
    Flash,
    /// v1.4 flash sub-dialect, big-endian 16-bit length.
    LegacyFlash,
}

impl Dialect {
    /// Whether this is one of the flash sub-dialects.
    pub fn is_flash(self) -> bool {
        matches!(self, Self::Flash | Self::LegacyFlash)
    }

    fn write_len16(self, buf: &mut [u8], len: u16) {
        match self {
            Self::LegacyFlash => BigEndian::write_u16(buf, len),
            _ => LittleEndian::write_u16(buf, len),
        }
    }

    fn read_len16(self, buf: &[u8]) -> u16 {
        match self {
            Self::LegacyFlash => BigEndian::read_u16(buf),
            _ => LittleEndian::read_u16(buf),
        }
    }
}

/// The set of dialects spoken over an established link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialectSet {
    /// Dialect used for flash commands.
    pub flash: Dialect,
    /// Whether 4K page payloads carry a CRC-16 per 32-byte block.
    pub page_crc: bool,
    /// Whether flash contents may be read back.
    pub readback: bool,
}

impl DialectSet {
    /// Plain boot ROM.
    pub const BOOT_ROM: Self = Self {
        flash: Dialect::Flash,
        page_crc: false,
        readback: true,
    };

    /// Boot ROM unlocked with a link key.
    pub const BOOT_ROM_EXTENDED: Self = Self {
        flash: Dialect::Flash,
        page_crc: true,
        readback: false,
    };

    /// Secondary bootloader.
    pub const SECONDARY_BOOTLOADER: Self = Self {
        flash: Dialect::LegacyFlash,
        page_crc: false,
        readback: true,
    };
}

/// Encode a request frame.
///
/// The payload must fit the dialect's length field (255 bytes for
/// application frames, 65534 for flash frames).
#[allow(clippy::cast_possible_truncation)]
pub fn encode_command(dialect: Dialect, opcode: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() + 1;
    match dialect {
        Dialect::App => {
            debug_assert!(len <= usize::from(u8::MAX), "application payload too long");
            let mut frame = Vec::with_capacity(APP_REQUEST_HEADER.len() + 1 + len);
            frame.extend_from_slice(&APP_REQUEST_HEADER);
            frame.push(len as u8);
            frame.push(opcode);
            frame.extend_from_slice(payload);
            frame
        },
        Dialect::Flash | Dialect::LegacyFlash => {
            debug_assert!(len <= usize::from(u16::MAX), "flash payload too long");
            let mut frame = Vec::with_capacity(FLASH_REQUEST_HEADER.len() + 2 + len);
            frame.extend_from_slice(&FLASH_REQUEST_HEADER);
            let mut len_field = [0u8; 2];
            dialect.write_len16(&mut len_field, len as u16);
            frame.extend_from_slice(&len_field);
            frame.push(opcode);
            frame.extend_from_slice(payload);
            frame
        },
    }
}

/// Total response length for a response carrying `payload_len` bytes.
pub fn expected_response_len(dialect: Dialect, payload_len: usize) -> usize {
    if dialect.is_flash() {
        FLASH_RESPONSE_OVERHEAD + payload_len
    } else {
        APP_RESPONSE_OVERHEAD + payload_len
    }
}

/// What a response to a particular request must look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    /// Response dialect.
    pub dialect: Dialect,
    /// Reply opcode (application frames only).
    pub opcode: u8,
    /// Payload length after the opcode or status byte.
    pub payload_len: usize,
    /// Accept a declared length one larger than the bytes received.
    pub length_slack: bool,
}

impl Expectation {
    /// Total response length in bytes.
    pub fn response_len(&self) -> usize {
        expected_response_len(self.dialect, self.payload_len)
    }
}

/// Reasons a response failed validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Not enough bytes to hold the header.
    #[error("response too short: need at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum length required.
        expected: usize,
        /// Bytes received.
        actual: usize,
    },

    /// Header bytes do not match the dialect.
    #[error("response header mismatch")]
    BadHeader,

    /// Declared length disagrees with the bytes received.
    #[error("declared length {declared} does not match {actual} received bytes")]
    LengthMismatch {
        /// Length field value.
        declared: usize,
        /// Bytes actually following the length field.
        actual: usize,
    },

    /// Reply opcode is not the one expected for the request.
    #[error("unexpected reply opcode {actual:#04x}, expected {expected:#04x}")]
    OpcodeMismatch {
        /// Expected opcode.
        expected: u8,
        /// Opcode found.
        actual: u8,
    },

    /// Payload has the wrong size for the request.
    #[error("unexpected payload length {actual}, expected {expected}")]
    PayloadLength {
        /// Expected payload length.
        expected: usize,
        /// Payload length found.
        actual: usize,
    },

    /// The response does not echo the request parameters.
    #[error("response does not echo the request {0}")]
    EchoMismatch(&'static str),

    /// The device reported a non-normal status.
    #[error("device reported {0}")]
    Status(FlashStatus),
}

impl ValidationError {
    /// Whether resending the same frame may succeed.
    ///
    /// Garbled or mismatched responses are transient; an explicit device
    /// status is not.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Status(_))
    }
}

/// Validate a raw response and return its payload.
///
/// Never panics, whatever `raw` contains.
pub fn validate_response(
    raw: &[u8],
    expect: &Expectation,
) -> Result<Vec<u8>, ValidationError> {
    if expect
        .dialect
        .is_flash()
    {
        validate_flash(raw, expect)
    } else {
        validate_app(raw, expect)
    }
}

fn check_declared(declared: usize, actual: usize, slack: bool) -> Result<(), ValidationError> {
    if declared == actual || (slack && declared == actual + 1) {
        Ok(())
    } else {
        Err(ValidationError::LengthMismatch { declared, actual })
    }
}

fn check_payload(payload: &[u8], expected: usize) -> Result<Vec<u8>, ValidationError> {
    if payload.len() != expected {
        return Err(ValidationError::PayloadLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(payload.to_vec())
}

fn validate_app(raw: &[u8], expect: &Expectation) -> Result<Vec<u8>, ValidationError> {
    if raw.len() < APP_RESPONSE_OVERHEAD {
        return Err(ValidationError::TooShort {
            expected: APP_RESPONSE_OVERHEAD,
            actual: raw.len(),
        });
    }
    if raw[..2] != APP_RESPONSE_HEADER || raw[3..6] != APP_RESPONSE_MARKER {
        return Err(ValidationError::BadHeader);
    }
    check_declared(usize::from(raw[2]), raw.len() - 3, expect.length_slack)?;
    if raw[6] != expect.opcode {
        return Err(ValidationError::OpcodeMismatch {
            expected: expect.opcode,
            actual: raw[6],
        });
    }
    check_payload(&raw[APP_RESPONSE_OVERHEAD..], expect.payload_len)
}

fn validate_flash(raw: &[u8], expect: &Expectation) -> Result<Vec<u8>, ValidationError> {
    if raw.len() < FLASH_RESPONSE_OVERHEAD {
        return Err(ValidationError::TooShort {
            expected: FLASH_RESPONSE_OVERHEAD,
            actual: raw.len(),
        });
    }
    if raw[..7] != FLASH_RESPONSE_HEADER {
        return Err(ValidationError::BadHeader);
    }

    // A rejected command may come back without its payload, so the status
    // is examined before the length.
    let status = FlashStatus::from(raw[9]);
    if !status.is_normal() {
        return Err(ValidationError::Status(status));
    }

    let declared = usize::from(
        expect
            .dialect
            .read_len16(&raw[7..9]),
    );
    check_declared(declared, raw.len() - 9, expect.length_slack)?;
    check_payload(&raw[FLASH_RESPONSE_OVERHEAD..], expect.payload_len)
}
