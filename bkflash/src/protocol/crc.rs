//! Checksums used by the Beken boot ROM.
//!
//! - [`crc16`]: the 16-bit checksum appended to each 32-byte block of a
//!   CRC-framed page (polynomial 0x8005, all-ones seed, no reflection).
//! - [`crc32`]: the value returned by the `CheckCrc` command (reflected
//!   0x04C11DB7, all-ones seed, no final xor).

use crc::{CRC_32_JAMCRC, Crc};

/// Size of one CRC-16 protected block inside a page.
pub const CRC_BLOCK_SIZE: usize = 32;

const POLY_16: u16 = 0x8005;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Calculate the boot ROM CRC-16 of `data`.
///
/// The register starts as all ones and only its low 16 bits survive each
/// byte, which makes this the CRC-16/CMS parameter set.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ POLY_16
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Calculate the CRC32 the boot ROM reports for a flash range.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Interleave `page` with a big-endian CRC-16 after every 32-byte block.
///
/// A short trailing block gets its own CRC over the bytes present.
pub fn encode_page_with_crc(page: &[u8]) -> Vec<u8> {
    let blocks = page.len().div_ceil(CRC_BLOCK_SIZE);
    let mut out = Vec::with_capacity(page.len() + blocks * 2);
    for block in page.chunks(CRC_BLOCK_SIZE) {
        out.extend_from_slice(block);
        out.extend_from_slice(&crc16(block).to_be_bytes());
    }
    out
}

/// Undo [`encode_page_with_crc`], returning `None` if any block CRC is wrong.
pub fn decode_page_with_crc(framed: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(framed.len());
    for chunk in framed.chunks(CRC_BLOCK_SIZE + 2) {
        if chunk.len() < 3 {
            return None;
        }
        let (block, crc) = chunk.split_at(chunk.len() - 2);
        if crc16(block).to_be_bytes() != [crc[0], crc[1]] {
            return None;
        }
        out.extend_from_slice(block);
    }
    Some(out)
}
