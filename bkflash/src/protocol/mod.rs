//! Boot ROM wire protocol: frames, commands, status codes and checksums.

pub mod command;
pub mod crc;
pub mod frame;
pub mod status;

// Re-export common types
pub use {
    command::{Command, EraseSize, PAGE_SIZE},
    frame::{Dialect, DialectSet, Expectation, ValidationError, encode_command, validate_response},
    status::FlashStatus,
};
