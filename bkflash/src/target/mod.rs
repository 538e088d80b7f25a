//! Target-side knowledge: chip identification, flash geometry and the flash
//! operation sequencer.

pub mod chip;
pub mod flash_info;
pub mod flasher;

pub use {
    chip::{ChipFamily, ChipId},
    flash_info::{EraseTarget, FlashInfo, FlashRegion},
    flasher::Flasher,
};
