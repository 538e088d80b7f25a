//! Flash geometry: JEDEC identification, regions and erase planning.

use {
    crate::{
        error::{Error, Result},
        protocol::EraseSize,
    },
    std::fmt,
};

/// Smallest erasable unit and the program page size.
pub const SECTOR_SIZE: u32 = 0x1000;

/// Large erase block.
pub const BLOCK_SIZE: u32 = 0x1_0000;

/// Parts at least this large need the 4-byte-address erase instructions.
pub const EXT_ADDRESS_THRESHOLD: u64 = 256 * 1024 * 1024;

/// Status register read instruction (RDSR).
pub const SR_READ: u8 = 0x05;

/// Status register write instruction (WRSR).
pub const SR_WRITE: u8 = 0x01;

/// Round `value` down to a multiple of `align` (a power of two).
pub fn align_down(value: u64, align: u32) -> u64 {
    value & !(u64::from(align) - 1)
}

/// Round `value` up to a multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u32) -> u64 {
    align_down(value + u64::from(align) - 1, align)
}

/// Flash chip identity derived from its JEDEC ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashInfo {
    /// Raw JEDEC ID as reported by `GetFlashMid`.
    pub mid: u32,
    /// Capacity in bytes.
    pub size: u64,
}

impl FlashInfo {
    /// Decode a JEDEC ID: manufacturer in bits 0..8, capacity exponent in
    /// bits 16..24.
    pub fn from_mid(mid: u32) -> Result<Self> {
        let capacity = (mid >> 16) & 0xFF;
        if !(0x10..=0x20).contains(&capacity) {
            return Err(Error::FlashOperation(format!(
                "unrecognised flash id {mid:#08x}"
            )));
        }
        Ok(Self {
            mid,
            size: 1u64 << capacity,
        })
    }

    /// JEDEC manufacturer byte.
    pub fn manufacturer_id(&self) -> u8 {
        (self.mid & 0xFF) as u8
    }

    /// Best-effort vendor name.
    pub fn manufacturer(&self) -> &'static str {
        match self.manufacturer_id() {
            0xC8 => "GigaDevice",
            0xEF => "Winbond",
            0x85 => "Puya",
            0x0B => "XTX",
            0x5E => "Zbit",
            0x20 => "XMC",
            0xC2 => "Macronix",
            0x1C => "EON",
            0xEB => "TH",
            _ => "unknown",
        }
    }

    /// Whether erase commands need the 4-byte-address instructions.
    pub fn uses_ext_address(&self) -> bool {
        self.size >= EXT_ADDRESS_THRESHOLD
    }

    /// Status register bits that write-protect the whole array.
    pub fn protect_mask(&self) -> u8 {
        if self.size > 8 * 1024 * 1024 { 0x3C } else { 0x1C }
    }

    /// Fail unless `region` lies inside the flash.
    pub fn check_region(&self, region: FlashRegion) -> Result<()> {
        if region.end() > self.size {
            return Err(Error::FlashOperation(format!(
                "{region} exceeds the {} KiB flash",
                self.size / 1024
            )));
        }
        Ok(())
    }
}

impl fmt::Display for FlashInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:#08x}, {} KiB",
            self.manufacturer(),
            self.mid,
            self.size / 1024
        )
    }
}

/// A contiguous byte range of flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashRegion {
    /// First byte.
    pub start: u32,
    /// Length in bytes.
    pub len: u32,
}

impl FlashRegion {
    /// Create a region.
    pub fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.len)
    }

    /// Whether the region covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the two regions share at least one byte.
    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && u64::from(self.start) < other.end()
            && u64::from(other.start) < self.end()
    }

    /// Sector-aligned bounds covering the region.
    pub fn sector_bounds(&self) -> (u64, u64) {
        (
            align_down(u64::from(self.start), SECTOR_SIZE),
            align_up(self.end(), SECTOR_SIZE),
        )
    }

    /// The sectors lying entirely inside the region. Empty when the region
    /// does not cover a whole sector.
    pub fn whole_sectors(&self) -> Self {
        let first = align_up(u64::from(self.start), SECTOR_SIZE);
        let last = align_down(self.end(), SECTOR_SIZE);
        if last <= first {
            return Self::new(self.start, 0);
        }
        // Both bounds lie inside the original u32 range.
        Self::new(first as u32, (last - first) as u32)
    }
}

impl fmt::Display for FlashRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}..{:#010x}", self.start, self.end())
    }
}

/// What to erase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EraseTarget {
    /// The whole chip.
    All,
    /// The sectors covering a region.
    Range(FlashRegion),
}

/// Erase commands covering `region`, in ascending address order.
///
/// The start is rounded down and the end up to a sector. A 64 KiB block
/// erase is used when the address is block aligned and more than one block
/// remains.
pub fn erase_plan(region: FlashRegion, ext: bool) -> Vec<(EraseSize, u32)> {
    if region.is_empty() {
        return Vec::new();
    }
    let (sector, block) = if ext {
        (EraseSize::Sector4KExt, EraseSize::Block64KExt)
    } else {
        (EraseSize::Sector4K, EraseSize::Block64K)
    };

    let (mut address, end) = region.sector_bounds();
    let mut plan = Vec::new();
    while address < end {
        let remaining = end - address;
        // Strictly more than a block, matching the vendor download tool.
        let size = if address % u64::from(BLOCK_SIZE) == 0 && remaining > u64::from(BLOCK_SIZE) {
            block
        } else {
            sector
        };
        // Bounded by region.end(), which fits in u32 + u32.
        plan.push((size, address as u32));
        address += u64::from(size.bytes());
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_size_from_mid() {
        let info = FlashInfo::from_mid(0x0015_60EB).unwrap();
        assert_eq!(info.size, 2 * 1024 * 1024);
        assert_eq!(info.manufacturer(), "TH");
        assert!(!info.uses_ext_address());
        assert_eq!(info.protect_mask(), 0x1C);

        let big = FlashInfo::from_mid(0x0019_40EF).unwrap();
        assert_eq!(big.size, 32 * 1024 * 1024);
        assert_eq!(big.protect_mask(), 0x3C);
        assert!(FlashInfo::from_mid(0x001C_40EF).unwrap().uses_ext_address());
    }

    #[test]
    fn test_invalid_mid_rejected() {
        assert!(FlashInfo::from_mid(0).is_err());
        assert!(FlashInfo::from_mid(0xFFFF_FFFF).is_err());
    }

    #[test]
    fn test_check_region() {
        let info = FlashInfo::from_mid(0x0015_60EB).unwrap();
        assert!(info.check_region(FlashRegion::new(0x1F_F000, 0x1000)).is_ok());
        assert!(info.check_region(FlashRegion::new(0x1F_F000, 0x1001)).is_err());
        assert!(info.check_region(FlashRegion::new(u32::MAX, 2)).is_err());
    }

    #[test]
    fn test_alignment() {
        assert_eq!(align_down(0x1800, SECTOR_SIZE), 0x1000);
        assert_eq!(align_up(0x2800, SECTOR_SIZE), 0x3000);
        assert_eq!(align_up(0x3000, SECTOR_SIZE), 0x3000);
    }

    #[test]
    fn test_overlaps() {
        let a = FlashRegion::new(0x0, 0x1000);
        assert!(a.overlaps(&FlashRegion::new(0xFFF, 1)));
        assert!(!a.overlaps(&FlashRegion::new(0x1000, 1)));
        assert!(!a.overlaps(&FlashRegion::new(0x0, 0)));
    }

    #[test]
    fn test_whole_sectors() {
        assert_eq!(
            FlashRegion::new(0x2100, 0x3000).whole_sectors(),
            FlashRegion::new(0x3000, 0x2000)
        );
        assert_eq!(
            FlashRegion::new(0x1000, 0x2000).whole_sectors(),
            FlashRegion::new(0x1000, 0x2000)
        );
        assert!(FlashRegion::new(0x2100, 4).whole_sectors().is_empty());
        assert!(FlashRegion::new(0x1800, 0x1000).whole_sectors().is_empty());
    }

    #[test]
    fn test_erase_plan_aligned_sectors() {
        let plan = erase_plan(FlashRegion::new(0x1000, 0x2000), false);
        assert_eq!(plan, vec![
            (EraseSize::Sector4K, 0x1000),
            (EraseSize::Sector4K, 0x2000)
        ]);
    }

    #[test]
    fn test_erase_plan_rounds_unaligned_bounds() {
        let plan = erase_plan(FlashRegion::new(0x1800, 0x1000), false);
        assert_eq!(plan, vec![
            (EraseSize::Sector4K, 0x1000),
            (EraseSize::Sector4K, 0x2000)
        ]);
    }

    #[test]
    fn test_erase_plan_uses_blocks() {
        let plan = erase_plan(FlashRegion::new(0x1_0000, 0x1_1000), false);
        assert_eq!(plan, vec![
            (EraseSize::Block64K, 0x1_0000),
            (EraseSize::Sector4K, 0x2_0000)
        ]);

        // Exactly one block left is erased sector by sector.
        let plan = erase_plan(FlashRegion::new(0x0, 0x1_0000), false);
        assert_eq!(plan.len(), 16);
        assert!(plan.iter().all(|(size, _)| *size == EraseSize::Sector4K));
    }

    #[test]
    fn test_erase_plan_ext_instructions() {
        let plan = erase_plan(FlashRegion::new(0x0, 0x1000), true);
        assert_eq!(plan, vec![(EraseSize::Sector4KExt, 0x0)]);
    }

    #[test]
    fn test_erase_plan_empty() {
        assert!(erase_plan(FlashRegion::new(0x1000, 0), false).is_empty());
    }
}
