//! Beken chip identification.
//!
//! The boot ROM exposes a chip identifier register. Most families are told
//! apart by that value alone; the BK7236 family also needs the secondary
//! identifier register to rule out other silicon revisions.

use {
    crate::error::{Error, Result},
    std::fmt,
};

/// Secondary identifier required for a supported BK7236.
pub const BK7236_SECOND_ID: u32 = 0x2034_0B10;

/// Supported chip families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChipFamily {
    /// BK7231N (WiFi + BLE).
    Bk7231n,
    /// BK7236.
    Bk7236,
    /// BK7238.
    Bk7238,
    /// BK7256.
    Bk7256,
    /// BK7258.
    Bk7258,
}

/// Primary identifiers in the order they are matched.
const CHIP_TABLE: &[(u32, ChipFamily)] = &[
    (0x0007_231C, ChipFamily::Bk7231n),
    (0x0000_7236, ChipFamily::Bk7236),
    (0x0000_7238, ChipFamily::Bk7238),
    (0x0000_7256, ChipFamily::Bk7256),
    (0x0000_7258, ChipFamily::Bk7258),
];

impl ChipFamily {
    /// All supported families.
    pub const ALL: [Self; 5] = [
        Self::Bk7231n,
        Self::Bk7236,
        Self::Bk7238,
        Self::Bk7256,
        Self::Bk7258,
    ];

    /// Family for a primary identifier, ignoring the secondary register.
    ///
    /// Some ROM revisions report the family code in the upper half-word, so
    /// `id >> 16` is tried as well.
    pub fn from_primary(id: u32) -> Option<Self> {
        [id, id >> 16]
            .into_iter()
            .find_map(|candidate| {
                CHIP_TABLE
                    .iter()
                    .find(|(known, _)| *known == candidate)
                    .map(|(_, family)| *family)
            })
    }

    /// Whether the primary identifier must be confirmed with the secondary
    /// identifier register.
    pub fn needs_second_id(id: u32) -> bool {
        Self::from_primary(id) == Some(Self::Bk7236)
    }

    /// Resolve a family from both identifier registers.
    ///
    /// `second_id` of `None` means the register was not read; that is only
    /// accepted for user-supplied identifiers.
    pub fn identify(id: u32, second_id: Option<u32>) -> Option<Self> {
        let family = Self::from_primary(id)?;
        match (family, second_id) {
            (Self::Bk7236, Some(second)) if second != BK7236_SECOND_ID => None,
            _ => Some(family),
        }
    }

    /// Get the chip family from a string name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .to_lowercase()
            .as_str()
        {
            "bk7231n" => Some(Self::Bk7231n),
            "bk7236" => Some(Self::Bk7236),
            "bk7238" => Some(Self::Bk7238),
            "bk7256" => Some(Self::Bk7256),
            "bk7258" => Some(Self::Bk7258),
            _ => None,
        }
    }
}

impl fmt::Display for ChipFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bk7231n => write!(f, "BK7231N"),
            Self::Bk7236 => write!(f, "BK7236"),
            Self::Bk7238 => write!(f, "BK7238"),
            Self::Bk7256 => write!(f, "BK7256"),
            Self::Bk7258 => write!(f, "BK7258"),
        }
    }
}

/// Identity read from a linked target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChipId {
    /// Primary identifier register value.
    pub id: u32,
    /// Secondary identifier, when it was read.
    pub second_id: Option<u32>,
    /// Resolved family.
    pub family: ChipFamily,
}

impl ChipId {
    /// Resolve `id`/`second_id`, failing with [`Error::UnsupportedChip`].
    pub fn resolve(id: u32, second_id: Option<u32>) -> Result<Self> {
        ChipFamily::identify(id, second_id)
            .map(|family| Self {
                id,
                second_id,
                family,
            })
            .ok_or(Error::UnsupportedChip { id, second_id })
    }
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x}", self.family, self.id)?;
        if let Some(second) = self.second_id {
            write!(f, "/{second:#010x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chip_family_from_name() {
        assert_eq!(ChipFamily::from_name("bk7231n"), Some(ChipFamily::Bk7231n));
        assert_eq!(ChipFamily::from_name("BK7236"), Some(ChipFamily::Bk7236));
        assert_eq!(ChipFamily::from_name("esp32"), None);
    }

    #[test]
    fn test_identify_by_primary_id() {
        assert_eq!(ChipFamily::identify(0x7231c, None), Some(ChipFamily::Bk7231n));
        assert_eq!(ChipFamily::identify(0x7256, None), Some(ChipFamily::Bk7256));
        assert_eq!(
            ChipFamily::identify(0x7258_0000, None),
            Some(ChipFamily::Bk7258)
        );
        assert_eq!(ChipFamily::identify(0x1234, None), None);
    }

    #[test]
    fn test_bk7236_requires_matching_second_id() {
        assert!(ChipFamily::needs_second_id(0x7236));
        assert!(ChipFamily::needs_second_id(0x7236_0000));
        assert!(!ChipFamily::needs_second_id(0x7231c));

        assert_eq!(
            ChipFamily::identify(0x7236, Some(BK7236_SECOND_ID)),
            Some(ChipFamily::Bk7236)
        );
        assert_eq!(ChipFamily::identify(0x7236, Some(0xDEAD_BEEF)), None);
    }

    #[test]
    fn test_resolve_unknown_chip() {
        let err = ChipId::resolve(0x1234, Some(0x5678)).unwrap_err();
        assert!(matches!(
            err,
            Error::UnsupportedChip {
                id: 0x1234,
                second_id: Some(0x5678)
            }
        ));
    }

    #[test]
    fn test_chip_id_display() {
        let chip = ChipId::resolve(0x7236, Some(BK7236_SECOND_ID)).unwrap();
        assert_eq!(chip.to_string(), "BK7236 (0x7236/0x20340b10)");
        let chip = ChipId::resolve(0x7231c, None).unwrap();
        assert_eq!(chip.to_string(), "BK7231N (0x7231c)");
    }
}
