//! Page-type tags and paging-mode constants shared across the engine.

use frames::{Pfn, PAGE_SIZE};
use log::error;

use crate::error::{RestoreError, Result};

/// Shift separating the type nibble from the frame number in a tagged
/// stream word.
pub const LTAB_SHIFT: u32 = 28;
/// Pin bit within the type nibble.
pub const LPINTAB: u64 = 0x8 << LTAB_SHIFT;
/// Full tag mask, pin bit included.
pub const LTAB_MASK: u64 = 0xf << LTAB_SHIFT;
/// Type bits without the pin bit.
pub const LTABTYPE_MASK: u64 = 0x7 << LTAB_SHIFT;
/// Tag nibble marking a slot with no page behind it.
pub const XTAB: u64 = LTAB_MASK;

/// Page-table level, leaf first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PtLevel {
    L1,
    L2,
    L3,
    L4,
}

impl PtLevel {
    /// All levels, bottom-up.
    pub const ALL: [PtLevel; 4] = [PtLevel::L1, PtLevel::L2, PtLevel::L3, PtLevel::L4];

    /// Numeric level, 1-based.
    pub const fn number(self) -> u64 {
        match self {
            PtLevel::L1 => 1,
            PtLevel::L2 => 2,
            PtLevel::L3 => 3,
            PtLevel::L4 => 4,
        }
    }

    const fn from_number(n: u64) -> Option<Self> {
        match n {
            1 => Some(PtLevel::L1),
            2 => Some(PtLevel::L2),
            3 => Some(PtLevel::L3),
            4 => Some(PtLevel::L4),
            _ => None,
        }
    }
}

/// Type classification of one guest page, as carried by the stream.
///
/// The pin bit travels with the level rather than as a separate table so
/// that an entry is always internally consistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageTag {
    /// Plain guest data; no embedded frame numbers.
    #[default]
    Normal,
    /// A page-table page at the carried level. Pinned tables are declared
    /// to the hypervisor once their contents are final.
    Table { level: PtLevel, pinned: bool },
    /// The slot has no page in the guest's pseudo-physical map.
    Unmapped,
}

impl PageTag {
    pub fn table_level(self) -> Option<PtLevel> {
        match self {
            PageTag::Table { level, .. } => Some(level),
            _ => None,
        }
    }

    pub fn is_pinned(self) -> bool {
        matches!(self, PageTag::Table { pinned: true, .. })
    }
}

/// Splits one tagged stream word into its PFN and page-type tag.
pub fn decode_tagged_pfn(word: u64) -> Result<(Pfn, PageTag)> {
    let pfn = Pfn::new(word & !LTAB_MASK);
    let tag = match word & LTAB_MASK {
        0 => PageTag::Normal,
        XTAB => PageTag::Unmapped,
        bits => match PtLevel::from_number((bits & LTABTYPE_MASK) >> LTAB_SHIFT) {
            Some(level) => PageTag::Table {
                level,
                pinned: bits & LPINTAB != 0,
            },
            None => {
                error!("unknown page type {:#x} in batch entry", bits >> LTAB_SHIFT);
                return Err(RestoreError::StreamInvalid("unknown page type in batch"));
            }
        },
    };
    Ok((pfn, tag))
}

/// Paging mode of the suspended guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    TwoLevel,
    ThreeLevel,
    FourLevel,
}

impl PagingMode {
    pub fn from_levels(levels: u32) -> Option<Self> {
        match levels {
            2 => Some(PagingMode::TwoLevel),
            3 => Some(PagingMode::ThreeLevel),
            4 => Some(PagingMode::FourLevel),
            _ => None,
        }
    }

    pub fn levels(self) -> u64 {
        self.top_level().number()
    }

    /// The level of the page-table root referenced by control register 3.
    pub fn top_level(self) -> PtLevel {
        match self {
            PagingMode::TwoLevel => PtLevel::L2,
            PagingMode::ThreeLevel => PtLevel::L3,
            PagingMode::FourLevel => PtLevel::L4,
        }
    }

    /// Width of one page-table entry. Two-level guests use 4-byte
    /// entries; everything else is 8 bytes wide.
    pub fn entry_bytes(self) -> usize {
        match self {
            PagingMode::TwoLevel => 4,
            _ => 8,
        }
    }

    pub fn entries_per_table(self) -> usize {
        PAGE_SIZE / self.entry_bytes()
    }

    /// Whether the guest runs a 32-bit kernel (two- and three-level
    /// paging); these carry callback code selectors in their context.
    pub fn is_compat(self) -> bool {
        !matches!(self, PagingMode::FourLevel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_normal_and_tables() {
        let (pfn, tag) = decode_tagged_pfn(0x42).unwrap();
        assert_eq!(pfn, Pfn::new(0x42));
        assert_eq!(tag, PageTag::Normal);

        let (pfn, tag) = decode_tagged_pfn((1 << LTAB_SHIFT) | 7).unwrap();
        assert_eq!(pfn, Pfn::new(7));
        assert_eq!(
            tag,
            PageTag::Table {
                level: PtLevel::L1,
                pinned: false
            }
        );

        let (_, tag) = decode_tagged_pfn((4 << LTAB_SHIFT) | LPINTAB | 9).unwrap();
        assert_eq!(
            tag,
            PageTag::Table {
                level: PtLevel::L4,
                pinned: true
            }
        );
    }

    #[test]
    fn decode_unmapped() {
        let (_, tag) = decode_tagged_pfn(XTAB | 3).unwrap();
        assert_eq!(tag, PageTag::Unmapped);
    }

    #[test]
    fn decode_rejects_unknown_types() {
        // Level nibbles 5..7 name no table level; a lone pin bit names no
        // table at all.
        assert!(decode_tagged_pfn(5 << LTAB_SHIFT).is_err());
        assert!(decode_tagged_pfn(7 << LTAB_SHIFT).is_err());
        assert!(decode_tagged_pfn(LPINTAB).is_err());
    }

    #[test]
    fn entry_widths() {
        assert_eq!(PagingMode::TwoLevel.entry_bytes(), 4);
        assert_eq!(PagingMode::TwoLevel.entries_per_table(), 1024);
        assert_eq!(PagingMode::ThreeLevel.entry_bytes(), 8);
        assert_eq!(PagingMode::FourLevel.entries_per_table(), 512);
    }
}
