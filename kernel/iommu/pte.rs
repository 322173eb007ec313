//! I/O page table entries and level-aware addressing.
//!
//! The table is a radix tree of `pglvl` levels. Level 0 is the root, level
//! `pglvl - 1` is the leaf level whose entries point at the mapped pages.
//! Each level consumes [`NPTEPGSHIFT`] bits of the device address.
//!
//! # Entry Layout (AMD-Vi)
//!
//! ```text
//!  63  62  61  60  59        52 51                      12 11   9 8    1  0
//! +---+---+---+---+------------+--------------------------+------+------+--+
//! | 0 |IW |IR |FC |  reserved  |   physical address        | NLVL | ign  |PR|
//! +---+---+---+---+------------+--------------------------+------+------+--+
//! ```
//!
//! `NLVL` is the number of levels remaining below an interior entry, and 0
//! for a leaf entry.

use core::fmt;

use bitflags::bitflags;
use x86_64::PhysAddr;

use crate::page_store::PageIndex;

// ============================================================================
// Constants
// ============================================================================

/// Page shift for IOMMU mappings.
pub const IOMMU_PAGE_SHIFT: u32 = 12;

/// Page size for IOMMU mappings (4KB).
pub const IOMMU_PAGE_SIZE: u64 = 1 << IOMMU_PAGE_SHIFT;

/// Offset mask within one page.
pub const IOMMU_PAGE_MASK: u64 = IOMMU_PAGE_SIZE - 1;

/// Address bits consumed per level.
pub const NPTEPGSHIFT: u32 = 9;

/// Entries per table page.
pub const NPTEPG: usize = 1 << NPTEPGSHIFT;

const PTEMASK: u64 = NPTEPG as u64 - 1;

/// Shallowest supported table.
pub const MIN_PGLVL: u8 = 1;

/// Deepest table the entry format can describe (64-bit address space).
pub const MAX_PGLVL: u8 = 6;

/// Highest usable end bound when a table spans the full 64-bit space.
const FULL_SPACE_END: u64 = !IOMMU_PAGE_MASK;

// ============================================================================
// Flags
// ============================================================================

bitflags! {
    /// Permission and control bits of an I/O page table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        /// Entry is present.
        const PR = 1 << 0;
        /// Force coherent (snooped) device accesses.
        const FC = 1 << 60;
        /// Device reads allowed.
        const IR = 1 << 61;
        /// Device writes allowed.
        const IW = 1 << 62;
    }
}

bitflags! {
    /// Access requested by the owner of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MapFlags: u32 {
        /// Device may read the pages.
        const READ = 1 << 0;
        /// Device may write the pages.
        const WRITE = 1 << 1;
        /// Device accesses must snoop CPU caches.
        const SNOOP = 1 << 2;
    }
}

impl MapFlags {
    /// Whether the mapping grants any access at all.
    #[inline]
    pub fn grants_access(self) -> bool {
        self.intersects(MapFlags::READ | MapFlags::WRITE)
    }

    /// Translate to leaf entry bits. `PR` is added when the entry is written.
    pub fn pte_flags(self) -> PteFlags {
        let mut flags = PteFlags::empty();
        if self.contains(MapFlags::READ) {
            flags |= PteFlags::IR;
        }
        if self.contains(MapFlags::WRITE) {
            flags |= PteFlags::IW;
        }
        if self.contains(MapFlags::SNOOP) {
            flags |= PteFlags::FC;
        }
        flags
    }
}

// ============================================================================
// Page Table Entry
// ============================================================================

/// One I/O page table entry.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Pte(u64);

impl Pte {
    /// Physical address mask (bits 12-51).
    const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    const NLVL_SHIFT: u32 = 9;
    const NLVL_MASK: u64 = 0x7 << Self::NLVL_SHIFT;

    /// Create an empty (not present) entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create an interior entry pointing at the next-lower table page.
    ///
    /// `next_level` counts the levels remaining below this entry.
    pub fn new_table(table: PhysAddr, next_level: u8) -> Self {
        debug_assert!(next_level >= 1 && next_level <= MAX_PGLVL);
        let flags = PteFlags::PR | PteFlags::IR | PteFlags::IW;
        Self(
            (table.as_u64() & Self::ADDR_MASK)
                | ((next_level as u64) << Self::NLVL_SHIFT)
                | flags.bits(),
        )
    }

    /// Create a leaf entry mapping `page`.
    pub fn new_leaf(page: PhysAddr, flags: PteFlags) -> Self {
        Self((page.as_u64() & Self::ADDR_MASK) | (flags | PteFlags::PR).bits())
    }

    /// Check if present.
    pub const fn is_present(&self) -> bool {
        self.0 & PteFlags::PR.bits() != 0
    }

    /// Get physical address.
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new_truncate(self.0 & Self::ADDR_MASK)
    }

    /// Levels remaining below this entry; 0 for a leaf.
    pub const fn next_level(&self) -> u8 {
        ((self.0 & Self::NLVL_MASK) >> Self::NLVL_SHIFT) as u8
    }

    /// Get flags.
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Get raw value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_present() {
            return f.write_str("Pte(-)");
        }
        f.debug_struct("Pte")
            .field("addr", &format_args!("{:#x}", self.addr().as_u64()))
            .field("nlvl", &self.next_level())
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// Addressing
// ============================================================================

#[inline]
const fn level_shift(pglvl: u8, lvl: u8) -> u32 {
    IOMMU_PAGE_SHIFT + (pglvl - lvl - 1) as u32 * NPTEPGSHIFT
}

/// Slot of the entry covering `base` inside its level-`lvl` table page.
#[inline]
pub const fn pte_off(pglvl: u8, base: u64, lvl: u8) -> usize {
    ((base >> level_shift(pglvl, lvl)) & PTEMASK) as usize
}

/// Store index of the level-`lvl` table page that covers `base`.
///
/// The root is index 0. A page's children follow it in a dense numbering
/// where every level multiplies the namespace by [`NPTEPG`], so each
/// (level, address range) pair owns exactly one index.
pub fn pgtbl_index(pglvl: u8, base: u64, lvl: u8) -> PageIndex {
    let mut idx: PageIndex = 0;
    for i in 0..lvl {
        idx = idx * NPTEPG as u64 + pte_off(pglvl, base, i) as u64 + 1;
    }
    idx
}

/// Bytes of device address space translated by one entry at level `lvl`.
#[inline]
pub const fn entry_span(pglvl: u8, lvl: u8) -> u64 {
    1 << level_shift(pglvl, lvl)
}

/// Table depth needed to translate `width` address bits.
pub fn pglvl_for_width(width: u8) -> Option<u8> {
    if width as u32 <= IOMMU_PAGE_SHIFT || width > 64 {
        return None;
    }
    let bits = width as u32 - IOMMU_PAGE_SHIFT;
    let pglvl = bits.div_ceil(NPTEPGSHIFT) as u8;
    (MIN_PGLVL..=MAX_PGLVL).contains(&pglvl).then_some(pglvl)
}

/// Exclusive upper bound of the address space of a `width`-bit domain.
pub const fn width_end(width: u8) -> u64 {
    if width >= 64 {
        FULL_SPACE_END
    } else {
        1u64 << width
    }
}

/// Exclusive upper bound of the address space a `pglvl`-deep table spans.
pub const fn pglvl_end(pglvl: u8) -> u64 {
    let bits = IOMMU_PAGE_SHIFT + pglvl as u32 * NPTEPGSHIFT;
    if bits >= 64 {
        FULL_SPACE_END
    } else {
        1u64 << bits
    }
}
