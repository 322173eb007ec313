//! IOMMU I/O Page Tables for Zero-OS
//!
//! This crate maintains the per-domain multi-level I/O page tables that an
//! AMD-style IOMMU walks to translate device (DMA) addresses into physical
//! addresses. A device attached to a domain can reach only the pages mapped
//! into that domain's table.
//!
//! # Architecture
//!
//! ```text
//!    +-----------------------------------------------------------+
//!    |                    Domain                                 |
//!    |  map / unmap / translate, range validation, statistics    |
//!    +----------------------------+------------------------------+
//!                                 | table lock held
//!                                 v
//!    +-----------------------------------------------------------+
//!    |                    Page Table (Pgtbl)                     |
//!    |  level 0 = root ... level pglvl-1 = leaf entries          |
//!    |  lazy materialization, refcounted teardown                |
//!    +----------------------------+------------------------------+
//!                                 | one open view at a time
//!                                 v
//!    +-----------------------------------------------------------+
//!    |                    Page Store                             |
//!    |  zero-filled table pages keyed by dense page index        |
//!    +-----------------------------------------------------------+
//!                                 |
//!                                 v  (lock dropped)
//!    +-----------------------------------------------------------+
//!    |                    IOTLB Invalidator                      |
//!    +-----------------------------------------------------------+
//! ```
//!
//! # Usage
//!
//! 1. Create a domain with [`Domain::new_paged`] or
//!    [`Domain::new_paged_with_width`]
//! 2. Call [`Domain::alloc_pgtbl`] and program [`Domain::page_table_root`]
//!    into the device table
//! 3. Map DMA buffers with [`Domain::map`], remove them with
//!    [`Domain::unmap`]
//! 4. Call [`Domain::free_pgtbl`] once every device has been detached
//!
//! # References
//!
//! - AMD I/O Virtualization Technology (IOMMU) Specification, 2.2.3
//!   (I/O Page Tables for Host Translations)

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate klog;

pub mod domain;
pub mod invalidate;
pub mod page_store;
mod pgtbl;
pub mod pte;
pub mod view;

#[cfg(test)]
mod tests_prop;

// Re-export key types
pub use domain::{Domain, DomainType};
pub use invalidate::{IotlbInvalidator, NoopInvalidator};
pub use page_store::{AllocFlags, HeapPageStore, PageIndex, PageStore, TablePage};
pub use pte::{MapFlags, Pte, PteFlags, IOMMU_PAGE_SIZE};
pub use view::PageView;

// ============================================================================
// Types
// ============================================================================

/// Domain identifier, as programmed into device table entries.
pub type DomainId = u16;

/// A half-open device address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapEntry {
    /// First device address of the range.
    pub start: u64,
    /// One past the last device address of the range.
    pub end: u64,
}

impl MapEntry {
    /// Create a new range.
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Length of the range in bytes; 0 if `end` precedes `start`.
    pub const fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

/// IOMMU operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IommuError {
    /// Invalid address range (misaligned, empty, reversed, out of bounds,
    /// or not matching the page list).
    InvalidRange,
    /// Mapping grants neither read nor write access.
    InvalidPermissions,
    /// Page table allocation failed.
    PageTableAllocFailed,
    /// Page table not allocated.
    NotInitialized,
    /// Domain is identity mapped and has no page table.
    IdentityMapped,
    /// Page table already allocated.
    AlreadyInitialized,
    /// Unsupported number of table levels or address width.
    InvalidLevels,
}

impl core::fmt::Display for IommuError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let msg = match self {
            IommuError::InvalidRange => "invalid address range",
            IommuError::InvalidPermissions => "mapping grants no access",
            IommuError::PageTableAllocFailed => "page table allocation failed",
            IommuError::NotInitialized => "page table not allocated",
            IommuError::IdentityMapped => "domain is identity mapped",
            IommuError::AlreadyInitialized => "page table already allocated",
            IommuError::InvalidLevels => "unsupported page table geometry",
        };
        f.write_str(msg)
    }
}

/// Result type for IOMMU operations.
pub type IommuResult<T> = Result<T, IommuError>;
