//! IOMMU Domain Management
//!
//! A domain is an isolated DMA address space. Devices attached to the same
//! domain share its translation of device addresses (IOVA) to physical
//! memory, and can reach only what has been mapped into it.
//!
//! # Domain Types
//!
//! - **Identity**: device address == physical address, no table.
//! - **PageTable**: multi-level I/O page table, materialized on demand.
//!
//! # Locking
//!
//! Each domain owns a table lock that serializes every structural change to
//! its table (allocation, map, unmap, teardown). Mappings on different
//! domains never contend. IOTLB invalidation is issued after the lock is
//! dropped.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;
use x86_64::PhysAddr;

use crate::invalidate::IotlbInvalidator;
use crate::page_store::{AllocFlags, HeapPageStore, PageIndex, PageStore, TablePage};
use crate::pgtbl::{Pgtbl, PgtblState};
use crate::pte::{
    pglvl_end, pglvl_for_width, width_end, MapFlags, PteFlags, IOMMU_PAGE_MASK, IOMMU_PAGE_SIZE,
    MAX_PGLVL, MIN_PGLVL,
};
use crate::{DomainId, IommuError, IommuResult, MapEntry};

/// Domain type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainType {
    /// Identity mapping (IOVA == physical address).
    Identity,
    /// Multi-level I/O page table translation.
    PageTable,
}

/// IOMMU domain for DMA isolation.
pub struct Domain<S: PageStore = HeapPageStore> {
    /// Unique domain identifier.
    id: DomainId,

    /// Domain type (identity or page-table).
    domain_type: DomainType,

    /// Table depth; 0 for identity domains.
    pglvl: u8,

    /// Exclusive upper bound of mappable device addresses.
    end: u64,

    /// Table lock guarding the page table and its store.
    page_table: Mutex<Pgtbl<S>>,

    /// IOTLB invalidation for the units this domain is attached to.
    invalidator: Arc<dyn IotlbInvalidator>,
}

impl<S: PageStore + Default> Domain<S> {
    /// Create an identity-mapped domain.
    ///
    /// Identity domains never own a table; map and unmap are rejected.
    pub fn new_identity(id: DomainId, invalidator: Arc<dyn IotlbInvalidator>) -> Self {
        Self {
            id,
            domain_type: DomainType::Identity,
            pglvl: 0,
            end: width_end(64),
            page_table: Mutex::new(Pgtbl::new_identity(id, S::default())),
            invalidator,
        }
    }
}

impl<S: PageStore> Domain<S> {
    /// Create a page-table domain of `pglvl` levels spanning the whole
    /// address range such a table can translate.
    ///
    /// The table itself is not allocated until [`Domain::alloc_pgtbl`].
    pub fn new_paged(
        id: DomainId,
        pglvl: u8,
        store: S,
        invalidator: Arc<dyn IotlbInvalidator>,
    ) -> IommuResult<Self> {
        if !(MIN_PGLVL..=MAX_PGLVL).contains(&pglvl) {
            return Err(IommuError::InvalidLevels);
        }
        Ok(Self::paged(id, pglvl, pglvl_end(pglvl), store, invalidator))
    }

    /// Create a page-table domain for a `width`-bit device address space.
    ///
    /// The depth is the smallest number of levels covering `width` bits
    /// (39 bits = 3 levels, 48 bits = 4 levels).
    pub fn new_paged_with_width(
        id: DomainId,
        width: u8,
        store: S,
        invalidator: Arc<dyn IotlbInvalidator>,
    ) -> IommuResult<Self> {
        let pglvl = pglvl_for_width(width).ok_or(IommuError::InvalidLevels)?;
        Ok(Self::paged(id, pglvl, width_end(width), store, invalidator))
    }

    fn paged(
        id: DomainId,
        pglvl: u8,
        end: u64,
        store: S,
        invalidator: Arc<dyn IotlbInvalidator>,
    ) -> Self {
        Self {
            id,
            domain_type: DomainType::PageTable,
            pglvl,
            end,
            page_table: Mutex::new(Pgtbl::new(id, pglvl, store)),
            invalidator,
        }
    }

    /// Get domain identifier.
    #[inline]
    pub fn id(&self) -> DomainId {
        self.id
    }

    /// Get domain type.
    #[inline]
    pub fn domain_type(&self) -> DomainType {
        self.domain_type
    }

    /// Table depth; 0 for identity domains.
    #[inline]
    pub fn pglvl(&self) -> u8 {
        self.pglvl
    }

    /// Exclusive upper bound of mappable device addresses.
    #[inline]
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Get total mapped bytes.
    pub fn mapped_bytes(&self) -> u64 {
        self.page_table.lock().mapped_pages() * IOMMU_PAGE_SIZE
    }

    /// Whether the table is allocated.
    pub fn is_initialized(&self) -> bool {
        self.page_table.lock().state() == PgtblState::Ready
    }

    /// Physical address of the root table page, to be programmed into the
    /// device table of attached devices.
    pub fn page_table_root(&self) -> Option<PhysAddr> {
        self.page_table.lock().root()
    }

    /// Number of table pages currently resident, root included.
    pub fn table_pages(&self) -> usize {
        self.page_table.lock().store().resident()
    }

    /// Reference count of every resident table page, by store index.
    pub fn table_snapshot(&self) -> BTreeMap<PageIndex, u32> {
        let pt = self.page_table.lock();
        let mut snapshot = BTreeMap::new();
        pt.store().for_each(&mut |page| {
            snapshot.insert(page.index(), page.ref_count());
        });
        snapshot
    }

    /// Run `f` against the backing store with the table lock held.
    pub fn with_store<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(self.page_table.lock().store())
    }

    /// Allocate the root table page.
    pub fn alloc_pgtbl(&self) -> IommuResult<()> {
        self.page_table.lock().alloc()
    }

    /// Release the table and every page still in it.
    ///
    /// Called once at domain teardown, after all devices are detached. A
    /// no-op for identity domains.
    pub fn free_pgtbl(&self) {
        self.page_table.lock().free();
    }

    /// Map `entry` to `pages`, one physical page per IOMMU page.
    ///
    /// Pages already mapped inside the range are rewritten in place. On
    /// allocation failure every page from `entry.start` up to the one that
    /// failed is unmapped, including pages that were mapped before this
    /// call, so a failed remap can drop existing translations.
    ///
    /// # Arguments
    ///
    /// * `entry` - Device address range (page-aligned, non-empty)
    /// * `pages` - Page-aligned physical pages, exactly one per IOMMU page
    /// * `flags` - Access granted to the device; READ or WRITE required
    /// * `alloc` - Whether table page allocation may sleep
    ///
    /// # Returns
    ///
    /// * `Ok(())` - Mapping installed and invalidated
    /// * `Err(IommuError)` - Rejected or out of table pages
    pub fn map(
        &self,
        entry: &MapEntry,
        pages: &[PhysAddr],
        flags: MapFlags,
        alloc: AllocFlags,
    ) -> IommuResult<()> {
        let size = self.check_range(entry)?;
        if size == 0 {
            return Err(IommuError::InvalidRange);
        }
        if !flags.grants_access() {
            return Err(IommuError::InvalidPermissions);
        }
        if pages.len() as u64 != size / IOMMU_PAGE_SIZE {
            return Err(IommuError::InvalidRange);
        }
        if pages.iter().any(|page| page.as_u64() & IOMMU_PAGE_MASK != 0) {
            return Err(IommuError::InvalidRange);
        }
        let pflags: PteFlags = flags.pte_flags();

        let mut detached = Vec::new();
        let result = {
            let mut pt = self.page_table.lock();
            self.check_table(&pt)?;
            pt.map(entry.start, pages, pflags, alloc, &mut detached)
        };

        // Invalidate even after a rollback: the walk may have been seen.
        self.invalidator
            .invalidate_range(self.id, entry.start, size, alloc.contains(AllocFlags::WAITOK));
        self.reclaim(detached);

        result.map(|_| ())
    }

    /// Unmap `entry`, freeing table pages that become empty.
    ///
    /// The range must have been mapped in full; unmapping anything else is a
    /// fatal table inconsistency. An empty range is a no-op.
    pub fn unmap(&self, entry: &MapEntry, alloc: AllocFlags) -> IommuResult<()> {
        let size = self.check_range(entry)?;
        if size == 0 {
            return Ok(());
        }

        let mut detached = Vec::new();
        {
            let mut pt = self.page_table.lock();
            self.check_table(&pt)?;
            pt.unmap(entry.start, size, &mut detached);
        }

        self.invalidator
            .invalidate_range(self.id, entry.start, size, alloc.contains(AllocFlags::WAITOK));
        self.reclaim(detached);
        Ok(())
    }

    /// Translate a device address through the table.
    ///
    /// Returns the physical address of the byte at `iova` and the leaf
    /// flags, or `None` if nothing is mapped there.
    pub fn translate(&self, iova: u64) -> Option<(PhysAddr, PteFlags)> {
        if iova >= self.end {
            return None;
        }
        let mut pt = self.page_table.lock();
        if pt.state() != PgtblState::Ready {
            return None;
        }
        let pte = pt.lookup(iova & !IOMMU_PAGE_MASK)?;
        Some((pte.addr() + (iova & IOMMU_PAGE_MASK), pte.flags()))
    }

    /// Validate alignment and bounds of `entry`; returns its size.
    fn check_range(&self, entry: &MapEntry) -> IommuResult<u64> {
        if entry.start & IOMMU_PAGE_MASK != 0 || entry.end & IOMMU_PAGE_MASK != 0 {
            klog!(Debug, "iommu: domain {} misaligned range {:?}", self.id, entry);
            return Err(IommuError::InvalidRange);
        }
        let size = entry.end.checked_sub(entry.start).ok_or(IommuError::InvalidRange)?;
        if size != 0 && (entry.start >= self.end || entry.end > self.end) {
            klog!(Debug, "iommu: domain {} range {:?} out of bounds", self.id, entry);
            return Err(IommuError::InvalidRange);
        }
        Ok(size)
    }

    fn check_table(&self, pt: &Pgtbl<S>) -> IommuResult<()> {
        match pt.state() {
            PgtblState::Ready => Ok(()),
            PgtblState::Unallocated => Err(IommuError::NotInitialized),
            PgtblState::Identity => Err(IommuError::IdentityMapped),
        }
    }

    /// Hand frames of unlinked table pages back once invalidation is done.
    fn reclaim(&self, detached: Vec<TablePage>) {
        if detached.is_empty() {
            return;
        }
        let mut pt = self.page_table.lock();
        for page in detached {
            pt.store_mut().reclaim(page);
        }
    }
}
