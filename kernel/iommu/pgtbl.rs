//! Per-domain I/O page table.
//!
//! Table pages are materialized lazily: a mapping walks from the leaf level
//! toward the root until it finds an existing table page, then allocates and
//! links the missing pages top-down. Unmapping clears leaves and releases
//! table pages bottom-up as their last entry goes away.
//!
//! # Locking
//!
//! Everything here runs with the owning domain's table lock held; the
//! [`Domain`](crate::Domain) wraps [`Pgtbl`] in that lock. Table pages
//! unlinked by a walk are returned to the caller instead of being reclaimed,
//! because hardware may still walk them until the IOTLB has been
//! invalidated.

use alloc::vec::Vec;
use x86_64::PhysAddr;

use crate::page_store::{AllocFlags, PageIndex, PageStore, TablePage};
use crate::pte::{pgtbl_index, pte_off, Pte, PteFlags, IOMMU_PAGE_SIZE};
use crate::view::ViewCursor;
use crate::{DomainId, IommuError, IommuResult};

/// Allocation state of a domain's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PgtblState {
    /// Paged domain whose table is not allocated.
    Unallocated,
    /// Root page allocated at store index 0.
    Ready,
    /// Direct map; the domain never has a table.
    Identity,
}

/// Location of one entry: the table page and the slot within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PteSlot {
    pub(crate) index: PageIndex,
    pub(crate) off: usize,
}

/// The table of one domain together with its backing store.
pub(crate) struct Pgtbl<S: PageStore> {
    domain: DomainId,
    pglvl: u8,
    state: PgtblState,
    /// Present leaf entries.
    mapped: u64,
    store: S,
}

impl<S: PageStore> Pgtbl<S> {
    pub(crate) fn new(domain: DomainId, pglvl: u8, store: S) -> Self {
        Self {
            domain,
            pglvl,
            state: PgtblState::Unallocated,
            mapped: 0,
            store,
        }
    }

    pub(crate) fn new_identity(domain: DomainId, store: S) -> Self {
        Self {
            domain,
            pglvl: 0,
            state: PgtblState::Identity,
            mapped: 0,
            store,
        }
    }

    pub(crate) fn state(&self) -> PgtblState {
        self.state
    }

    /// Number of present leaf entries.
    pub(crate) fn mapped_pages(&self) -> u64 {
        self.mapped
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Physical address of the root page, once allocated.
    pub(crate) fn root(&self) -> Option<PhysAddr> {
        match self.state {
            PgtblState::Ready => self.store.get(0).map(TablePage::phys),
            _ => None,
        }
    }

    /// Allocate the root page.
    ///
    /// The root takes one reference that no unmap ever drops, so it stays
    /// resident until [`Pgtbl::free`].
    pub(crate) fn alloc(&mut self) -> IommuResult<()> {
        match self.state {
            PgtblState::Identity => return Err(IommuError::IdentityMapped),
            PgtblState::Ready => return Err(IommuError::AlreadyInitialized),
            PgtblState::Unallocated => {}
        }
        let root = self.store.alloc_zeroed(0, AllocFlags::WAITOK)?;
        root.wire();
        self.state = PgtblState::Ready;
        klog!(
            Info,
            "iommu: domain {} page table allocated ({} levels)",
            self.domain,
            self.pglvl
        );
        Ok(())
    }

    /// Tear the whole table down.
    ///
    /// A no-op for identity domains and for tables never allocated.
    pub(crate) fn free(&mut self) {
        if self.state != PgtblState::Ready {
            return;
        }
        let pages = self.store.resident();
        self.store.for_each_mut(&mut |page| page.clear_ref_count());
        self.store.release_all();
        self.mapped = 0;
        self.state = PgtblState::Unallocated;
        klog!(
            Info,
            "iommu: domain {} page table freed ({} table pages)",
            self.domain,
            pages
        );
    }

    fn walk<'a>(&'a mut self, detached: &'a mut Vec<TablePage>) -> Walk<'a, S> {
        debug_assert_eq!(self.state, PgtblState::Ready);
        Walk {
            cursor: ViewCursor::new(&mut self.store),
            detached,
            mapped: &mut self.mapped,
            domain: self.domain,
            pglvl: self.pglvl,
        }
    }

    /// Install leaf entries for `pages`, one page each starting at `base`.
    ///
    /// Returns how many leaves went from not-present to present. On
    /// allocation failure every leaf installed by this call is removed again.
    pub(crate) fn map(
        &mut self,
        base: u64,
        pages: &[PhysAddr],
        pflags: PteFlags,
        flags: AllocFlags,
        detached: &mut Vec<TablePage>,
    ) -> IommuResult<u64> {
        self.walk(detached).map(base, pages, pflags, flags)
    }

    /// Clear every leaf of `[base, base + size)`.
    ///
    /// The range must be fully mapped; a missing leaf is a fatal
    /// inconsistency.
    pub(crate) fn unmap(&mut self, base: u64, size: u64, detached: &mut Vec<TablePage>) {
        self.walk(detached).unmap(base, size)
    }

    /// Leaf entry covering `base`, if one is present.
    pub(crate) fn lookup(&mut self, base: u64) -> Option<Pte> {
        let mut detached = Vec::new();
        let mut walk = self.walk(&mut detached);
        let leaf = walk.pglvl - 1;
        let slot = walk.locate_or_create_pte(base, leaf, AllocFlags::NOALLOC)?;
        let pte = walk.cursor.entries(slot.index)[slot.off];
        pte.is_present().then_some(pte)
    }
}

// ============================================================================
// Table Walk
// ============================================================================

/// One locked pass over the table.
struct Walk<'a, S: PageStore> {
    cursor: ViewCursor<'a, S>,
    detached: &'a mut Vec<TablePage>,
    mapped: &'a mut u64,
    domain: DomainId,
    pglvl: u8,
}

impl<S: PageStore> Walk<'_, S> {
    #[inline]
    fn index(&self, base: u64, lvl: u8) -> PageIndex {
        pgtbl_index(self.pglvl, base, lvl)
    }

    /// Find the level-`lvl` entry covering `base`, creating the table pages
    /// on the path to it unless `flags` forbids allocation.
    ///
    /// On success the cursor's view is open on the returned slot's page.
    /// `None` means the slot does not exist and could not be created; no
    /// view is left open in that case.
    fn locate_or_create_pte(&mut self, base: u64, lvl: u8, flags: AllocFlags) -> Option<PteSlot> {
        loop {
            let index = self.index(base, lvl);
            if self.cursor.store().contains(index) {
                self.cursor.open(index);
                return Some(PteSlot {
                    index,
                    off: pte_off(self.pglvl, base, lvl),
                });
            }

            self.cursor.release();
            if flags.contains(AllocFlags::NOALLOC) {
                return None;
            }
            if self.materialize(base, lvl, flags).is_err() {
                self.cursor.release();
                return None;
            }
            // The page exists now; the next lookup succeeds.
        }
    }

    /// Create the missing table pages between the deepest existing ancestor
    /// of `(base, lvl)` and level `lvl`, linking each into its parent.
    fn materialize(&mut self, base: u64, lvl: u8, flags: AllocFlags) -> IommuResult<()> {
        let mut top = lvl;
        while top > 0 && !self.cursor.store().contains(self.index(base, top - 1)) {
            top -= 1;
        }
        assert!(
            top > 0,
            "iommu: domain {} has no root table page (base {:#x})",
            self.domain,
            base
        );

        for l in top..=lvl {
            let index = self.index(base, l);
            let phys = match self.cursor.alloc(index, flags) {
                Ok(phys) => phys,
                Err(err) => {
                    klog!(
                        Warn,
                        "iommu: domain {} table page alloc failed at base {:#x} lvl {}",
                        self.domain,
                        base,
                        l
                    );
                    if l > top {
                        // Unlink what this call created so no empty table
                        // stays behind.
                        self.detach(self.index(base, l - 1), l - 1);
                        self.clear_pte(base, l - 2);
                    }
                    return Err(err);
                }
            };

            let parent = self.index(base, l - 1);
            let off = pte_off(self.pglvl, base, l - 1);
            *self.cursor.entry_mut(parent, off) = Pte::new_table(phys, self.pglvl - l);
            self.cursor.page_mut(parent).wire();
            klog!(
                Trace,
                "iommu: domain {} table page {} created at lvl {}",
                self.domain,
                index,
                l
            );
        }
        Ok(())
    }

    /// Clear the present level-`lvl` entry covering `base` and drop the
    /// reference it held on its page, freeing pages upward for as long as
    /// they become empty. The root is never freed.
    fn clear_pte(&mut self, base: u64, mut lvl: u8) {
        loop {
            let index = self.index(base, lvl);
            let pte = self.cursor.entry_mut(index, pte_off(self.pglvl, base, lvl));
            if !pte.is_present() {
                klog_force!(
                    "iommu: domain {} clearing absent pte base {:#x} lvl {}",
                    self.domain,
                    base,
                    lvl
                );
                panic!("iommu: clearing absent pte");
            }
            *pte = Pte::empty();

            if !self.cursor.page_mut(index).unwire() {
                return;
            }
            assert!(
                lvl > 0,
                "iommu: domain {} lost the root table reference (base {:#x})",
                self.domain,
                base
            );
            self.detach(index, lvl);
            lvl -= 1;
        }
    }

    /// Remove an unreferenced page from the store and queue it for reclaim.
    fn detach(&mut self, index: PageIndex, lvl: u8) {
        let page = match self.cursor.free(index) {
            Some(page) => page,
            None => panic!("iommu: domain {} table page {} vanished", self.domain, index),
        };
        debug_assert_eq!(page.ref_count(), 0);
        klog!(
            Trace,
            "iommu: domain {} table page {} freed at lvl {}",
            self.domain,
            index,
            lvl
        );
        self.detached.push(page);
    }

    fn map(
        &mut self,
        base: u64,
        pages: &[PhysAddr],
        pflags: PteFlags,
        flags: AllocFlags,
    ) -> IommuResult<u64> {
        let leaf = self.pglvl - 1;
        let mut fresh = 0;

        for (i, &page) in pages.iter().enumerate() {
            let cur = base + i as u64 * IOMMU_PAGE_SIZE;
            let Some(slot) = self.locate_or_create_pte(cur, leaf, flags) else {
                klog!(
                    Warn,
                    "iommu: domain {} map {:#x}+{:#x} out of table pages, rolling back",
                    self.domain,
                    base,
                    pages.len() as u64 * IOMMU_PAGE_SIZE
                );
                self.unmap(base, cur - base);
                return Err(IommuError::PageTableAllocFailed);
            };

            let pte = self.cursor.entry_mut(slot.index, slot.off);
            let was_present = pte.is_present();
            *pte = Pte::new_leaf(page, pflags);
            // A rewritten leaf already holds its reference.
            if !was_present {
                self.cursor.page_mut(slot.index).wire();
                *self.mapped += 1;
                fresh += 1;
            }
        }

        self.cursor.release();
        Ok(fresh)
    }

    fn unmap(&mut self, base: u64, size: u64) {
        let leaf = self.pglvl - 1;
        let end = base + size;
        let mut cur = base;

        while cur < end {
            if self.locate_or_create_pte(cur, leaf, AllocFlags::NOALLOC).is_none() {
                klog_force!(
                    "iommu: domain {} unmap of unmapped address {:#x}",
                    self.domain,
                    cur
                );
                panic!("iommu: unmap of unmapped range");
            }
            self.clear_pte(cur, leaf);
            *self.mapped -= 1;
            cur += IOMMU_PAGE_SIZE;
        }

        self.cursor.release();
    }
}
