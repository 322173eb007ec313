//! Page Store
//!
//! The indexed collection of table pages backing one domain's I/O page
//! table. Each page sits at the index computed by
//! [`pgtbl_index`](crate::pte::pgtbl_index), so "does the level-`l` table
//! covering this address exist" is a single lookup.
//!
//! A store is owned by exactly one domain and is only touched with that
//! domain's table lock held; the trait therefore takes `&mut self` and does
//! no locking of its own.
//!
//! # Reference Counts
//!
//! [`TablePage::ref_count`] is the number of present entries in the page.
//! The root carries one extra, permanent reference taken when the table is
//! allocated, so it never reaches zero through unmapping.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;
use x86_64::PhysAddr;

use crate::pte::{Pte, IOMMU_PAGE_SIZE, NPTEPG};
use crate::view::PageView;
use crate::{IommuError, IommuResult};

/// Position of a table page in its store.
pub type PageIndex = u64;

bitflags! {
    /// How a table walk may obtain missing table pages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AllocFlags: u32 {
        /// The caller may sleep waiting for memory.
        const WAITOK = 1 << 0;
        /// Never materialize pages; report a missing slot instead.
        const NOALLOC = 1 << 1;
    }
}

// ============================================================================
// Table Page
// ============================================================================

/// One physical page of the I/O page table.
pub struct TablePage {
    index: PageIndex,
    phys: PhysAddr,
    ref_count: u32,
    ptes: Box<[Pte; NPTEPG]>,
}

impl TablePage {
    /// Create a zero-filled page backed by the frame at `phys`.
    pub fn new_zeroed(index: PageIndex, phys: PhysAddr) -> Self {
        Self {
            index,
            phys,
            ref_count: 0,
            ptes: Box::new([Pte::empty(); NPTEPG]),
        }
    }

    /// Store index of this page.
    #[inline]
    pub fn index(&self) -> PageIndex {
        self.index
    }

    /// Physical address of the backing frame.
    #[inline]
    pub fn phys(&self) -> PhysAddr {
        self.phys
    }

    /// Number of references currently keeping this page alive.
    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Take one reference.
    #[inline]
    pub fn wire(&mut self) {
        self.ref_count += 1;
    }

    /// Drop one reference; returns `true` when it was the last one.
    pub fn unwire(&mut self) -> bool {
        assert!(
            self.ref_count > 0,
            "table page {} unwired with no references",
            self.index
        );
        self.ref_count -= 1;
        self.ref_count == 0
    }

    /// Forget all references. Only valid while tearing the table down.
    #[inline]
    pub fn clear_ref_count(&mut self) {
        self.ref_count = 0;
    }

    /// Number of present entries.
    pub fn present_entries(&self) -> usize {
        self.ptes.iter().filter(|pte| pte.is_present()).count()
    }

    pub(crate) fn ptes(&self) -> &[Pte; NPTEPG] {
        &self.ptes
    }

    pub(crate) fn ptes_mut(&mut self) -> &mut [Pte; NPTEPG] {
        &mut self.ptes
    }
}

impl core::fmt::Debug for TablePage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TablePage")
            .field("index", &self.index)
            .field("ref_count", &self.ref_count)
            .field("present", &self.present_entries())
            .finish()
    }
}

// ============================================================================
// Store Interface
// ============================================================================

/// Backing storage for one domain's table pages.
pub trait PageStore: Send {
    /// Allocate a zero-filled page at `index`, which must be vacant.
    ///
    /// Without [`AllocFlags::WAITOK`] the store must fail immediately when no
    /// frame is available.
    fn alloc_zeroed(&mut self, index: PageIndex, flags: AllocFlags) -> IommuResult<&mut TablePage>;

    /// Look up a resident page.
    fn get(&self, index: PageIndex) -> Option<&TablePage>;

    /// Look up a resident page for reference count updates.
    fn get_mut(&mut self, index: PageIndex) -> Option<&mut TablePage>;

    /// Detach the page at `index` from the store.
    ///
    /// The index becomes vacant at once; the frame stays allocated until the
    /// page is handed back through [`PageStore::reclaim`].
    fn free(&mut self, index: PageIndex) -> Option<TablePage>;

    /// Return the frame of a detached page to the allocator.
    fn reclaim(&mut self, page: TablePage);

    /// Number of resident pages.
    fn resident(&self) -> usize;

    /// Visit every resident page.
    fn for_each(&self, f: &mut dyn FnMut(&TablePage));

    /// Visit every resident page mutably.
    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut TablePage));

    /// Drop every resident page in one go.
    ///
    /// Callers clear all reference counts first; a referenced page here
    /// means the table was torn down while still in use.
    fn release_all(&mut self);

    /// Map the bytes of the page at `index` for access.
    fn open_view(&mut self, index: PageIndex) -> Option<PageView>;

    /// Unmap a view obtained from [`PageStore::open_view`].
    fn close_view(&mut self, view: PageView);

    /// Number of views currently open.
    fn open_views(&self) -> usize;

    /// Entries of the page behind an open view.
    fn entries(&self, view: &PageView) -> &[Pte; NPTEPG];

    /// Mutable entries of the page behind an open view.
    fn entries_mut(&mut self, view: &PageView) -> &mut [Pte; NPTEPG];

    /// Whether a page is resident at `index`.
    #[inline]
    fn contains(&self, index: PageIndex) -> bool {
        self.get(index).is_some()
    }
}

// ============================================================================
// Heap-backed Store
// ============================================================================

/// Default base of the frame window handed out by [`HeapPageStore`].
pub const DEFAULT_FRAME_BASE: u64 = 0x1000_0000;

/// Page store keeping table pages on the kernel heap.
///
/// Frames are page-aligned addresses carved from a window starting at
/// `frame_base`. Reclaimed frames are reused before the window grows. An
/// optional frame budget makes allocation fail once that many frames are
/// outstanding (detached but unreclaimed pages count against it).
pub struct HeapPageStore {
    pages: BTreeMap<PageIndex, TablePage>,
    frame_base: u64,
    next_frame: u64,
    free_frames: Vec<PhysAddr>,
    frames_in_use: usize,
    frame_limit: Option<usize>,
    views: usize,
}

impl HeapPageStore {
    /// Create an unbounded store at [`DEFAULT_FRAME_BASE`].
    pub fn new() -> Self {
        Self::with_frame_window(PhysAddr::new(DEFAULT_FRAME_BASE), None)
    }

    /// Create a store drawing frames from `base`, holding at most
    /// `frame_limit` frames at a time.
    pub fn with_frame_window(base: PhysAddr, frame_limit: Option<usize>) -> Self {
        debug_assert!(base.is_aligned(IOMMU_PAGE_SIZE));
        Self {
            pages: BTreeMap::new(),
            frame_base: base.as_u64(),
            next_frame: 0,
            free_frames: Vec::new(),
            frames_in_use: 0,
            frame_limit,
            views: 0,
        }
    }

    /// Change the frame budget. Lowering it never revokes frames.
    pub fn set_frame_limit(&mut self, frame_limit: Option<usize>) {
        self.frame_limit = frame_limit;
    }

    /// Frames currently allocated, resident or awaiting reclaim.
    pub fn frames_in_use(&self) -> usize {
        self.frames_in_use
    }

    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        if let Some(limit) = self.frame_limit {
            if self.frames_in_use >= limit {
                return None;
            }
        }
        let frame = match self.free_frames.pop() {
            Some(frame) => frame,
            None => {
                let addr = self
                    .next_frame
                    .checked_mul(IOMMU_PAGE_SIZE)
                    .and_then(|off| off.checked_add(self.frame_base))
                    .and_then(|addr| PhysAddr::try_new(addr).ok())?;
                self.next_frame += 1;
                addr
            }
        };
        self.frames_in_use += 1;
        Some(frame)
    }

    fn free_frame(&mut self, frame: PhysAddr) {
        self.frames_in_use -= 1;
        self.free_frames.push(frame);
    }

    fn page(&self, view: &PageView) -> &TablePage {
        match self.pages.get(&view.index()) {
            Some(page) => page,
            None => panic!("view on vacant table page {}", view.index()),
        }
    }
}

impl Default for HeapPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PageStore for HeapPageStore {
    fn alloc_zeroed(&mut self, index: PageIndex, flags: AllocFlags) -> IommuResult<&mut TablePage> {
        assert!(
            !self.pages.contains_key(&index),
            "table page {} allocated twice",
            index
        );
        let Some(frame) = self.alloc_frame() else {
            // Nothing here can free frames while the caller holds the table
            // lock, so waiting would never finish.
            if flags.contains(AllocFlags::WAITOK) {
                klog!(Warn, "iommu: table frame budget exhausted in sleepable context");
            }
            return Err(IommuError::PageTableAllocFailed);
        };
        Ok(self
            .pages
            .entry(index)
            .or_insert_with(|| TablePage::new_zeroed(index, frame)))
    }

    fn get(&self, index: PageIndex) -> Option<&TablePage> {
        self.pages.get(&index)
    }

    fn get_mut(&mut self, index: PageIndex) -> Option<&mut TablePage> {
        self.pages.get_mut(&index)
    }

    fn free(&mut self, index: PageIndex) -> Option<TablePage> {
        self.pages.remove(&index)
    }

    fn reclaim(&mut self, page: TablePage) {
        self.free_frame(page.phys());
    }

    fn resident(&self) -> usize {
        self.pages.len()
    }

    fn for_each(&self, f: &mut dyn FnMut(&TablePage)) {
        self.pages.values().for_each(|page| f(page));
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut TablePage)) {
        self.pages.values_mut().for_each(|page| f(page));
    }

    fn release_all(&mut self) {
        assert_eq!(self.views, 0, "table released with {} open views", self.views);
        let pages = core::mem::take(&mut self.pages);
        for (index, page) in pages {
            assert_eq!(
                page.ref_count(),
                0,
                "table page {} released while referenced",
                index
            );
            self.free_frame(page.phys());
        }
    }

    fn open_view(&mut self, index: PageIndex) -> Option<PageView> {
        if !self.pages.contains_key(&index) {
            return None;
        }
        self.views += 1;
        Some(PageView::new(index))
    }

    fn close_view(&mut self, view: PageView) {
        debug_assert!(self.views > 0);
        self.views -= 1;
        drop(view);
    }

    fn open_views(&self) -> usize {
        self.views
    }

    fn entries(&self, view: &PageView) -> &[Pte; NPTEPG] {
        self.page(view).ptes()
    }

    fn entries_mut(&mut self, view: &PageView) -> &mut [Pte; NPTEPG] {
        match self.pages.get_mut(&view.index()) {
            Some(page) => page.ptes_mut(),
            None => panic!("view on vacant table page {}", view.index()),
        }
    }
}
