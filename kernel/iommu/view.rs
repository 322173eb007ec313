//! Transient views of table page bytes.
//!
//! Table pages are only read or written through a [`PageView`] obtained from
//! the store. A table walk holds at most one view at a time through a
//! [`ViewCursor`], which swaps the view when the walk moves to a different
//! page and closes it on every exit path, including unwinding.

use x86_64::PhysAddr;

use crate::page_store::{AllocFlags, PageIndex, PageStore, TablePage};
use crate::pte::{Pte, NPTEPG};
use crate::IommuResult;

/// An open mapping of one table page.
///
/// Must be handed back to [`PageStore::close_view`].
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct PageView {
    index: PageIndex,
}

impl PageView {
    /// Token for the page at `index`, for [`PageStore::open_view`]
    /// implementations only.
    #[doc(hidden)]
    pub fn new(index: PageIndex) -> Self {
        Self { index }
    }

    /// Index of the viewed page.
    #[inline]
    pub fn index(&self) -> PageIndex {
        self.index
    }
}

/// Exclusive access to a store with at most one open view.
pub(crate) struct ViewCursor<'a, S: PageStore + ?Sized> {
    store: &'a mut S,
    view: Option<PageView>,
}

impl<'a, S: PageStore + ?Sized> ViewCursor<'a, S> {
    pub(crate) fn new(store: &'a mut S) -> Self {
        Self { store, view: None }
    }

    pub(crate) fn store(&self) -> &S {
        self.store
    }

    /// Page metadata (reference counts). Does not disturb the open view.
    pub(crate) fn page_mut(&mut self, index: PageIndex) -> &mut TablePage {
        match self.store.get_mut(index) {
            Some(page) => page,
            None => panic!("table page {} is not resident", index),
        }
    }

    /// Allocate a zero-filled page at `index` and return its frame.
    pub(crate) fn alloc(&mut self, index: PageIndex, flags: AllocFlags) -> IommuResult<PhysAddr> {
        self.store.alloc_zeroed(index, flags).map(|page| page.phys())
    }

    /// Detach the page at `index`, closing the view on it first.
    pub(crate) fn free(&mut self, index: PageIndex) -> Option<TablePage> {
        if self.current() == Some(index) {
            self.release();
        }
        self.store.free(index)
    }

    /// Make the page at `index` the open view, reusing the current view
    /// when it already covers that page.
    pub(crate) fn open(&mut self, index: PageIndex) {
        if self.view.as_ref().is_some_and(|view| view.index() == index) {
            return;
        }
        self.release();
        match self.store.open_view(index) {
            Some(view) => self.view = Some(view),
            None => panic!("table page {} is not resident", index),
        }
    }

    /// Close the open view, if any.
    pub(crate) fn release(&mut self) {
        if let Some(view) = self.view.take() {
            self.store.close_view(view);
        }
    }

    /// Index of the page behind the open view.
    pub(crate) fn current(&self) -> Option<PageIndex> {
        self.view.as_ref().map(PageView::index)
    }

    /// Entries of the page at `index`, opening a view on it if needed.
    pub(crate) fn entries(&mut self, index: PageIndex) -> &[Pte; NPTEPG] {
        self.open(index);
        match &self.view {
            Some(view) => self.store.entries(view),
            None => unreachable!(),
        }
    }

    /// Entry `off` of the page at `index`, opening a view on it if needed.
    pub(crate) fn entry_mut(&mut self, index: PageIndex, off: usize) -> &mut Pte {
        self.open(index);
        match &self.view {
            Some(view) => &mut self.store.entries_mut(view)[off],
            None => unreachable!(),
        }
    }
}

impl<S: PageStore + ?Sized> Drop for ViewCursor<'_, S> {
    fn drop(&mut self) {
        self.release();
    }
}
