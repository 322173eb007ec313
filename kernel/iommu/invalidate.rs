//! IOTLB invalidation hook.
//!
//! Hardware caches translations (IOTLB) and table walks. Every change to a
//! domain's table is followed by an invalidation of the affected device
//! address range, including rewrites of entries that were already present.
//! Issuing the command (command buffer, completion wait) belongs to the
//! IOMMU unit driver; the page-table code only calls through this trait.

use crate::DomainId;

/// Receiver of range invalidations for a domain.
pub trait IotlbInvalidator: Send + Sync {
    /// Invalidate cached translations of `[base, base + size)` in `domain`.
    ///
    /// With `wait` set the call returns only after hardware has completed
    /// the invalidation; otherwise it may return once the command is queued.
    fn invalidate_range(&self, domain: DomainId, base: u64, size: u64, wait: bool);
}

/// Invalidator for units without translation enabled, where nothing can be
/// cached.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInvalidator;

impl IotlbInvalidator for NoopInvalidator {
    #[inline]
    fn invalidate_range(&self, _domain: DomainId, _base: u64, _size: u64, _wait: bool) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    /// One recorded invalidation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Invalidation {
        pub(crate) domain: DomainId,
        pub(crate) base: u64,
        pub(crate) size: u64,
        pub(crate) wait: bool,
    }

    /// Invalidator that records every request.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingInvalidator {
        log: Mutex<Vec<Invalidation>>,
    }

    impl RecordingInvalidator {
        pub(crate) fn take(&self) -> Vec<Invalidation> {
            core::mem::take(&mut *self.log.lock())
        }
    }

    impl IotlbInvalidator for RecordingInvalidator {
        fn invalidate_range(&self, domain: DomainId, base: u64, size: u64, wait: bool) {
            self.log.lock().push(Invalidation {
                domain,
                base,
                size,
                wait,
            });
        }
    }
}
