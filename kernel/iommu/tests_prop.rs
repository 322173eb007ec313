#![cfg(test)]
//! Property-based tests for domain page tables.
//!
//! TEST_SCOPE:
//!   - Mapping disjoint ranges and unmapping them restores the bare root
//!   - Every mapped page translates to the frame it was mapped to
//!   - Reference counts equal present entries (root holds one extra)
//!   - Rewriting a mapped range changes leaves only
//!   - Rejected requests leave the table untouched
//!
//! TEST_SCENARIOS:
//!   - map_unmap_restores_root(): no table page outlives its last mapping
//!   - translate_matches_pages(): leaves point at the requested frames
//!   - refcounts_track_present_entries(): counts agree with entry contents
//!   - remap_keeps_structure(): second map of a range keeps every count
//!   - misaligned_map_is_rejected(): sub-page offsets never touch the table

use alloc::sync::Arc;
use alloc::vec::Vec;
use proptest::prelude::*;
use x86_64::PhysAddr;

use crate::{
    AllocFlags, Domain, HeapPageStore, IommuError, MapEntry, MapFlags, NoopInvalidator,
    PageStore, IOMMU_PAGE_SIZE,
};

/// Windows are 16MB apart, so ranges from distinct windows never overlap.
const WINDOW_SHIFT: u32 = 24;
const WINDOW_PAGES: u64 = 1 << (WINDOW_SHIFT - 12);
const FRAME_BASE: u64 = 0x1_0000_0000;

#[derive(Debug, Clone)]
struct Request {
    entry: MapEntry,
    pages: Vec<PhysAddr>,
}

fn arb_requests() -> impl Strategy<Value = Vec<Request>> {
    proptest::collection::btree_map(0u64..(1 << 16), (0u64..WINDOW_PAGES - 64, 1u64..=64), 1..8)
        .prop_map(|windows| {
            let mut next_frame = FRAME_BASE;
            windows
                .into_iter()
                .map(|(window, (offset, npages))| {
                    let start = (window << WINDOW_SHIFT) + offset * IOMMU_PAGE_SIZE;
                    let pages = (0..npages)
                        .map(|_| {
                            let frame = PhysAddr::new(next_frame);
                            next_frame += IOMMU_PAGE_SIZE;
                            frame
                        })
                        .collect();
                    Request {
                        entry: MapEntry::new(start, start + npages * IOMMU_PAGE_SIZE),
                        pages,
                    }
                })
                .collect()
        })
}

fn arb_flags() -> impl Strategy<Value = MapFlags> {
    (1u32..8)
        .prop_map(MapFlags::from_bits_truncate)
        .prop_filter("grants access", |flags| flags.grants_access())
}

fn new_domain() -> Domain {
    let domain =
        Domain::new_paged(7, 4, HeapPageStore::new(), Arc::new(NoopInvalidator)).unwrap();
    domain.alloc_pgtbl().unwrap();
    domain
}

fn map_all(domain: &Domain, requests: &[Request], flags: MapFlags) {
    for req in requests {
        domain
            .map(&req.entry, &req.pages, flags, AllocFlags::WAITOK)
            .unwrap();
    }
}

proptest! {
    #[test]
    fn map_unmap_restores_root(requests in arb_requests(), flags in arb_flags()) {
        let domain = new_domain();
        let bare = domain.table_snapshot();
        map_all(&domain, &requests, flags);

        for req in requests.iter().rev() {
            domain.unmap(&req.entry, AllocFlags::WAITOK).unwrap();
        }
        prop_assert_eq!(domain.table_snapshot(), bare);
        prop_assert_eq!(domain.mapped_bytes(), 0);
        prop_assert_eq!(domain.with_store(|s| (s.frames_in_use(), s.open_views())), (1, 0));
    }

    #[test]
    fn translate_matches_pages(requests in arb_requests(), flags in arb_flags(), byte in 0u64..4096) {
        let domain = new_domain();
        map_all(&domain, &requests, flags);

        let expected = flags.pte_flags() | crate::PteFlags::PR;
        let mut total = 0;
        for req in &requests {
            for (i, page) in req.pages.iter().enumerate() {
                let iova = req.entry.start + i as u64 * IOMMU_PAGE_SIZE + byte;
                prop_assert_eq!(domain.translate(iova), Some((*page + byte, expected)));
            }
            prop_assert!(domain.translate(req.entry.end).is_none()
                || requests.iter().any(|other| other.entry.start == req.entry.end));
            total += req.entry.size();
        }
        prop_assert_eq!(domain.mapped_bytes(), total);
    }

    #[test]
    fn refcounts_track_present_entries(requests in arb_requests(), unmap_first in 0usize..8) {
        let domain = new_domain();
        map_all(&domain, &requests, MapFlags::READ);
        if let Some(req) = requests.get(unmap_first) {
            domain.unmap(&req.entry, AllocFlags::empty()).unwrap();
        }

        let mismatches = domain.with_store(|store| {
            let mut bad = Vec::new();
            store.for_each(&mut |page| {
                let extra = u32::from(page.index() == 0);
                if page.ref_count() != page.present_entries() as u32 + extra
                    || page.ref_count() == 0
                {
                    bad.push(page.index());
                }
            });
            bad
        });
        prop_assert!(mismatches.is_empty(), "pages with bad counts: {:?}", mismatches);
    }

    #[test]
    fn remap_keeps_structure(requests in arb_requests(), first in arb_flags(), second in arb_flags()) {
        let domain = new_domain();
        map_all(&domain, &requests, first);
        let counts = domain.table_snapshot();
        let bytes = domain.mapped_bytes();

        map_all(&domain, &requests, second);
        prop_assert_eq!(domain.table_snapshot(), counts);
        prop_assert_eq!(domain.mapped_bytes(), bytes);

        let req = &requests[0];
        let (_, leaf) = domain.translate(req.entry.start).unwrap();
        prop_assert_eq!(leaf, second.pte_flags() | crate::PteFlags::PR);
    }

    #[test]
    fn misaligned_map_is_rejected(requests in arb_requests(), skew in 1u64..4096) {
        let domain = new_domain();
        map_all(&domain, &requests[1..], MapFlags::WRITE);
        let before = domain.table_snapshot();

        let req = &requests[0];
        let shifted = MapEntry::new(req.entry.start + skew, req.entry.end + skew);
        prop_assert_eq!(
            domain.map(&shifted, &req.pages, MapFlags::WRITE, AllocFlags::empty()),
            Err(IommuError::InvalidRange)
        );
        prop_assert_eq!(domain.table_snapshot(), before);
        prop_assert!(domain.translate(req.entry.start).is_none());
    }
}
