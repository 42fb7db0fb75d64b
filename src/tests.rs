extern crate std;

use std::{collections::BTreeMap, ops::Range, ptr::NonNull};

use crate::ArenaSource;

/// Tracks which address ranges are handed out to clients and detects
/// overlapping allocations.
#[derive(Debug)]
pub struct ShadowAllocator {
    regions: BTreeMap<usize, SaRegion>,
}

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum SaRegion {
    Free,
    Used,
    Invalid,
}

impl Default for ShadowAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowAllocator {
    pub fn new() -> Self {
        Self {
            regions: Some((0, SaRegion::Invalid)).into_iter().collect(),
        }
    }

    pub fn convert_range(
        &mut self,
        range: Range<usize>,
        old_region: SaRegion,
        new_region: SaRegion,
    ) {
        if range.len() == 0 {
            return;
        }

        assert_ne!(old_region, new_region);
        log::trace!(
            "sa: converting {:?} from {:?} to {:?}",
            range,
            old_region,
            new_region
        );

        let (&addr, &region) = self.regions.range(0..range.end).rev().next().unwrap();
        if addr > range.start {
            panic!("there's a discontinuity in range {:?}", range);
        } else if region != old_region {
            panic!(
                "range {:?} is {:?} (expected {:?})",
                range, region, old_region
            );
        }

        // Start a new region at `range.start`
        if addr == range.start {
            *self.regions.get_mut(&addr).unwrap() = new_region;
        } else {
            self.regions.insert(range.start, new_region);
        }

        // Adjacent entries must differ, so drop the entry at `range.start` if
        // it merely continues the preceding region
        if let Some((_, &region)) = self.regions.range(0..range.start).rev().next() {
            if region == new_region {
                self.regions.remove(&range.start);
            }
        }

        if let Some(&end_region) = self.regions.get(&range.end) {
            // Likewise for the entry at `range.end`
            if end_region == new_region {
                self.regions.remove(&range.end);
            }
        } else {
            // The rest keeps its old state
            self.regions.insert(range.end, old_region);
        }
    }

    /// Mark a region newly obtained from an arena source as available.
    pub fn insert_free_block(&mut self, start: NonNull<u8>, len: usize) {
        let start = start.as_ptr() as usize;
        self.convert_range(start..start + len, SaRegion::Invalid, SaRegion::Free);
    }

    pub fn allocate(&mut self, start: NonNull<u8>, len: usize) {
        let start = start.as_ptr() as usize;
        assert!(
            start % crate::GRANULARITY == 0,
            "0x{:x} is not properly aligned",
            start
        );
        self.convert_range(start..start + len, SaRegion::Free, SaRegion::Used);
    }

    pub fn deallocate(&mut self, start: NonNull<u8>, len: usize) {
        let start = start.as_ptr() as usize;
        self.convert_range(start..start + len, SaRegion::Used, SaRegion::Free);
    }
}

/// An [`ArenaSource`] wrapper recording every extension in a
/// [`ShadowAllocator`] and checking the contiguity of the returned regions.
#[derive(Debug, Default)]
pub struct TrackingSource<T> {
    pub sa: ShadowAllocator,
    pub inner: T,
    pub num_extensions: usize,
    brk: Option<usize>,
}

impl<T> TrackingSource<T> {
    pub fn new(inner: T) -> Self {
        Self {
            sa: ShadowAllocator::new(),
            inner,
            num_extensions: 0,
            brk: None,
        }
    }
}

unsafe impl<T: ArenaSource> ArenaSource for TrackingSource<T> {
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        log::trace!("ArenaSource::extend({:?})", len);
        let region = self.inner.extend(len)?;
        log::trace!(" ArenaSource::extend(...) = {:?}", region);

        let start = region.as_ptr() as usize;
        match self.brk {
            Some(brk) => assert_eq!(start, brk, "the arena is not contiguous"),
            None => assert_eq!(start % crate::GRANULARITY, 0),
        }
        self.brk = Some(start + len);
        self.num_extensions += 1;

        self.sa.insert_free_block(region, len);
        Some(region)
    }
}
