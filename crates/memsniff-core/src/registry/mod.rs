//! Bookkeeping of tracked regions.
//!
//! The registry keeps all regions in an arena addressed by
//! [`RegionHandle`]s and indexes them by their first byte. Regions never
//! overlap byte-wise, but two neighbors may share the page at their common
//! border. The registry itself performs no protection changes and no
//! locking; the engine wraps it.

mod region;
mod slot;

use std::collections::{BTreeMap, VecDeque};

use smallvec::SmallVec;

pub use self::{region::TrackedRegion, slot::RegionHandle};
use self::slot::SlotMap;
use crate::{Address, PageRange, SniffError};

/// Handles of the regions overlapping a query.
///
/// Almost every query hits at most the two regions sharing a border page.
pub type RegionHandles = SmallVec<[RegionHandle; 2]>;

/// Number of released ranges remembered by [`RegionRegistry::was_released`].
const RELEASED_CAPACITY: usize = 16;

/// Ordered set of non-overlapping tracked regions.
pub struct RegionRegistry {
    page_size: usize,

    /// * Key: first byte of the region
    /// * Value: handle of the region
    ///
    /// Kept in sync with `regions`.
    by_begin: BTreeMap<Address, RegionHandle>,

    regions: SlotMap<TrackedRegion>,

    /// Ranges most recently made writable by `unprotect`, `remove` or an
    /// unveiling fault, newest last.
    released: VecDeque<PageRange>,
}

impl RegionRegistry {
    /// Creates an empty registry for pages of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        debug_assert!(page_size.is_power_of_two());

        Self {
            page_size,
            by_begin: BTreeMap::new(),
            regions: SlotMap::new(),
            released: VecDeque::with_capacity(RELEASED_CAPACITY),
        }
    }

    /// Returns the page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the number of regions.
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    /// Checks if no region is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers `[begin, begin + size)`.
    ///
    /// Fails if an identical region exists, or if the range overlaps the
    /// region right above or right below it.
    pub fn insert(&mut self, begin: Address, size: usize) -> Result<RegionHandle, SniffError> {
        let range =
            PageRange::covering(begin, size, self.page_size).ok_or(SniffError::EmptyRegion)?;
        let end = begin + size;

        if let Some(&existing) = self.by_begin.get(&begin) {
            return match self.regions.get(existing) {
                Some(region) if region.size() == size => Err(SniffError::RegionExists),
                _ => Err(SniffError::RegionOverlap),
            };
        }

        // The next region with a greater start must begin after our end.
        if let Some(next) = self.region_at_or_after(begin)
            && next.begin() < end
        {
            return Err(SniffError::RegionOverlap);
        }

        // The region right below must end before our start.
        if let Some(prev) = self.region_before(begin)
            && prev.end() > begin
        {
            return Err(SniffError::RegionOverlap);
        }

        let handle = self
            .regions
            .insert(TrackedRegion::new(begin, size, range))
            .ok_or(SniffError::Other("region table exhausted"))?;
        self.by_begin.insert(begin, handle);

        Ok(handle)
    }

    /// Removes a region, returning it.
    pub fn remove(&mut self, handle: RegionHandle) -> Result<TrackedRegion, SniffError> {
        let region = self
            .regions
            .remove(handle)
            .ok_or(SniffError::InvalidHandle)?;

        let removed = self.by_begin.remove(&region.begin());
        debug_assert_eq!(removed, Some(handle));

        Ok(region)
    }

    /// Returns the region behind `handle`.
    pub fn get(&self, handle: RegionHandle) -> Result<&TrackedRegion, SniffError> {
        self.regions.get(handle).ok_or(SniffError::InvalidHandle)
    }

    /// Returns the region behind `handle`.
    pub fn get_mut(&mut self, handle: RegionHandle) -> Result<&mut TrackedRegion, SniffError> {
        self.regions.get_mut(handle).ok_or(SniffError::InvalidHandle)
    }

    /// Iterates over all regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = (RegionHandle, &TrackedRegion)> {
        self.by_begin
            .values()
            .filter_map(|&handle| Some((handle, self.regions.get(handle)?)))
    }

    /// Returns the regions whose page range includes `page`.
    pub fn page_regions(&self, page: Address) -> RegionHandles {
        self.range_regions(PageRange::page(page, self.page_size))
    }

    /// Returns the regions whose page range overlaps `range`.
    ///
    /// Besides the regions starting inside `range`, only the region right
    /// below `range.start()` can reach into it: anything further down ends
    /// before that region begins.
    pub fn range_regions(&self, range: PageRange) -> RegionHandles {
        let mut result = RegionHandles::new();

        if let Some((_, &handle)) = self.by_begin.range(..range.start()).next_back()
            && let Some(region) = self.regions.get(handle)
            && region.range().overlaps(&range)
        {
            result.push(handle);
        }

        for (_, &handle) in self.by_begin.range(range.start()..range.end()) {
            result.push(handle);
        }

        result
    }

    /// Returns the tracked regions whose page range includes `page`.
    pub fn protected_page_regions(&self, page: Address) -> RegionHandles {
        let mut result = self.page_regions(page);
        result.retain(|handle| {
            self.regions
                .get(*handle)
                .is_some_and(TrackedRegion::is_protected)
        });
        result
    }

    /// Returns the part of the region's page range that can safely be made
    /// writable.
    ///
    /// A border page shared with another region that still traps is left
    /// out, so that restoring one region never silently untraps its
    /// neighbor. Returns `None` when nothing is left.
    pub fn unprotect_range(&self, handle: RegionHandle) -> Result<Option<PageRange>, SniffError> {
        let region = self.get(handle)?;
        let mut range = region.range();

        let shared_with_trapping = |page: Address| {
            self.page_regions(page).iter().any(|&other| {
                other != handle && self.regions.get(other).is_some_and(TrackedRegion::traps)
            })
        };

        if let Some(first) = range.first_page()
            && shared_with_trapping(first)
        {
            range = range.without_first();
        }

        if let Some(last) = range.last_page()
            && shared_with_trapping(last)
        {
            range = range.without_last();
        }

        Ok((!range.is_empty()).then_some(range))
    }

    /// Iterates over the page ranges of trapping regions, in address order.
    pub fn trapping_ranges(&self) -> impl Iterator<Item = PageRange> {
        self.iter()
            .filter(|(_, region)| region.traps())
            .map(|(_, region)| region.range())
    }

    /// Records every page of every trapping region as touched.
    pub(crate) fn mark_all_trapping(&mut self) {
        for &handle in self.by_begin.values() {
            if let Some(region) = self.regions.get_mut(handle)
                && region.traps()
            {
                region.mark_all();
            }
        }
    }

    /// Remembers `range` as made writable by the engine.
    pub(crate) fn note_released(&mut self, range: PageRange) {
        if self.released.len() == RELEASED_CAPACITY {
            self.released.pop_front();
        }

        self.released.push_back(range);
    }

    /// Checks if `page` lies in one of the recently released ranges.
    pub fn was_released(&self, page: Address) -> bool {
        self.released.iter().any(|range| range.contains(page))
    }

    fn region_at_or_after(&self, address: Address) -> Option<&TrackedRegion> {
        let (_, &handle) = self.by_begin.range(address..).next()?;
        self.regions.get(handle)
    }

    fn region_before(&self, address: Address) -> Option<&TrackedRegion> {
        let (_, &handle) = self.by_begin.range(..address).next_back()?;
        self.regions.get(handle)
    }
}
