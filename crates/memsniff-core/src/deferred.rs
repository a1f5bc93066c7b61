//! Faults that could not be resolved against the registry right away.
//!
//! A fault can be delivered on a thread that is itself in the middle of
//! mutating the registry (for example when an allocation made under the
//! lock touches a tracked heap page). The registry cannot be borrowed
//! again at that point, so the page is parked here without locking or
//! allocating, and attributed to its regions on the next engine call.
//!
//! Whether such a fault is ours at all is decided against a table of the
//! trapping page ranges, republished by the engine whenever protection
//! changes. The table is double-buffered: the writer holds the registry
//! lock and only ever fills the inactive copy, so a fault interrupting the
//! writer on its own thread still reads a complete table.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{Address, PageRange};

/// Number of pages that can wait for attribution at once.
pub(crate) const CAPACITY: usize = 64;

/// Number of disjoint trapping ranges the table can describe.
pub(crate) const RANGE_CAPACITY: usize = 128;

/// Trapping page ranges, `[start, end)` pairs.
struct RangeTable {
    starts: [AtomicUsize; RANGE_CAPACITY],
    ends: [AtomicUsize; RANGE_CAPACITY],
    len: AtomicUsize,

    /// More ranges were published than fit.
    overflowed: AtomicBool,
}

impl RangeTable {
    const fn new() -> Self {
        Self {
            starts: [const { AtomicUsize::new(0) }; RANGE_CAPACITY],
            ends: [const { AtomicUsize::new(0) }; RANGE_CAPACITY],
            len: AtomicUsize::new(0),
            overflowed: AtomicBool::new(false),
        }
    }

    fn fill(&self, ranges: impl IntoIterator<Item = PageRange>) {
        let mut len = 0;
        let mut overflowed = false;

        for range in ranges {
            let (start, end) = (range.start().0, range.end().0);

            // Neighbors sharing or touching a page collapse into one entry.
            if len > 0 && self.ends[len - 1].load(Ordering::Relaxed) >= start {
                let last = &self.ends[len - 1];
                last.store(last.load(Ordering::Relaxed).max(end), Ordering::Relaxed);
                continue;
            }

            if len == RANGE_CAPACITY {
                overflowed = true;
                break;
            }

            self.starts[len].store(start, Ordering::Relaxed);
            self.ends[len].store(end, Ordering::Relaxed);
            len += 1;
        }

        self.len.store(len, Ordering::Relaxed);
        self.overflowed.store(overflowed, Ordering::Relaxed);
    }

    fn contains(&self, page: Address) -> Option<bool> {
        if self.overflowed.load(Ordering::Relaxed) {
            return None;
        }

        let len = self.len.load(Ordering::Relaxed);
        Some((0..len).any(|index| {
            self.starts[index].load(Ordering::Relaxed) <= page.0
                && page.0 < self.ends[index].load(Ordering::Relaxed)
        }))
    }
}

pub(crate) struct DeferredFaults {
    /// Parked pages; `0` marks an empty slot.
    pages: [AtomicUsize; CAPACITY],

    /// A page could not be parked because every slot was taken.
    lost: AtomicBool,

    tables: [RangeTable; 2],

    /// Index of the table readers use.
    active: AtomicUsize,
}

impl DeferredFaults {
    pub fn new() -> Self {
        Self {
            pages: [const { AtomicUsize::new(0) }; CAPACITY],
            lost: AtomicBool::new(false),
            tables: [RangeTable::new(), RangeTable::new()],
            active: AtomicUsize::new(0),
        }
    }

    /// Publishes the page ranges of trapping regions, in address order.
    ///
    /// Must only be called with the registry lock held.
    pub fn publish(&self, ranges: impl IntoIterator<Item = PageRange>) {
        let inactive = 1 - self.active.load(Ordering::Acquire);
        self.tables[inactive].fill(ranges);
        self.active.store(inactive, Ordering::Release);
    }

    /// Checks if `page` belongs to a trapping region.
    ///
    /// Returns `false` when the table overflowed, since ownership of the
    /// page cannot be proven then.
    pub fn covers(&self, page: Address) -> bool {
        let active = self.active.load(Ordering::Acquire);
        self.tables[active].contains(page).unwrap_or(false)
    }

    /// Parks `page`. If every slot is taken, the page is lost and that is
    /// remembered instead; see [`take_lost`].
    ///
    /// [`take_lost`]: Self::take_lost
    pub fn push(&self, page: Address) -> bool {
        debug_assert!(!page.is_null());

        let parked = self.pages.iter().any(|slot| {
            slot.compare_exchange(0, page.0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        });

        if !parked {
            self.lost.store(true, Ordering::Release);
        }

        parked
    }

    /// Checks and clears whether a page was lost since the last call.
    pub fn take_lost(&self) -> bool {
        self.lost.swap(false, Ordering::AcqRel)
    }

    /// Takes every parked page.
    pub fn drain(&self, mut f: impl FnMut(Address)) {
        for slot in &self.pages {
            let page = slot.swap(0, Ordering::AcqRel);
            if page != 0 {
                f(Address(page));
            }
        }
    }
}
