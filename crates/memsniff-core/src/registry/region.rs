use std::collections::BTreeSet;

use crate::{Address, MemoryAccess, PageRange, UnveilPolicy};

/// A contiguous byte range under write tracking.
#[derive(Debug)]
pub struct TrackedRegion {
    begin: Address,
    size: usize,
    range: PageRange,

    /// Protection applied by the last `protect` call, `None` when the
    /// region is not being tracked.
    protection: Option<MemoryAccess>,

    /// Set once the whole region was unprotected by a fault.
    unveiled: bool,

    /// Overrides the engine-wide policy.
    policy: Option<UnveilPolicy>,

    touched: BTreeSet<Address>,
}

impl TrackedRegion {
    pub(crate) fn new(begin: Address, size: usize, range: PageRange) -> Self {
        Self {
            begin,
            size,
            range,
            protection: None,
            unveiled: false,
            policy: None,
            touched: BTreeSet::new(),
        }
    }

    /// Returns the first byte of the region.
    pub fn begin(&self) -> Address {
        self.begin
    }

    /// Returns the size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns one past the last byte of the region.
    pub fn end(&self) -> Address {
        self.begin + self.size
    }

    /// Returns the page-aligned super-range of the region.
    pub fn range(&self) -> PageRange {
        self.range
    }

    /// Checks if the region is being tracked.
    pub fn is_protected(&self) -> bool {
        self.protection.is_some()
    }

    /// Checks if the region is armed with a protection that traps.
    ///
    /// Watched regions are tracked but never trap.
    pub fn traps(&self) -> bool {
        self.protection.is_some_and(MemoryAccess::traps)
    }

    /// Returns the protection the region was armed with.
    pub fn protection(&self) -> Option<MemoryAccess> {
        self.protection
    }

    /// Checks if a fault already unprotected the whole region.
    pub fn is_unveiled(&self) -> bool {
        self.unveiled
    }

    /// Returns the policy override of the region.
    pub fn policy(&self) -> Option<UnveilPolicy> {
        self.policy
    }

    /// Returns the pages touched since the last reset.
    pub fn touched(&self) -> &BTreeSet<Address> {
        &self.touched
    }

    pub(crate) fn set_protected(&mut self, access: MemoryAccess) {
        self.protection = Some(access);
        self.unveiled = false;
    }

    pub(crate) fn set_unprotected(&mut self) {
        self.protection = None;
        self.unveiled = false;
    }

    pub(crate) fn set_unveiled(&mut self) {
        self.unveiled = true;
    }

    pub(crate) fn set_policy(&mut self, policy: UnveilPolicy) {
        self.policy = Some(policy);
    }

    /// Records `page` as touched.
    ///
    /// Returns `true` if the page was newly recorded. Pages outside the
    /// region are ignored.
    pub(crate) fn mark(&mut self, page: Address) -> bool {
        let page = crate::page_align_down(page, self.range.page_size());
        if !self.range.contains(page) {
            return false;
        }

        self.touched.insert(page)
    }

    /// Records every page of the region as touched.
    pub(crate) fn mark_all(&mut self) {
        self.touched.extend(self.range.pages());
    }

    pub(crate) fn take_touched(&mut self) -> BTreeSet<Address> {
        std::mem::take(&mut self.touched)
    }

    pub(crate) fn reset(&mut self) {
        self.touched.clear();
    }
}
