//! Page-granularity write tracking.
//!
//! The [`MemorySniffer`] reports which pages of registered memory regions
//! were written between two checkpoints, without instrumenting the code
//! that writes them. Tracked pages are write-protected; the first write to
//! such a page raises a protection fault, which the backend's fault hook
//! routes back to the sniffer. The sniffer records the page as touched,
//! restores write access and lets the faulting instruction retry.
//!
//! A typical checkpoint cycle:
//!
//! 1. [`create_region`] once per buffer of interest.
//! 2. [`protect`] to start observing.
//! 3. Let the application run.
//! 4. [`touched_pages_and_reset`] to collect the pages written since (2).
//! 5. Back to (2).
//!
//! The sniffer has no threads of its own. All bookkeeping is guarded by a
//! single re-entrant lock, taken both by the lifecycle API and by the fault
//! path, which runs inline on whichever thread faulted.
//!
//! [`create_region`]: MemorySniffer::create_region
//! [`protect`]: MemorySniffer::protect
//! [`touched_pages_and_reset`]: MemorySniffer::touched_pages_and_reset

mod backend;
mod config;
mod core;
mod deferred;
mod error;
mod handler;
pub mod hook;
pub mod registry;
mod stats;


use std::{
    cell::{Cell, RefCell},
    collections::BTreeSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::ReentrantMutex;

pub use self::{
    backend::SniffBackend,
    config::UnveilPolicy,
    core::{
        Address, MemoryAccess, PageRange, is_page_aligned, page_align_down, page_align_up,
    },
    error::SniffError,
    handler::{Fault, FaultAccess, FaultDispatcher, FaultOutcome},
    hook::FaultHook,
    registry::{RegionHandle, RegionRegistry, TrackedRegion},
    stats::SnifferStats,
};
use self::{deferred::DeferredFaults, registry::RegionHandles, stats::Counters};

thread_local! {
    /// The last page this thread was sent back to retry after it had been
    /// released, with the protection epoch of that decision.
    static RETRIED: Cell<(usize, u64)> = const { Cell::new((0, 0)) };
}

/// Summary of a tracked region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    /// Handle of the region.
    pub handle: RegionHandle,

    /// First byte of the region.
    pub begin: Address,

    /// Size of the region in bytes.
    pub size: usize,

    /// Page-aligned super-range of the region.
    pub range: PageRange,

    /// Protection the region is armed with, if any.
    pub protection: Option<MemoryAccess>,

    /// Number of pages touched since the last reset.
    pub touched: usize,
}

/// The write-tracking engine.
///
/// Construct one per process, wrap it in an [`Arc`] and [`install`] it;
/// consumers then share it by reference. Only one engine can have its
/// fault hook installed at a time.
///
/// [`install`]: Self::install
pub struct MemorySniffer<Backend>
where
    Backend: SniffBackend,
{
    backend: Backend,
    page_size: usize,
    policy: UnveilPolicy,

    registry: ReentrantMutex<RefCell<RegionRegistry>>,
    deferred: DeferredFaults,
    counters: Counters,

    /// Bumped whenever pages stop trapping.
    epoch: AtomicU64,
}

impl<Backend> MemorySniffer<Backend>
where
    Backend: SniffBackend,
{
    /// Creates a new `MemorySniffer` on top of the given backend.
    ///
    /// Faults unprotect only the faulting page by default; see
    /// [`with_unveil_policy`].
    ///
    /// [`with_unveil_policy`]: Self::with_unveil_policy
    pub fn new(backend: Backend) -> Result<Self, SniffError> {
        let page_size = backend.page_size();
        if !page_size.is_power_of_two() {
            return Err(SniffError::InvalidPageSize(page_size));
        }

        Ok(Self {
            backend,
            page_size,
            policy: UnveilPolicy::default(),
            registry: ReentrantMutex::new(RefCell::new(RegionRegistry::new(page_size))),
            deferred: DeferredFaults::new(),
            counters: Counters::default(),
            epoch: AtomicU64::new(0),
        })
    }

    /// Sets the unveil policy of regions without a policy of their own.
    pub fn with_unveil_policy(mut self, policy: UnveilPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the default unveil policy.
    pub fn unveil_policy(&self) -> UnveilPolicy {
        self.policy
    }

    /// Returns the backend.
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns a snapshot of the engine's counters.
    pub fn stats(&self) -> SnifferStats {
        self.counters.snapshot()
    }

    /// Installs the process-wide fault hook and routes faults to this
    /// engine.
    ///
    /// The hook keeps a reference to the engine until [`uninstall`] is
    /// called.
    ///
    /// [`uninstall`]: Self::uninstall
    pub fn install(self: &Arc<Self>) -> Result<(), SniffError>
    where
        Backend: 'static,
    {
        self.backend.install(self.clone())?;
        tracing::debug!(page_size = self.page_size, "fault hook installed");
        Ok(())
    }

    /// Uninstalls the process-wide fault hook.
    ///
    /// Regions stay protected; writes to them fault without being
    /// handled until the hook is installed again.
    pub fn uninstall(&self) -> Result<(), SniffError> {
        self.backend.uninstall()?;
        tracing::debug!("fault hook uninstalled");
        Ok(())
    }

    /// Checks if the process-wide fault hook is installed.
    pub fn is_installed(&self) -> bool {
        self.backend.is_installed()
    }

    /// Registers `[address, address + size)` for write tracking.
    ///
    /// The region starts out unprotected. Fails if an identical region
    /// exists or if the range overlaps a tracked region.
    ///
    /// # Safety
    ///
    /// The range must stay mapped until the region is removed. While the
    /// region is protected, the memory must not be written by the kernel
    /// on the process's behalf (system calls report such writes as
    /// errors instead of faulting).
    pub unsafe fn create_region(
        &self,
        address: impl Into<Address>,
        size: usize,
    ) -> Result<RegionHandle, SniffError> {
        let address = address.into();

        self.with_registry(|registry| {
            let handle = registry.insert(address, size)?;
            tracing::debug!(%handle, %address, size, "region created");
            Ok(handle)
        })
    }

    /// Removes a region and invalidates its handle.
    ///
    /// A protected region has read-write access restored first. If that
    /// fails, the region is removed anyway and the error is returned.
    pub fn remove_region(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.with_registry(|registry| {
            let traps = registry.get(handle)?.traps();

            let result = match registry.unprotect_range(handle)? {
                Some(range) if traps => self.release(registry, range),
                _ => Ok(()),
            };

            let region = registry.remove(handle)?;
            self.publish_trapping(registry);

            match &result {
                Ok(()) => tracing::debug!(%handle, begin = %region.begin(), "region removed"),
                Err(err) => tracing::warn!(
                    %handle,
                    begin = %region.begin(),
                    %err,
                    "region removed, but its protection could not be restored"
                ),
            }

            result
        })
    }

    /// Write-protects the region; writes to it are recorded from now on.
    pub fn protect(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.protect_with(handle, MemoryAccess::R)
    }

    /// Read-protects the region; reads from it fault from now on.
    pub fn read_protect(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.protect_with(handle, MemoryAccess::W)
    }

    /// Arms the region without trapping anything.
    ///
    /// Pages are reported only through [`write_range`] and
    /// [`mark_touched`], for producers that learn about writes from
    /// elsewhere (DMA-style copies, OS write-watch lists).
    ///
    /// [`write_range`]: Self::write_range
    /// [`mark_touched`]: Self::mark_touched
    pub fn watch(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.protect_with(handle, MemoryAccess::RW)
    }

    /// Applies `access` to the page-aligned super-range of the region and
    /// starts tracking it.
    ///
    /// Protecting an already protected region re-applies the protection,
    /// which also re-traps pages a previous fault unprotected.
    /// Arming a trapping region with `RW` makes it writable again.
    pub fn protect_with(&self, handle: RegionHandle, access: MemoryAccess) -> Result<(), SniffError> {
        self.with_registry(|registry| {
            let region = registry.get(handle)?;
            let range = region.range();

            if access.traps() {
                self.set_protection(range, access)?;
            } else if region.traps()
                && let Some(range) = registry.unprotect_range(handle)?
            {
                self.release(registry, range)?;
            }

            registry.get_mut(handle)?.set_protected(access);
            self.publish_trapping(registry);

            tracing::debug!(%handle, %range, %access, "region protected");
            Ok(())
        })
    }

    /// Restores read-write access to the region and stops tracking it.
    ///
    /// A border page shared with a neighbor that is still tracked stays
    /// protected. Touched pages recorded so far are kept until the next
    /// reset.
    pub fn unprotect(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.with_registry(|registry| {
            if registry.get(handle)?.traps()
                && let Some(range) = registry.unprotect_range(handle)?
            {
                self.release(registry, range)?;
            }

            registry.get_mut(handle)?.set_unprotected();
            self.publish_trapping(registry);

            tracing::debug!(%handle, "region unprotected");
            Ok(())
        })
    }

    /// Checks if the region is being tracked.
    pub fn is_protected(&self, handle: RegionHandle) -> Result<bool, SniffError> {
        self.with_registry(|registry| Ok(registry.get(handle)?.is_protected()))
    }

    /// Overrides the unveil policy of a single region.
    pub fn set_unveil_policy(
        &self,
        handle: RegionHandle,
        policy: UnveilPolicy,
    ) -> Result<(), SniffError> {
        self.with_registry(|registry| {
            registry.get_mut(handle)?.set_policy(policy);
            Ok(())
        })
    }

    /// Returns the pages touched since the last reset.
    pub fn touched_pages(&self, handle: RegionHandle) -> Result<BTreeSet<Address>, SniffError> {
        self.with_registry(|registry| Ok(registry.get(handle)?.touched().clone()))
    }

    /// Returns the pages touched since the last reset and resets the set.
    ///
    /// No fault can be recorded between the read and the reset.
    pub fn touched_pages_and_reset(
        &self,
        handle: RegionHandle,
    ) -> Result<BTreeSet<Address>, SniffError> {
        self.with_registry(|registry| Ok(registry.get_mut(handle)?.take_touched()))
    }

    /// Forgets the pages touched so far.
    pub fn reset(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.with_registry(|registry| {
            registry.get_mut(handle)?.reset();
            Ok(())
        })
    }

    /// Records `pages` as touched in the region, without any fault.
    ///
    /// Pages outside the region are ignored. Returns the number of newly
    /// recorded pages.
    pub fn mark_touched(
        &self,
        handle: RegionHandle,
        pages: impl IntoIterator<Item = Address>,
    ) -> Result<usize, SniffError> {
        self.with_registry(|registry| {
            let region = registry.get_mut(handle)?;
            Ok(pages.into_iter().filter(|&page| region.mark(page)).count())
        })
    }

    /// Records every page of the region as touched.
    ///
    /// This is the fallback when the region could not be protected: the
    /// consumer then captures the region in full.
    pub fn mark_all_touched(&self, handle: RegionHandle) -> Result<(), SniffError> {
        self.with_registry(|registry| {
            registry.get_mut(handle)?.mark_all();
            Ok(())
        })
    }

    /// Records `[address, address + size)` as written in every tracked
    /// region it overlaps.
    ///
    /// Returns the number of regions that recorded at least one page.
    pub fn write_range(&self, address: impl Into<Address>, size: usize) -> usize {
        let Some(range) = PageRange::covering(address.into(), size, self.page_size) else {
            return 0;
        };

        self.with_registry(|registry| {
            let mut marked = 0;

            for handle in registry.range_regions(range) {
                let Ok(region) = registry.get_mut(handle) else {
                    continue;
                };

                if !region.is_protected() {
                    continue;
                }

                if let Some(overlap) = range.intersect(&region.range()) {
                    overlap.pages().for_each(|page| {
                        region.mark(page);
                    });
                    marked += 1;
                }
            }

            marked
        })
    }

    /// Returns the number of regions.
    pub fn region_count(&self) -> usize {
        self.with_registry(|registry| registry.len())
    }

    /// Returns a summary of every region, in address order.
    pub fn regions(&self) -> Vec<RegionInfo> {
        self.with_registry(|registry| {
            registry
                .iter()
                .map(|(handle, region)| RegionInfo {
                    handle,
                    begin: region.begin(),
                    size: region.size(),
                    range: region.range(),
                    protection: region.protection(),
                    touched: region.touched().len(),
                })
                .collect()
        })
    }

    /// Dumps the registry state.
    pub fn dump(&self) {
        for info in self.regions() {
            tracing::debug!(
                handle = %info.handle,
                begin = %info.begin,
                size = info.size,
                range = %info.range,
                protection = ?info.protection,
                touched = info.touched,
            );
        }
    }

    fn with_registry<T>(&self, f: impl FnOnce(&mut RegionRegistry) -> T) -> T {
        let guard = self.registry.lock();
        let mut registry = guard.borrow_mut();
        self.attribute_deferred(&mut registry);
        f(&mut registry)
    }

    fn set_protection(&self, range: PageRange, access: MemoryAccess) -> Result<(), SniffError> {
        self.backend.set_protection(range, access)?;
        Counters::bump(&self.counters.protection_changes);
        Ok(())
    }

    /// Makes `range` writable on behalf of a region that stops trapping.
    ///
    /// Faults already in flight on the range find no trapping region once
    /// they get the lock; the epoch tells them the page was ours.
    fn release(&self, registry: &mut RegionRegistry, range: PageRange) -> Result<(), SniffError> {
        self.set_protection(range, MemoryAccess::RW)?;
        registry.note_released(range);
        self.epoch.fetch_add(1, Ordering::Release);
        Ok(())
    }

    fn publish_trapping(&self, registry: &RegionRegistry) {
        self.deferred.publish(registry.trapping_ranges());
    }

    fn attribute_deferred(&self, registry: &mut RegionRegistry) {
        if self.deferred.take_lost() {
            tracing::warn!("deferred faults were lost, marking every trapping region touched");
            registry.mark_all_trapping();
        }

        self.deferred.drain(|page| {
            for handle in registry.protected_page_regions(page) {
                if let Ok(region) = registry.get_mut(handle) {
                    region.mark(page);
                }
            }
        });
    }

    /// Restores write access from the fault path.
    ///
    /// A failure leaves the page trapped; the fault is still reported as
    /// handled, so the write is retried and faults again.
    fn restore(&self, range: PageRange) {
        match self.backend.set_protection(range, MemoryAccess::RW) {
            Ok(()) => Counters::bump(&self.counters.protection_changes),
            Err(err) => {
                Counters::bump(&self.counters.restore_failures);
                tracing::warn!(%range, %err, "failed to restore write access");
            }
        }
    }

    fn resolve_fault(
        &self,
        registry: &mut RegionRegistry,
        fault: Fault,
        page: Address,
        epoch: u64,
    ) -> FaultOutcome {
        let handles = registry.protected_page_regions(page);
        let trapped = handles
            .iter()
            .any(|&handle| registry.get(handle).is_ok_and(TrackedRegion::traps));

        if !trapped {
            if self.is_stale(registry, page, epoch) {
                Counters::bump(&self.counters.faults_stale);
                tracing::trace!(address = %fault.address, %page, "stale fault, retrying");
                return FaultOutcome::Handled;
            }

            Counters::bump(&self.counters.faults_foreign);
            return FaultOutcome::NotHandled;
        }

        let mut unveil = RegionHandles::new();

        for &handle in &handles {
            let Ok(region) = registry.get_mut(handle) else {
                continue;
            };

            region.mark(page);

            let policy = region.policy().unwrap_or(self.policy);
            if policy == UnveilPolicy::WholeRegion && !region.is_unveiled() {
                region.mark_all();
                region.set_unveiled();
                unveil.push(handle);
            }
        }

        self.restore(PageRange::page(page, self.page_size));

        for handle in unveil {
            if let Ok(Some(range)) = registry.unprotect_range(handle) {
                self.restore(range);
                registry.note_released(range);
                self.epoch.fetch_add(1, Ordering::Release);
            }
        }

        Counters::bump(&self.counters.faults_handled);
        tracing::trace!(
            address = %fault.address,
            access = ?fault.access,
            %page,
            regions = handles.len(),
            "fault handled"
        );

        FaultOutcome::Handled
    }

    /// Checks if a fault on a page no region traps was raised while the
    /// page was still ours.
    ///
    /// That is the case if pages were released since the fault was taken.
    /// A page released just before the handler read the epoch is retried
    /// once; a fault that comes back with nothing released in between is
    /// somebody else's.
    fn is_stale(&self, registry: &RegionRegistry, page: Address, epoch: u64) -> bool {
        let current = self.epoch.load(Ordering::Acquire);
        if current != epoch {
            return true;
        }

        if !registry.was_released(page) {
            return false;
        }

        let attempt = (page.0, current);
        RETRIED.with(|retried| retried.replace(attempt) != attempt)
    }

    /// Resolves a fault that arrived while the registry is borrowed by the
    /// faulting thread itself.
    fn defer_fault(&self, page: Address) -> FaultOutcome {
        if !self.deferred.covers(page) {
            Counters::bump(&self.counters.faults_foreign);
            return FaultOutcome::NotHandled;
        }

        if !self.deferred.push(page) {
            tracing::warn!(%page, "deferred fault buffer full, every trapping region is marked");
        }

        Counters::bump(&self.counters.faults_deferred);
        self.restore(PageRange::page(page, self.page_size));
        FaultOutcome::Handled
    }
}

impl<Backend> FaultDispatcher for MemorySniffer<Backend>
where
    Backend: SniffBackend,
{
    fn on_fault(&self, fault: Fault) -> FaultOutcome {
        let page = page_align_down(fault.address, self.page_size);
        let epoch = self.epoch.load(Ordering::Acquire);

        let guard = self.registry.lock();
        let Ok(mut registry) = guard.try_borrow_mut() else {
            return self.defer_fault(page);
        };

        self.attribute_deferred(&mut registry);
        self.resolve_fault(&mut registry, fault, page, epoch)
    }
}

impl<Backend> Drop for MemorySniffer<Backend>
where
    Backend: SniffBackend,
{
    fn drop(&mut self) {
        let registry = self.registry.get_mut().get_mut();

        for (handle, region) in registry.iter() {
            if !region.traps() {
                continue;
            }

            if let Err(err) = self.backend.set_protection(region.range(), MemoryAccess::RW) {
                tracing::warn!(%handle, %err, "failed to restore protection on drop");
            }
        }
    }
}
