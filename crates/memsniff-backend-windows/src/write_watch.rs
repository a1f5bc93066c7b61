//! Write-watch allocations.
//!
//! Memory allocated with `MEM_WRITE_WATCH` has its dirty pages recorded by
//! the OS itself. Regions over such memory are armed with
//! [`MemorySniffer::watch`] instead of being protected, so no fault is ever
//! raised; the dirty list is handed to the engine by [`WriteWatch::collect`].

use std::{ffi::c_void, io, ptr};

use memsniff_core::{Address, MemorySniffer, RegionHandle, SniffBackend, SniffError};
use windows_sys::Win32::System::Memory::{
    GetWriteWatch, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, MEM_WRITE_WATCH, PAGE_READWRITE,
    ResetWriteWatch, VirtualAlloc, VirtualFree, WRITE_WATCH_FLAG_RESET,
};

/// A committed read-write allocation with OS write tracking.
pub struct WriteWatch {
    base: *mut c_void,
    size: usize,
}

// SAFETY: The allocation is plain memory owned by this value.
unsafe impl Send for WriteWatch {}
unsafe impl Sync for WriteWatch {}

impl WriteWatch {
    /// Reserves and commits `size` bytes with write tracking enabled.
    pub fn allocate(size: usize) -> Result<Self, SniffError> {
        if size == 0 {
            return Err(SniffError::EmptyRegion);
        }

        // SAFETY: Allocating fresh memory has no preconditions.
        let base = unsafe {
            VirtualAlloc(
                ptr::null(),
                size,
                MEM_RESERVE | MEM_COMMIT | MEM_WRITE_WATCH,
                PAGE_READWRITE,
            )
        };

        if base.is_null() {
            return Err(SniffError::Io(io::Error::last_os_error()));
        }

        tracing::debug!(base = %Address::from_ptr(base), size, "write-watch memory allocated");
        Ok(Self { base, size })
    }

    /// Returns the first byte of the allocation.
    pub fn address(&self) -> Address {
        Address::from_ptr(self.base)
    }

    /// Returns the allocation as a raw pointer.
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.base.cast()
    }

    /// Returns the size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Checks if the allocation is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the pages written since the last reset.
    ///
    /// With `reset`, the OS starts recording from scratch.
    pub fn dirty_pages(&self, reset: bool) -> Result<Vec<Address>, SniffError> {
        let flags = if reset { WRITE_WATCH_FLAG_RESET } else { 0 };

        // Never more entries than pages, even at the smallest granularity.
        let mut addresses = vec![ptr::null_mut::<c_void>(); self.size.div_ceil(4096)];
        let mut count = addresses.len();
        let mut granularity = 0u32;

        // SAFETY: `addresses` holds `count` entries.
        let result = unsafe {
            GetWriteWatch(
                flags,
                self.base,
                self.size,
                addresses.as_mut_ptr(),
                &mut count,
                &mut granularity,
            )
        };

        if result != 0 {
            return Err(SniffError::Io(io::Error::last_os_error()));
        }

        addresses.truncate(count);
        Ok(addresses.into_iter().map(Address::from).collect())
    }

    /// Forgets the pages written so far.
    pub fn reset(&self) -> Result<(), SniffError> {
        // SAFETY: The range is the whole write-watch allocation.
        if unsafe { ResetWriteWatch(self.base, self.size) } != 0 {
            return Err(SniffError::Io(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Moves the dirty pages reported by the OS into the touched set of
    /// `handle`, resetting the OS list.
    ///
    /// Returns the number of newly recorded pages.
    pub fn collect<Backend>(
        &self,
        sniffer: &MemorySniffer<Backend>,
        handle: RegionHandle,
    ) -> Result<usize, SniffError>
    where
        Backend: SniffBackend,
    {
        let pages = self.dirty_pages(true)?;
        let marked = sniffer.mark_touched(handle, pages)?;

        tracing::trace!(%handle, marked, "write-watch pages collected");
        Ok(marked)
    }
}

impl Drop for WriteWatch {
    fn drop(&mut self) {
        // SAFETY: `base` came from `VirtualAlloc` and is released once.
        if unsafe { VirtualFree(self.base, 0, MEM_RELEASE) } == 0 {
            tracing::warn!(
                base = %self.address(),
                err = %io::Error::last_os_error(),
                "failed to release write-watch memory"
            );
        }
    }
}
