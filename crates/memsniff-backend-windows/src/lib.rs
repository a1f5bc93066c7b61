//! Windows protection backend.
//!
//! Page protection is changed with `VirtualProtect`, and access violations
//! are received by a vectored exception handler. Memory allocated through
//! [`WriteWatch`] can instead be tracked without faults at all, using the
//! OS's own dirty-page lists.

#![cfg(windows)]

mod convert;
mod driver;
mod error;
mod veh;
mod write_watch;

use std::sync::Arc;

use memsniff_core::{FaultDispatcher, MemoryAccess, PageRange, SniffBackend, SniffError};

pub use self::{error::Error, write_watch::WriteWatch};
use self::{convert::IntoExt, driver::WindowsDriver};

/// Protection backend for Windows.
pub struct SniffWindowsBackend {
    inner: WindowsDriver,
}

impl SniffWindowsBackend {
    /// Creates a new Windows backend.
    pub fn new() -> Result<Self, SniffError> {
        Ok(Self {
            inner: WindowsDriver::new()?,
        })
    }
}

impl SniffBackend for SniffWindowsBackend {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn set_protection(&self, range: PageRange, access: MemoryAccess) -> Result<(), SniffError> {
        Ok(self.inner.set_protection(range, access)?)
    }

    fn install(&self, dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), SniffError> {
        Ok(self.inner.install(dispatcher)?)
    }

    fn uninstall(&self) -> Result<(), SniffError> {
        Ok(self.inner.uninstall()?)
    }

    fn is_installed(&self) -> bool {
        self.inner.is_installed()
    }
}
