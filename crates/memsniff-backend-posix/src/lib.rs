//! POSIX protection backend.
//!
//! Page protection is changed with `mprotect`, and protection faults are
//! received by a `SIGSEGV`/`SIGBUS` handler that chains to whatever handler
//! was installed before it.
//!
//! # Caveats
//!
//! The handler resolves faults inline: it takes the engine's lock and calls
//! `mprotect` from signal context, neither of which POSIX lists as
//! async-signal-safe. A fault raised while the faulting thread itself holds
//! the engine's lock is resolved without taking it (see
//! [`MemorySniffer`]). Tracked memory must not be written by the kernel on
//! the process's behalf, e.g. as the buffer of a `read` call, because such
//! writes fail with `EFAULT` instead of faulting.
//!
//! [`MemorySniffer`]: memsniff_core::MemorySniffer

mod convert;
mod driver;
mod error;
mod signal;

use std::sync::Arc;

use memsniff_core::{FaultDispatcher, MemoryAccess, PageRange, SniffBackend, SniffError};

pub use self::error::Error;
use self::{convert::IntoExt, driver::PosixDriver};

/// Protection backend for POSIX systems.
pub struct SniffPosixBackend {
    inner: PosixDriver,
}

impl SniffPosixBackend {
    /// Creates a new POSIX backend.
    pub fn new() -> Result<Self, SniffError> {
        Ok(Self {
            inner: PosixDriver::new()?,
        })
    }
}

impl SniffBackend for SniffPosixBackend {
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
