use std::{io, sync::Arc};

use libc::c_int;
use memsniff_core::{FaultDispatcher, MemoryAccess, PageRange};

use crate::{Error, IntoExt as _, signal};

/// Protection backend on top of `mprotect` and `sigaction`.
pub struct PosixDriver {
    page_size: usize,
}

impl PosixDriver {
    pub fn new() -> Result<Self, Error> {
        // SAFETY: `sysconf` has no preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(Self {
            page_size: page_size as usize,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_protection(&self, range: PageRange, access: MemoryAccess) -> Result<(), Error> {
        tracing::trace!(%range, %access, "set protection");

        let protection: c_int = access.into_ext();

        // SAFETY: The range is page aligned. Whether it is mapped is checked
        // by the kernel, which reports unmapped pages as `ENOMEM`.
        let result = unsafe { libc::mprotect(range.start().as_mut_ptr(), range.len(), protection) };

        if result != 0 {
            let source = io::Error::last_os_error();
            tracing::warn!(%range, %access, %source, "mprotect failed");
            return Err(Error::Protection {
                range,
                access,
                source,
            });
        }

        Ok(())
    }

    pub fn install(&self, dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), Error> {
        signal::install(dispatcher)
    }

    pub fn uninstall(&self) -> Result<(), Error> {
        signal::uninstall()
    }

    pub fn is_installed(&self) -> bool {
        signal::is_installed()
    }
}
