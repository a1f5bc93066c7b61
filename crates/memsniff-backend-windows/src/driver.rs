use std::{io, sync::Arc};

use memsniff_core::{FaultDispatcher, MemoryAccess, PageRange};
use windows_sys::Win32::System::{
    Memory::{PAGE_PROTECTION_FLAGS, VirtualProtect},
    SystemInformation::{GetSystemInfo, SYSTEM_INFO},
};

use crate::{Error, IntoExt as _, veh};

/// Protection backend on top of `VirtualProtect` and a vectored exception
/// handler.
pub struct WindowsDriver {
    page_size: usize,
}

impl WindowsDriver {
    pub fn new() -> Result<Self, Error> {
        // SAFETY: `GetSystemInfo` fills in the whole structure.
        let info = unsafe {
            let mut info = std::mem::zeroed::<SYSTEM_INFO>();
            GetSystemInfo(&mut info);
            info
        };

        Ok(Self {
            page_size: info.dwPageSize as usize,
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn set_protection(&self, range: PageRange, access: MemoryAccess) -> Result<(), Error> {
        tracing::trace!(%range, %access, "set protection");

        let protection: PAGE_PROTECTION_FLAGS = access.into_ext();
        let mut old: PAGE_PROTECTION_FLAGS = 0;

        // SAFETY: The range is page aligned. Whether it is committed is
        // checked by the OS.
        let result = unsafe {
            VirtualProtect(
                range.start().as_ptr(),
                range.len(),
                protection,
                &mut old,
            )
        };

        if result == 0 {
            let source = io::Error::last_os_error();
            tracing::warn!(%range, %access, %source, "VirtualProtect failed");
            return Err(Error::Protection {
                range,
                access,
                source,
            });
        }

        Ok(())
    }

    pub fn install(&self, dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), Error> {
        veh::install(dispatcher)
    }

    pub fn uninstall(&self) -> Result<(), Error> {
        veh::uninstall()
    }

    pub fn is_installed(&self) -> bool {
        veh::is_installed()
    }
}
