//! Page-granularity write tracking through memory protection faults.
//!
//! `memsniff` reports which pages of registered memory regions were written
//! between two checkpoints, without instrumenting the code that writes
//! them. It is the delta detector of capture systems that snapshot
//! application memory repeatedly and only want to copy what changed.
//!
//! The engine lives in [`memsniff_core`] and is re-exported here. The
//! OS-specific half is a [`SniffBackend`]; the backend of the build target
//! is available as [`DefaultBackend`] when its feature is enabled.
//!
//! # Example
//!
//! ```no_run
//! use std::alloc::{self, Layout};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let sniffer = memsniff::install_default()?;
//!
//! // Whole pages, so that nothing else shares them.
//! let page_size = sniffer.page_size();
//! let layout = Layout::from_size_align(4 * page_size, page_size)?;
//! let buffer = unsafe { alloc::alloc_zeroed(layout) };
//! if buffer.is_null() {
//!     alloc::handle_alloc_error(layout);
//! }
//!
//! let handle = unsafe { sniffer.create_region(buffer, layout.size())? };
//! sniffer.protect(handle)?;
//!
//! unsafe { buffer.write_volatile(1) };
//!
//! let touched = sniffer.touched_pages_and_reset(handle)?;
//! assert!(!touched.is_empty());
//!
//! sniffer.remove_region(handle)?;
//! sniffer.uninstall()?;
//!
//! unsafe { alloc::dealloc(buffer, layout) };
//! # Ok(())
//! # }
//! ```

pub use memsniff_core::*;

/// Protection backends.
pub mod backend {
    #[cfg(all(unix, feature = "backend-posix"))]
    pub use memsniff_backend_posix as posix;
    #[cfg(all(windows, feature = "backend-windows"))]
    pub use memsniff_backend_windows as windows;
}

/// The protection backend of the build target.
#[cfg(all(unix, feature = "backend-posix"))]
pub type DefaultBackend = memsniff_backend_posix::SniffPosixBackend;

/// The protection backend of the build target.
#[cfg(all(windows, feature = "backend-windows"))]
pub type DefaultBackend = memsniff_backend_windows::SniffWindowsBackend;

/// Creates an engine on the backend of the build target and installs its
/// fault hook.
#[cfg(any(
    all(unix, feature = "backend-posix"),
    all(windows, feature = "backend-windows")
))]
pub fn install_default() -> Result<std::sync::Arc<MemorySniffer<DefaultBackend>>, SniffError> {
    let sniffer = std::sync::Arc::new(MemorySniffer::new(DefaultBackend::new()?)?);
    sniffer.install()?;

    tracing::debug!(page_size = sniffer.page_size(), "default sniffer installed");
    Ok(sniffer)
}
