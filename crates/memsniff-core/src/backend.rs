use std::sync::Arc;

use crate::{FaultDispatcher, MemoryAccess, PageRange, SniffError};

/// A trait for implementing a protection backend.
///
/// A backend is the OS-specific half of the engine: it changes page
/// protection and owns the process-wide fault hook. Exactly one fault
/// hook can be active per process, whatever the number of backend
/// instances.
pub trait SniffBackend: Send + Sync {
    /// Returns the size of a page in bytes.
    fn page_size(&self) -> usize;

    /// Sets the protection of a page-aligned range.
    ///
    /// Failures are returned as [`SniffError::Protection`] and logged;
    /// they never panic.
    fn set_protection(&self, range: PageRange, access: MemoryAccess) -> Result<(), SniffError>;

    /// Installs the process-wide fault hook, routing faults to `dispatcher`.
    fn install(&self, dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), SniffError>;

    /// Uninstalls the process-wide fault hook.
    fn uninstall(&self) -> Result<(), SniffError>;

    /// Checks if the process-wide fault hook is installed.
    fn is_installed(&self) -> bool;
}
