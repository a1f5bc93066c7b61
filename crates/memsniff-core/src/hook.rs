//! Process-wide fault hook slot.
//!
//! The OS delivers protection faults to a single process-wide entry point
//! (a signal handler or a vectored exception handler). Those entry points
//! cannot carry state, so every backend owns one `static` [`FaultHook`] that
//! stores the dispatcher the faults are routed to.
//!
//! Only one dispatcher can be installed in a hook at a time. Uninstalling
//! waits until every handler that entered the hook has left it, so a fault
//! that is already being resolved never observes a dropped dispatcher.

use std::{
    ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, AtomicUsize, Ordering},
    },
};

use crate::{Fault, FaultDispatcher, FaultOutcome, SniffError};

/// Slot holding the dispatcher of the active fault hook.
pub struct FaultHook {
    dispatcher: AtomicPtr<Arc<dyn FaultDispatcher>>,
    in_flight: AtomicUsize,
}

impl FaultHook {
    #[expect(clippy::new_without_default)]
    /// Creates an empty hook.
    pub const fn new() -> Self {
        Self {
            dispatcher: AtomicPtr::new(ptr::null_mut()),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Stores the dispatcher faults are routed to.
    ///
    /// Fails with [`SniffError::AlreadyInstalled`] if a dispatcher is
    /// already present.
    pub fn install(&self, dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), SniffError> {
        let new = Box::into_raw(Box::new(dispatcher));

        match self.dispatcher.compare_exchange(
            ptr::null_mut(),
            new,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: `new` was never published.
                drop(unsafe { Box::from_raw(new) });
                Err(SniffError::AlreadyInstalled)
            }
        }
    }

    /// Removes the dispatcher and returns it.
    ///
    /// Blocks until no handler is executing inside the hook. Must not be
    /// called while holding anything an in-flight fault handler may wait
    /// for.
    pub fn uninstall(&self) -> Result<Arc<dyn FaultDispatcher>, SniffError> {
        let old = self.dispatcher.swap(ptr::null_mut(), Ordering::SeqCst);
        if old.is_null() {
            return Err(SniffError::NotInstalled);
        }

        while self.in_flight.load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }

        // SAFETY: `old` came from `Box::into_raw` in `install` and no
        // handler references it anymore.
        Ok(*unsafe { Box::from_raw(old) })
    }

    /// Checks if a dispatcher is installed.
    pub fn is_installed(&self) -> bool {
        !self.dispatcher.load(Ordering::SeqCst).is_null()
    }

    /// Marks the calling handler as executing inside the hook.
    ///
    /// The returned guard keeps [`uninstall`] from completing until it is
    /// dropped. Anything else the handler reads that [`uninstall`]'s
    /// caller tears down afterwards is therefore safe to use while the
    /// guard is alive.
    ///
    /// [`uninstall`]: Self::uninstall
    pub fn enter(&self) -> HookGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        HookGuard { hook: self }
    }
}

/// A handler executing inside a [`FaultHook`].
pub struct HookGuard<'a> {
    hook: &'a FaultHook,
}

impl HookGuard<'_> {
    /// Routes the fault to the installed dispatcher.
    ///
    /// Returns [`FaultOutcome::NotHandled`] if no dispatcher is installed.
    pub fn dispatch(&self, fault: Fault) -> FaultOutcome {
        let dispatcher = self.hook.dispatcher.load(Ordering::SeqCst);
        if dispatcher.is_null() {
            return FaultOutcome::NotHandled;
        }

        // SAFETY: The pointer is non-null and `uninstall` does not free it
        // while this guard is alive.
        unsafe { (*dispatcher).on_fault(fault) }
    }
}

impl Drop for HookGuard<'_> {
    fn drop(&mut self) {
        self.hook.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
