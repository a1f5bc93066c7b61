//! Vectored exception handler.
//!
//! The handler is registered first in the vectored handler list, so it sees
//! access violations before structured exception handlers and debuggers'
//! second-chance processing. Anything it does not recognize continues the
//! search down the list.

use std::{
    ffi::c_void,
    io, ptr,
    sync::{
        Arc,
        atomic::{AtomicPtr, Ordering},
    },
};

use memsniff_core::{Fault, FaultAccess, FaultDispatcher, FaultHook};
use parking_lot::{Mutex, const_mutex};
use windows_sys::Win32::{
    Foundation::EXCEPTION_ACCESS_VIOLATION,
    System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, EXCEPTION_POINTERS, RemoveVectoredExceptionHandler,
    },
};

use crate::Error;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

static HOOK: FaultHook = FaultHook::new();
static HANDLE: AtomicPtr<c_void> = AtomicPtr::new(ptr::null_mut());

/// Serializes `install` and `uninstall`.
static LOCK: Mutex<()> = const_mutex(());

/// Registers the exception handler, routing faults to `dispatcher`.
pub fn install(dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), Error> {
    let _lock = LOCK.lock();

    HOOK.install(dispatcher).map_err(|_| Error::AlreadyInstalled)?;

    // SAFETY: `on_exception` has the signature of a vectored handler.
    let handle = unsafe { AddVectoredExceptionHandler(1, Some(on_exception)) };
    if handle.is_null() {
        let err = io::Error::last_os_error();
        tracing::warn!(%err, "failed to add vectored exception handler");

        let _ = HOOK.uninstall();
        return Err(Error::VectoredHandler(err));
    }

    HANDLE.store(handle, Ordering::SeqCst);
    tracing::debug!("vectored exception handler installed");
    Ok(())
}

/// Unregisters the exception handler and drops the dispatcher.
pub fn uninstall() -> Result<(), Error> {
    let _lock = LOCK.lock();

    let handle = HANDLE.swap(ptr::null_mut(), Ordering::SeqCst);
    if handle.is_null() {
        return Err(Error::NotInstalled);
    }

    // SAFETY: `handle` was returned by `AddVectoredExceptionHandler`.
    let removed = unsafe { RemoveVectoredExceptionHandler(handle) } != 0;

    HOOK.uninstall().map_err(|_| Error::NotInstalled)?;

    if !removed {
        let err = io::Error::last_os_error();
        tracing::warn!(%err, "failed to remove vectored exception handler");
        return Err(Error::VectoredHandler(err));
    }

    Ok(())
}

/// Checks if the exception handler is registered.
pub fn is_installed() -> bool {
    HOOK.is_installed()
}

unsafe extern "system" fn on_exception(info: *mut EXCEPTION_POINTERS) -> i32 {
    // SAFETY: The OS passes valid exception pointers.
    let record = unsafe { (*info).ExceptionRecord };
    if record.is_null() {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // SAFETY: `record` is non-null and valid for the duration of the call.
    let record = unsafe { &*record };

    if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION || record.NumberParameters < 2 {
        return EXCEPTION_CONTINUE_SEARCH;
    }

    // 0: read, 1: write, 8: execute (DEP)
    let access = match record.ExceptionInformation[0] {
        0 => FaultAccess::Read,
        1 => FaultAccess::Write,
        _ => FaultAccess::Unknown,
    };

    let fault = Fault::new(record.ExceptionInformation[1], access);

    if HOOK.enter().dispatch(fault).is_handled() {
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}
