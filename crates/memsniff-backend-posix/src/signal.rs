//! `sigaction`-based fault hook.
//!
//! Our handler is installed for `SIGSEGV` and for `SIGBUS`, which some
//! systems raise instead for protection violations on mapped files. The
//! dispositions it replaced are kept in a process-wide [`HandlerChain`], and
//! every fault the dispatcher does not recognize is forwarded along it, so
//! debuggers, sanitizers and language runtimes keep seeing their faults.

use std::{cell::UnsafeCell, io, mem, ptr, sync::Arc};

use libc::{c_int, c_void, siginfo_t};
use memsniff_core::{Address, Fault, FaultAccess, FaultDispatcher, FaultHook};
use parking_lot::{Mutex, const_mutex};

use crate::Error;

static HOOK: FaultHook = FaultHook::new();
static CHAIN: HandlerChain = HandlerChain::new();

/// Serializes `install` and `uninstall`.
static LOCK: Mutex<()> = const_mutex(());

type SigactionFn = extern "C" fn(c_int, *mut siginfo_t, *mut c_void);
type SignalFn = extern "C" fn(c_int);

/// A handled signal and the disposition our handler replaced.
struct ChainLink {
    signal: c_int,
    previous: UnsafeCell<libc::sigaction>,
}

impl ChainLink {
    const fn new(signal: c_int) -> Self {
        Self {
            signal,
            // SAFETY: An all-zero `sigaction` is `SIG_DFL` with no flags and
            // an empty mask.
            previous: UnsafeCell::new(unsafe { mem::zeroed() }),
        }
    }
}

/// The dispositions our handler replaced, one link per handled signal.
struct HandlerChain {
    links: [ChainLink; 2],
}

// SAFETY: `previous` is written by `install` under `LOCK`, and by the signal
// handler when it has to update the chain after forwarding a fault.
unsafe impl Sync for HandlerChain {}

impl HandlerChain {
    const fn new() -> Self {
        Self {
            links: [ChainLink::new(libc::SIGSEGV), ChainLink::new(libc::SIGBUS)],
        }
    }

    fn link(&self, signal: c_int) -> Option<&ChainLink> {
        self.links.iter().find(|link| link.signal == signal)
    }
}

/// Installs the signal handler, routing faults to `dispatcher`.
pub fn install(dispatcher: Arc<dyn FaultDispatcher>) -> Result<(), Error> {
    let _lock = LOCK.lock();

    HOOK.install(dispatcher).map_err(|_| Error::AlreadyInstalled)?;

    let action = handler_action();

    for (index, link) in CHAIN.links.iter().enumerate() {
        // SAFETY: `action` is fully initialized and `previous` is only read
        // by our handler, which is not armed for this signal yet.
        if unsafe { libc::sigaction(link.signal, &action, link.previous.get()) } != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(signal = link.signal, %err, "failed to install signal handler");

            for link in &CHAIN.links[..index] {
                // SAFETY: The link was captured above.
                let _ = unsafe { restore(link) };
            }

            let _ = HOOK.uninstall();
            return Err(Error::Signal(err));
        }

        tracing::debug!(
            signal = link.signal,
            chained = !is_default(link),
            "signal handler installed"
        );
    }

    Ok(())
}

/// Restores the dispositions our handler replaced and drops the dispatcher.
///
/// A signal whose disposition was changed by someone else after `install`
/// is left alone.
pub fn uninstall() -> Result<(), Error> {
    let _lock = LOCK.lock();

    if !HOOK.is_installed() {
        return Err(Error::NotInstalled);
    }

    let mut result = Ok(());

    for link in &CHAIN.links {
        // SAFETY: `install` captured every link.
        if let Err(err) = unsafe { restore(link) } {
            tracing::warn!(signal = link.signal, %err, "failed to restore signal handler");

            if result.is_ok() {
                result = Err(Error::Signal(err));
            }
        }
    }

    HOOK.uninstall().map_err(|_| Error::NotInstalled)?;

    result
}

/// Checks if the signal handler is installed.
pub fn is_installed() -> bool {
    HOOK.is_installed()
}

fn handler_address() -> libc::sighandler_t {
    on_signal as SigactionFn as libc::sighandler_t
}

fn handler_action() -> libc::sigaction {
    // SAFETY: An all-zero `sigaction` is valid.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_sigaction = handler_address();

    // Faults can nest: the dispatcher may touch another tracked page while
    // resolving one.
    action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_NODEFER;

    // SAFETY: `sa_mask` is a valid `sigset_t`.
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    action
}

fn is_default(link: &ChainLink) -> bool {
    // SAFETY: Only called under `LOCK`.
    let handler = unsafe { (*link.previous.get()).sa_sigaction };
    handler == libc::SIG_DFL
}

/// Puts the captured disposition back in place, if ours is still active.
unsafe fn restore(link: &ChainLink) -> io::Result<()> {
    // SAFETY: An all-zero `sigaction` is valid.
    let mut current: libc::sigaction = unsafe { mem::zeroed() };

    // SAFETY: Querying the disposition has no side effects.
    if unsafe { libc::sigaction(link.signal, ptr::null(), &mut current) } != 0 {
        return Err(io::Error::last_os_error());
    }

    if current.sa_sigaction != handler_address() {
        tracing::debug!(signal = link.signal, "signal handler was replaced, leaving it in place");
        return Ok(());
    }

    // SAFETY: `previous` holds what `sigaction` handed out in `install`.
    if unsafe { libc::sigaction(link.signal, link.previous.get(), ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

extern "C" fn on_signal(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
    let outcome = {
        let guard = HOOK.enter();

        // SAFETY: The kernel hands `SA_SIGINFO` handlers a valid `siginfo_t`
        // and `ucontext_t`.
        let fault = unsafe { Fault::new(fault_address(info), fault_access(signal, context)) };

        guard.dispatch(fault)
    };

    if outcome.is_handled() {
        return;
    }

    if let Some(link) = CHAIN.link(signal) {
        // SAFETY: We are inside the handler for `signal`.
        unsafe { forward(link, info, context) };
    }
}

/// Hands a fault we do not recognize to the disposition we replaced.
unsafe fn forward(link: &ChainLink, info: *mut siginfo_t, context: *mut c_void) {
    // SAFETY: See `HandlerChain`.
    let previous = unsafe { &mut *link.previous.get() };
    let handler = previous.sa_sigaction;

    if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
        // Returning re-executes the faulting instruction, which then
        // terminates the process the default way. An ignored protection
        // fault would refault forever.
        //
        // SAFETY: `signal` is async-signal-safe.
        unsafe { libc::signal(link.signal, libc::SIG_DFL) };
        return;
    }

    let flags = previous.sa_flags;

    // A one-shot handler only gets its first fault.
    if flags & libc::SA_RESETHAND != 0 {
        previous.sa_sigaction = libc::SIG_DFL;
        previous.sa_flags &= !(libc::SA_RESETHAND | libc::SA_SIGINFO);
    }

    if flags & libc::SA_SIGINFO != 0 {
        // SAFETY: `SA_SIGINFO` handlers have this signature.
        let delegate: SigactionFn = unsafe { mem::transmute(handler) };
        delegate(link.signal, info, context);
    } else {
        // SAFETY: Plain handlers have this signature.
        let delegate: SignalFn = unsafe { mem::transmute(handler) };
        delegate(link.signal);
    }

    // SAFETY: We are still inside the handler for `link.signal`.
    unsafe { recapture(link) };
}

/// Re-arms our handler if the delegate replaced it with one of its own.
///
/// The delegate's handler becomes the next link of the chain. A delegate
/// that reset the signal to `SIG_DFL` wants the refault to terminate the
/// process, so that is left as is.
unsafe fn recapture(link: &ChainLink) {
    // SAFETY: An all-zero `sigaction` is valid.
    let mut current: libc::sigaction = unsafe { mem::zeroed() };

    // SAFETY: `sigaction` is async-signal-safe.
    if unsafe { libc::sigaction(link.signal, ptr::null(), &mut current) } != 0 {
        return;
    }

    if current.sa_sigaction == handler_address() || current.sa_sigaction == libc::SIG_DFL {
        return;
    }

    let action = handler_action();

    // SAFETY: See `HandlerChain`; `sigaction` is async-signal-safe.
    unsafe {
        *link.previous.get() = current;
        libc::sigaction(link.signal, &action, ptr::null_mut());
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *const siginfo_t) -> Address {
    // SAFETY: `info` is valid for the duration of the handler.
    Address::from_ptr(unsafe { (*info).si_addr() })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *const siginfo_t) -> Address {
    // SAFETY: `info` is valid for the duration of the handler.
    Address::from_ptr(unsafe { (*info).si_addr })
}

/// Reads the access kind from the page-fault error code.
#[cfg(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu"))]
unsafe fn fault_access(signal: c_int, context: *const c_void) -> FaultAccess {
    const PF_WRITE: libc::greg_t = 1 << 1;

    if signal != libc::SIGSEGV || context.is_null() {
        return FaultAccess::Unknown;
    }

    // SAFETY: `context` points to the `ucontext_t` of the faulting thread.
    let error = unsafe {
        (*context.cast::<libc::ucontext_t>()).uc_mcontext.gregs[libc::REG_ERR as usize]
    };

    if error & PF_WRITE != 0 {
        FaultAccess::Write
    } else {
        FaultAccess::Read
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64", target_env = "gnu")))]
unsafe fn fault_access(_signal: c_int, _context: *const c_void) -> FaultAccess {
    FaultAccess::Unknown
}
