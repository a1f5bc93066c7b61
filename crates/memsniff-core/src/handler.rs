use crate::Address;

/// The kind of access that raised a protection fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultAccess {
    /// The faulting instruction was reading.
    Read,

    /// The faulting instruction was writing.
    Write,

    /// The OS did not report the access kind.
    ///
    /// POSIX signal delivery does not portably carry this information.
    Unknown,
}

/// A protection fault delivered by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fault {
    /// The address the faulting instruction accessed.
    pub address: Address,

    /// The kind of access.
    pub access: FaultAccess,
}

impl Fault {
    /// Creates a new fault.
    pub fn new(address: impl Into<Address>, access: FaultAccess) -> Self {
        Self {
            address: address.into(),
            access,
        }
    }
}

/// The result of dispatching a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOutcome {
    /// The fault was caused by a tracked page; the faulting instruction
    /// can be retried.
    Handled,

    /// The address is not tracked; the fault must keep propagating.
    NotHandled,
}

impl FaultOutcome {
    /// Checks if the fault was handled.
    pub fn is_handled(self) -> bool {
        matches!(self, Self::Handled)
    }
}

/// A trait for resolving protection faults.
///
/// Backends call [`on_fault`] from inside the OS fault delivery path
/// (a signal handler or a vectored exception handler). Implementations
/// must not unwind and must not block on anything a faulting thread
/// may itself hold.
///
/// [`on_fault`]: Self::on_fault
pub trait FaultDispatcher: Send + Sync {
    /// Resolves a fault.
    fn on_fault(&self, fault: Fault) -> FaultOutcome;
}

impl<F> FaultDispatcher for F
where
    F: Fn(Fault) -> FaultOutcome + Send + Sync,
{
    fn on_fault(&self, fault: Fault) -> FaultOutcome {
        self(fault)
    }
}
