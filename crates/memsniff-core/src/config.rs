use serde::{Deserialize, Serialize};

/// How much of a region is unprotected when one of its pages faults.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnveilPolicy {
    /// Restore write access to the faulting page only.
    ///
    /// Every page of the region costs one fault, but the touched set stays
    /// exact.
    #[default]
    PerPage,

    /// Restore write access to the whole region on its first fault.
    ///
    /// Every page of the region is reported as touched from then on,
    /// since later writes are no longer observed. Suited to regions that
    /// are expected to be mostly rewritten between checkpoints.
    WholeRegion,
}
