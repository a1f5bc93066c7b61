use crate::{MemoryAccess, PageRange};

/// An error that can occur when working with the memory sniffer.
#[derive(thiserror::Error, Debug)]
pub enum SniffError {
    /// An error occurred in the protection backend.
    #[error(transparent)]
    Backend(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The operating system rejected a page protection change.
    #[error("Failed to set protection {access} on {range}")]
    Protection {
        /// The page range that was being changed.
        range: PageRange,

        /// The requested protection.
        access: MemoryAccess,

        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The handle does not refer to a live region.
    #[error("Invalid or removed region handle")]
    InvalidHandle,

    /// An identical region is already tracked.
    #[error("Region already exists")]
    RegionExists,

    /// The region overlaps an already tracked region.
    #[error("Region overlaps an existing region")]
    RegionOverlap,

    /// The region is empty or wraps around the address space.
    #[error("Region is empty or out of bounds")]
    EmptyRegion,

    /// A fault hook is already installed in this process.
    #[error("Fault hook already installed")]
    AlreadyInstalled,

    /// No fault hook is installed.
    #[error("Fault hook not installed")]
    NotInstalled,

    /// The backend reported a page size that is not a power of two.
    #[error("Invalid page size {0:#x}")]
    InvalidPageSize(usize),

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

impl SniffError {
    /// Creates a new protection error.
    pub fn protection(range: PageRange, access: MemoryAccess, source: std::io::Error) -> Self {
        Self::Protection {
            range,
            access,
            source,
        }
    }

    /// Checks if the error is a rejected protection change.
    ///
    /// Callers typically react to this by falling back to capturing the
    /// whole region instead of only its touched pages.
    pub fn is_protection(&self) -> bool {
        matches!(self, Self::Protection { .. })
    }
}
