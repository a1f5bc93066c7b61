use memsniff_core::{MemoryAccess, PageRange, SniffError};

/// Error type for the POSIX backend.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred.
    Io(std::io::Error),

    /// `mprotect` failed.
    Protection {
        /// The range whose protection was being changed.
        range: PageRange,

        /// The requested access.
        access: MemoryAccess,

        /// The OS error.
        source: std::io::Error,
    },

    /// `sigaction` failed.
    Signal(std::io::Error),

    /// The fault hook is already installed.
    AlreadyInstalled,

    /// The fault hook is not installed.
    NotInstalled,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<Error> for SniffError {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(value) => Self::Io(value),
            Error::Protection {
                range,
                access,
                source,
            } => Self::protection(range, access, source),
            Error::Signal(value) => Self::Backend(Box::new(value)),
            Error::AlreadyInstalled => Self::AlreadyInstalled,
            Error::NotInstalled => Self::NotInstalled,
        }
    }
}
