use libc::c_int;
use memsniff_core::MemoryAccess;

/// Crate-local trait for conversion between types.
pub trait FromExt<T>: Sized {
    fn from_ext(value: T) -> Self;
}

/// Crate-local trait for conversion between types.
pub trait IntoExt<T>: Sized {
    fn into_ext(self) -> T;
}

impl<T, U> IntoExt<U> for T
where
    U: FromExt<T>,
{
    fn into_ext(self) -> U {
        U::from_ext(self)
    }
}

/// `mprotect` protection flags.
impl FromExt<MemoryAccess> for c_int {
    fn from_ext(value: MemoryAccess) -> Self {
        let mut result = libc::PROT_NONE;

        if value.contains(MemoryAccess::R) {
            result |= libc::PROT_READ;
        }

        if value.contains(MemoryAccess::W) {
            result |= libc::PROT_WRITE;
        }

        result
    }
}
