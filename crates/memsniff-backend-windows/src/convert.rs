use memsniff_core::MemoryAccess;
use windows_sys::Win32::System::Memory::{
    PAGE_NOACCESS, PAGE_PROTECTION_FLAGS, PAGE_READONLY, PAGE_READWRITE,
};

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

/// `VirtualProtect` protection flags.
///
/// There is no write-only protection; [`MemoryAccess::W`] maps to
/// `PAGE_NOACCESS`, which traps writes as well as reads.
impl FromExt<MemoryAccess> for PAGE_PROTECTION_FLAGS {
    fn from_ext(value: MemoryAccess) -> Self {
        if value == MemoryAccess::RW {
            PAGE_READWRITE
        } else if value == MemoryAccess::R {
            PAGE_READONLY
        } else {
            PAGE_NOACCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_flags() {
        let flags: PAGE_PROTECTION_FLAGS = MemoryAccess::R.into_ext();
        assert_eq!(flags, PAGE_READONLY);

        let flags: PAGE_PROTECTION_FLAGS = MemoryAccess::RW.into_ext();
        assert_eq!(flags, PAGE_READWRITE);

        let flags: PAGE_PROTECTION_FLAGS = MemoryAccess::W.into_ext();
        assert_eq!(flags, PAGE_NOACCESS);

        let flags: PAGE_PROTECTION_FLAGS = MemoryAccess::NONE.into_ext();
        assert_eq!(flags, PAGE_NOACCESS);
    }
}
