use super::macros::impl_ops;

impl_ops!(Address, usize, "process virtual address");

impl Address {
    /// Creates an address from a raw pointer.
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the address as a raw pointer.
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Returns the address as a mutable raw pointer.
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Checks if the address is NULL.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl<T> From<*const T> for Address {
    fn from(value: *const T) -> Self {
        Self::from_ptr(value)
    }
}

impl<T> From<*mut T> for Address {
    fn from(value: *mut T) -> Self {
        Self::from_ptr(value.cast_const())
    }
}
