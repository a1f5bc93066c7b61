use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Page protection flags.
    ///
    /// The four combinations map onto the protection modes the engine
    /// applies to tracked pages:
    ///
    /// - [`MemoryAccess::R`]: read-only, writes trap.
    /// - [`MemoryAccess::W`]: write-only, reads trap.
    /// - [`MemoryAccess::RW`]: full access.
    /// - [`MemoryAccess::empty()`]: no access.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MemoryAccess: u8 {
        /// Read permission.
        const R = 0b00000001;

        /// Write permission.
        const W = 0b00000010;

        /// Combined Read and Write permissions.
        const RW = Self::R.bits() | Self::W.bits();
    }
}

impl MemoryAccess {
    /// No access at all.
    pub const NONE: Self = Self::empty();

    /// Returns `true` if a write to a page with this protection traps.
    pub fn traps_writes(self) -> bool {
        !self.contains(Self::W)
    }

    /// Returns `true` if a read from a page with this protection traps.
    pub fn traps_reads(self) -> bool {
        !self.contains(Self::R)
    }

    /// Returns `true` if any access to a page with this protection traps.
    pub fn traps(self) -> bool {
        self != Self::RW
    }
}

impl std::fmt::Display for MemoryAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut result = [b'-'; 2];

        if self.contains(MemoryAccess::R) {
            result[0] = b'r';
        }
        if self.contains(MemoryAccess::W) {
            result[1] = b'w';
        }

        // SAFETY: The `result` array is always valid UTF-8.
        f.write_str(unsafe { std::str::from_utf8_unchecked(&result) })
    }
}
