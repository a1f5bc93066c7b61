use super::address::Address;

/// Rounds `address` down to the start of its containing page.
///
/// `page_size` must be a power of two.
pub fn page_align_down(address: Address, page_size: usize) -> Address {
    debug_assert!(page_size.is_power_of_two());
    address & !(page_size - 1)
}

/// Rounds `address` up to the next page boundary.
///
/// Returns `None` if the result does not fit in the address space.
pub fn page_align_up(address: Address, page_size: usize) -> Option<Address> {
    debug_assert!(page_size.is_power_of_two());
    let value = address.0.checked_add(page_size - 1)?;
    Some(Address(value & !(page_size - 1)))
}

/// Checks if `address` lies on a page boundary.
pub fn is_page_aligned(address: Address, page_size: usize) -> bool {
    debug_assert!(page_size.is_power_of_two());
    address.0 & (page_size - 1) == 0
}

/// A page-aligned, half-open range of pages `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageRange {
    start: Address,
    end: Address,
    page_size: usize,
}

impl PageRange {
    /// Creates a range from page-aligned bounds.
    ///
    /// # Panics
    ///
    /// Panics (in debug builds) if the bounds are not page aligned or
    /// `end < start`.
    pub fn new(start: Address, end: Address, page_size: usize) -> Self {
        debug_assert!(is_page_aligned(start, page_size));
        debug_assert!(is_page_aligned(end, page_size));
        debug_assert!(start <= end);

        Self {
            start,
            end,
            page_size,
        }
    }

    /// Returns the single page containing `address`.
    pub fn page(address: Address, page_size: usize) -> Self {
        let start = page_align_down(address, page_size);
        Self::new(start, start + page_size, page_size)
    }

    /// Returns the smallest page-aligned super-range of `[address, address + size)`.
    ///
    /// Returns `None` if `size` is zero or the range wraps around the
    /// address space.
    pub fn covering(address: Address, size: usize, page_size: usize) -> Option<Self> {
        if size == 0 {
            return None;
        }

        let last = address.0.checked_add(size - 1)?;
        let start = page_align_down(address, page_size);
        let end = page_align_down(Address(last), page_size)
            .0
            .checked_add(page_size)?;

        Some(Self::new(start, Address(end), page_size))
    }

    /// Returns the first byte of the range.
    pub fn start(&self) -> Address {
        self.start
    }

    /// Returns one past the last byte of the range.
    pub fn end(&self) -> Address {
        self.end
    }

    /// Returns the page size the range was built with.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the length of the range in bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Checks if the range covers no pages.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns the number of pages in the range.
    pub fn page_count(&self) -> usize {
        self.len() / self.page_size
    }

    /// Returns the first page of the range.
    pub fn first_page(&self) -> Option<Address> {
        (!self.is_empty()).then_some(self.start)
    }

    /// Returns the last page of the range.
    pub fn last_page(&self) -> Option<Address> {
        (!self.is_empty()).then(|| self.end - self.page_size)
    }

    /// Checks if `address` lies within the range.
    pub fn contains(&self, address: Address) -> bool {
        self.start <= address && address < self.end
    }

    /// Checks if the two ranges share at least one page.
    pub fn overlaps(&self, other: &PageRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns the range without its first page.
    pub fn without_first(self) -> Self {
        if self.is_empty() {
            return self;
        }

        Self {
            start: self.start + self.page_size,
            ..self
        }
    }

    /// Returns the range without its last page.
    pub fn without_last(self) -> Self {
        if self.is_empty() {
            return self;
        }

        Self {
            end: self.end - self.page_size,
            ..self
        }
    }

    /// Returns the pages shared by both ranges.
    pub fn intersect(&self, other: &PageRange) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);

        (start < end).then(|| Self::new(start, end, self.page_size))
    }

    /// Iterates over the start address of every page in the range.
    pub fn pages(&self) -> impl Iterator<Item = Address> + use<> {
        let page_size = self.page_size;
        (self.start.0..self.end.0)
            .step_by(page_size)
            .map(Address)
    }
}

impl std::fmt::Display for PageRange {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
