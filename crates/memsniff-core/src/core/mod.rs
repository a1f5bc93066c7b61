mod address;
pub(crate) mod macros;
mod memory_access;
mod page;

pub use self::{
    address::Address,
    memory_access::MemoryAccess,
    page::{PageRange, is_page_aligned, page_align_down, page_align_up},
};
