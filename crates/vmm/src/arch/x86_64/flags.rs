//! Page table entry flags for x86_64 architecture.

use ::x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags, exposing only the bits
/// the pager reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl From<usize> for PageFlags {
    fn from(value: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(value as u64))
    }
}

impl PageFlags {
    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Flags for a present user page.
    pub fn user_page(writable: bool) -> Self {
        let mut flags = PageTableFlags::PRESENT | PageTableFlags::USER_ACCESSIBLE;
        flags.set(PageTableFlags::WRITABLE, writable);
        Self(flags)
    }

    /// Returns the raw usize value of these flags.
    pub const fn as_usize(self) -> usize {
        self.0.bits() as usize
    }

    pub fn is_present(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    pub fn is_accessed(self) -> bool {
        self.0.contains(PageTableFlags::ACCESSED)
    }

    pub fn set_accessed(&mut self, accessed: bool) {
        self.0.set(PageTableFlags::ACCESSED, accessed);
    }

    pub fn is_dirty(self) -> bool {
        self.0.contains(PageTableFlags::DIRTY)
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.0.set(PageTableFlags::DIRTY, dirty);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
