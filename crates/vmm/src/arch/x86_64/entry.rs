//! Page table entry for x86_64 architecture.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single leaf page table entry for x86_64.
///
/// Bits 12-51 hold the frame address; the remaining bits (including NX in
/// bit 63) are flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = 0x000F_FFFF_FFFF_F000;
    const FLAGS_MASK: usize = !Self::ADDRESS_MASK;

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned (lowest 12 bits must be zero).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );
        Self((address.as_usize() & Self::ADDRESS_MASK) | (flags.as_usize() & Self::FLAGS_MASK))
    }

    /// Returns the physical address stored in this entry, if present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            Some(PhysicalAddress::new(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.as_usize() & Self::FLAGS_MASK);
    }

    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }
}
