//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single leaf page table entry for software emulation.
///
/// Bits 12-31 hold the frame address, bits 0-11 hold the flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    const ADDRESS_MASK: usize = 0xFFFF_F000;
    const FLAGS_MASK: usize = 0xFFF;

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & Self::FLAGS_MASK == 0,
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

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from(self.0 & Self::FLAGS_MASK)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        self.0 = (self.0 & Self::ADDRESS_MASK) | (flags.as_usize() & Self::FLAGS_MASK);
    }

    /// Returns whether this entry is present.
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }
}
