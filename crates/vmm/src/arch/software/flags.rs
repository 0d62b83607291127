//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// Bit positions follow the 32-bit x86 PTE so that the emulated MMU and the
/// clock algorithm see the same accessed and dirty semantics as hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Present bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Writable bit (bit 1).
    const WRITABLE: usize = 1 << 1;

    /// User-accessible bit (bit 2).
    const USER: usize = 1 << 2;

    /// Accessed bit (bit 5), set by the MMU on any access.
    const ACCESSED: usize = 1 << 5;

    /// Dirty bit (bit 6), set by the MMU on writes.
    const DIRTY: usize = 1 << 6;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Flags for a present user page.
    pub const fn user_page(writable: bool) -> Self {
        let mut bits = Self::PRESENT | Self::USER;
        if writable {
            bits |= Self::WRITABLE;
        }
        Self(bits)
    }

    /// Returns the raw usize value of these flags.
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns whether the present bit is set.
    pub fn is_present(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Returns whether the accessed bit is set.
    pub fn is_accessed(self) -> bool {
        (self.0 & Self::ACCESSED) != 0
    }

    /// Sets or clears the accessed bit.
    pub fn set_accessed(&mut self, accessed: bool) {
        self.set(Self::ACCESSED, accessed);
    }

    /// Returns whether the dirty bit is set.
    pub fn is_dirty(self) -> bool {
        (self.0 & Self::DIRTY) != 0
    }

    /// Sets or clears the dirty bit.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.set(Self::DIRTY, dirty);
    }

    fn set(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

impl From<usize> for PageFlags {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
