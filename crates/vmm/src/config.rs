//! Tunables of the pager.

use crate::{PAGE_SIZE, PageNumber, VirtualAddress, arch};

/// Largest size the user stack may grow to, measured down from `PHYS_BASE`.
pub const STACK_LIMIT: usize = 8 * 1024 * 1024;

/// How far below the stack pointer an access may land and still count as
/// stack growth. Covers `PUSHA`, which writes 32 bytes below `esp` before
/// adjusting it.
pub const STACK_SLACK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Size of the stack region in bytes. Must be a non-zero multiple of the
    /// page size below `PHYS_BASE`.
    pub stack_limit: usize,
    /// Bytes below the stack pointer treated as valid stack accesses.
    pub stack_slack: usize,
}

impl VmConfig {
    pub const DEFAULT: Self = Self {
        stack_limit: STACK_LIMIT,
        stack_slack: STACK_SLACK,
    };

    /// Lowest address of the stack region.
    pub const fn stack_bottom(&self) -> VirtualAddress {
        VirtualAddress::new(arch::PHYS_BASE - self.stack_limit)
    }

    pub fn stack_bottom_page(&self) -> PageNumber {
        self.stack_bottom().page_number()
    }

    /// Whether `addr` lies in the stack region.
    pub fn in_stack_region(&self, addr: VirtualAddress) -> bool {
        addr >= self.stack_bottom() && addr.is_user()
    }

    /// # Panics
    ///
    /// Panics if the stack region is empty, unaligned or larger than user space.
    pub(crate) fn assert_valid(&self) {
        assert!(
            self.stack_limit > 0 && self.stack_limit % PAGE_SIZE == 0,
            "stack limit must be a non-zero multiple of the page size"
        );
        assert!(
            self.stack_limit < arch::PHYS_BASE,
            "stack limit exceeds user space"
        );
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
