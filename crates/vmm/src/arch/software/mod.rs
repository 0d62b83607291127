//! Software emulation of the paging architecture for testing.
//!
//! The emulated machine is a scale model of 32-bit x86 paging as seen by a
//! teaching kernel:
//! - 32-bit physical and virtual addresses
//! - 4 KiB pages
//! - user space below `PHYS_BASE` (3 GiB), kernel space above it
//! - accessed and dirty bits in the same positions as the hardware PTE
//!
//! Page tables themselves are not modeled; [`crate::PageDirectory`] keeps the
//! leaf entries of each process in a sparse map.

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

/// Maximum number of bits in an emulated physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in an emulated virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// First kernel virtual address. Everything below belongs to user space.
pub const PHYS_BASE: usize = 0xC000_0000;

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Validates a virtual address for software emulation.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr <= 0xFFFF_FFFF
}

/// Whether the page-fault error code describes a write access (bit 1).
pub const fn is_write_fault(error_code: u64) -> bool {
    error_code & 0b010 != 0
}
