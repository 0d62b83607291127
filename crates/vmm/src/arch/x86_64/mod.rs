//! x86_64 architecture-specific implementation.
//!
//! Provides address validation, leaf page table entry encodings and page-fault
//! error code decoding for x86_64 with 4-level paging.

mod entry;
mod flags;

pub use entry::PageEntry;
pub use flags::PageFlags;

use ::x86_64::structures::idt::PageFaultErrorCode;

/// Maximum number of bits in a physical address on x86_64.
/// This is typically 52 bits on modern CPUs, but we use 48 as a conservative default.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address on x86_64 with 4-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// Default page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// First address of the higher half. User space is the lower canonical half.
pub const PHYS_BASE: usize = 0x0000_8000_0000_0000;

/// Validates a physical address for x86_64.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    let max_addr = (1usize << MAX_PHYSICAL_BITS) - 1;
    addr <= max_addr
}

/// Validates a virtual address for x86_64.
///
/// Virtual addresses must be canonical (bits 47-63 must be sign-extended from bit 47).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let canonical = if (addr & (1 << 47)) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    };
    canonical == addr
}

/// Whether the page-fault error code describes a write access.
pub fn is_write_fault(error_code: u64) -> bool {
    PageFaultErrorCode::from_bits_truncate(error_code)
        .contains(PageFaultErrorCode::CAUSED_BY_WRITE)
}
