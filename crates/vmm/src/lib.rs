#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! Demand paging for user processes of a teaching kernel:
//!
//! - A frame table that tracks which process page owns each user frame and
//!   evicts with a clock (second-chance) policy when frames run out.
//! - A per-process supplemental page table recording whether each page is
//!   resident, swapped out, or backed by a mapped file.
//! - A swap table that stores evicted anonymous pages in page-sized slots of
//!   a block device.
//! - A page-fault handler that loads pages lazily and grows the user stack.
//! - Memory-mapped files and lazily loaded executable segments.
//!
//! All paging state lives behind the single lock owned by [`Vm`].
//!
//! Software emulation (the `software-emulation` feature, and all tests) runs
//! the pager on the host against the 32-bit scale-model architecture with
//! frames in host memory.

extern crate alloc;

mod address;
mod arch;
mod block;
mod config;
#[cfg(any(test, feature = "software-emulation"))]
pub mod console;
mod error;
mod fault;
mod frame_pool;
mod frame_table;
mod mmap;
mod numbers;
mod page_directory;
mod page_table;
mod swap;
mod vm;

pub use address::{PhysicalAddress, VirtualAddress};
pub use arch::{PAGE_SIZE, PHYS_BASE, PageFlags};
pub use block::{BlockDevice, MemoryDisk, SECTOR_SIZE, Sector};
pub use config::{STACK_LIMIT, STACK_SLACK, VmConfig};
pub use error::{BlockError, VmError};
pub use fault::{FaultError, PageFault};
pub use frame_pool::FramePool;
pub use frame_table::{AllocFlags, FrameOwners, FrameTable};
pub use mmap::{File, Mapping, MappingId, MemoryFile, Segment, SharedFile};
pub use numbers::{FrameNumber, PageNumber, ProcessId};
pub use page_directory::PageDirectory;
pub use page_table::{Backing, PageTableEntry, Released, SupplementalPageTable};
pub use swap::{SECTORS_PER_SLOT, SwapAllocator, SwapSlot, SwapTable};
pub use vm::{Teardown, Vm, VmStats};
