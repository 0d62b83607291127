//! Error types returned by the memory manager.

use core::fmt;

use crate::{MappingId, PageNumber, ProcessId, VirtualAddress, fault::FaultError};

/// Errors reported by a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector lies beyond the end of the device.
    OutOfRange { sector: u32 },
    /// The device reported a transfer failure.
    Device,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange { sector } => write!(f, "sector {sector} is out of range"),
            Self::Device => f.write_str("device transfer failed"),
        }
    }
}

impl core::error::Error for BlockError {}

/// Errors that can occur in memory manager operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame and nothing could be evicted.
    OutOfFrames,
    /// Every swap slot is in use.
    SwapFull,
    /// The swap device failed.
    Io(BlockError),
    /// A backing file accepted fewer bytes than a page write-back required.
    ShortWrite,
    /// The mapping address is zero.
    NullAddress,
    /// The mapping address is not page-aligned.
    Misaligned(VirtualAddress),
    /// The mapping has no extent, or does not fit in user space.
    InvalidLength,
    /// The file to map has length zero.
    EmptyFile,
    /// The page is already in use or crosses the stack boundary.
    Overlap(PageNumber),
    NoSuchProcess(ProcessId),
    ProcessExists(ProcessId),
    NoSuchMapping(MappingId),
    /// A user access could not be satisfied by the fault handler.
    Fault(FaultError),
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => f.write_str("out of physical frames"),
            Self::SwapFull => f.write_str("swap is full"),
            Self::Io(err) => write!(f, "swap i/o error: {err}"),
            Self::ShortWrite => f.write_str("short write to backing file"),
            Self::NullAddress => f.write_str("cannot map at address zero"),
            Self::Misaligned(addr) => write!(f, "address {addr} is not page-aligned"),
            Self::InvalidLength => f.write_str("invalid mapping length"),
            Self::EmptyFile => f.write_str("cannot map an empty file"),
            Self::Overlap(page) => write!(f, "page {page:?} is already in use"),
            Self::NoSuchProcess(pid) => write!(f, "no address space for {pid}"),
            Self::ProcessExists(pid) => write!(f, "{pid} already has an address space"),
            Self::NoSuchMapping(id) => write!(f, "no mapping {id}"),
            Self::Fault(err) => write!(f, "unresolved page fault: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Io(err)
    }
}

impl From<FaultError> for VmError {
    fn from(err: FaultError) -> Self {
        Self::Fault(err)
    }
}
