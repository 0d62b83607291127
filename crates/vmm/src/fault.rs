//! Page-fault resolution.
//!
//! A fault on a user page is resolved by obtaining a frame, filling it from
//! the page's backing store and installing the translation. Faults in the
//! stack region with no entry grow the stack, provided the access is no more
//! than the configured slack below the stack pointer.

use core::fmt;

use crate::{
    AllocFlags, Backing, BlockDevice, FrameNumber, MappingId, PageNumber, PageTableEntry,
    ProcessId, SwapSlot, VirtualAddress, VmError, arch, vm::VmState,
};

/// A page fault as delivered by the trap handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address.
    pub address: VirtualAddress,
    pub write: bool,
    /// User stack pointer at the time of the fault.
    pub stack_pointer: VirtualAddress,
}

impl PageFault {
    pub const fn new(address: VirtualAddress, write: bool, stack_pointer: VirtualAddress) -> Self {
        Self {
            address,
            write,
            stack_pointer,
        }
    }

    /// Builds a fault from the architecture's exception error code.
    pub fn from_error_code(
        address: VirtualAddress,
        error_code: u64,
        stack_pointer: VirtualAddress,
    ) -> Self {
        Self::new(address, arch::is_write_fault(error_code), stack_pointer)
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    NoSuchProcess,
    /// The address is not in user space.
    KernelAddress,
    /// A write to a read-only page.
    PermissionDenied,
    /// A stack-region access too far below the stack pointer.
    BeyondStack,
    /// Nothing backs the page.
    Unbacked,
    OutOfFrames,
    SwapFull,
    /// The backing store could not be read or written.
    Io,
}

impl fmt::Display for FaultError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoSuchProcess => "no address space",
            Self::KernelAddress => "kernel address",
            Self::PermissionDenied => "write to read-only page",
            Self::BeyondStack => "access below the stack pointer",
            Self::Unbacked => "no backing for page",
            Self::OutOfFrames => "out of frames",
            Self::SwapFull => "swap is full",
            Self::Io => "backing store i/o error",
        })
    }
}

impl core::error::Error for FaultError {}

impl From<VmError> for FaultError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfFrames => Self::OutOfFrames,
            VmError::SwapFull => Self::SwapFull,
            VmError::NoSuchProcess(_) => Self::NoSuchProcess,
            VmError::Fault(err) => err,
            _ => Self::Io,
        }
    }
}

/// Where the contents of a faulting page come from.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// A new stack page.
    Zero,
    Swap(SwapSlot),
    File(MappingId),
}

impl<D: BlockDevice> VmState<D> {
    /// Makes the page containing `fault.address` resident in `pid`'s address
    /// space, returning the frame that now backs it.
    ///
    /// # Panics
    ///
    /// Panics if the page is already resident and the access is allowed, since
    /// the MMU cannot have faulted on it.
    pub(crate) fn resolve_fault(
        &mut self,
        pid: ProcessId,
        fault: &PageFault,
    ) -> Result<FrameNumber, FaultError> {
        if !fault.address.is_user() {
            return Err(FaultError::KernelAddress);
        }
        let page = fault.address.page_number();
        let space = self.spaces.get(&pid).ok_or(FaultError::NoSuchProcess)?;
        let entry = space.entry(page).copied();

        if let Some(entry) = entry {
            if fault.write && !entry.is_writable() {
                return Err(FaultError::PermissionDenied);
            }
            assert!(
                !entry.is_resident(),
                "{page:?} of {pid} faulted while resident"
            );
        }

        let source = self.fault_source(fault, entry)?;
        log::trace!("fault: {} in {pid} from {source:?}", fault.address);

        let flags = match source {
            Source::Zero => AllocFlags::ZERO,
            Source::Swap(_) | Source::File(_) => AllocFlags::empty(),
        };
        let frame = self.acquire_frame(flags, pid, page)?;
        if let Err(err) = self.populate(frame, page, source) {
            self.frames.release(frame);
            return Err(err.into());
        }
        self.frames.mark_not_referenced(frame);

        let space = self
            .spaces
            .get_mut(&pid)
            .expect("address space vanished while resolving a fault");
        match source {
            Source::Zero => {
                let installed = space.install_frame(page, frame, true);
                debug_assert!(installed);
            }
            Source::Swap(_) | Source::File(_) => space.fault_in(page, frame),
        }
        Ok(frame)
    }

    fn fault_source(
        &self,
        fault: &PageFault,
        entry: Option<PageTableEntry>,
    ) -> Result<Source, FaultError> {
        let backing = entry.map(|entry| entry.backing());
        if self.config.in_stack_region(fault.address) {
            let lowest = fault.stack_pointer.saturating_sub(self.config.stack_slack);
            if fault.address < lowest {
                return Err(FaultError::BeyondStack);
            }
            return match backing {
                None => Ok(Source::Zero),
                Some(Backing::Swap(slot)) => Ok(Source::Swap(slot)),
                Some(_) => Err(FaultError::Unbacked),
            };
        }
        match backing {
            Some(Backing::Swap(slot)) => Ok(Source::Swap(slot)),
            Some(Backing::File(id)) => Ok(Source::File(id)),
            _ => Err(FaultError::Unbacked),
        }
    }

    fn populate(
        &mut self,
        frame: FrameNumber,
        page: PageNumber,
        source: Source,
    ) -> Result<(), VmError> {
        match source {
            Source::Zero => Ok(()),
            Source::Swap(slot) => self.swap.load(slot, self.frames.bytes_mut(frame)),
            Source::File(id) => {
                let mapping = self
                    .mappings
                    .get(id)
                    .expect("file-backed page refers to a missing mapping");
                mapping.read_page(page, self.frames.bytes_mut(frame));
                Ok(())
            }
        }
    }
}
