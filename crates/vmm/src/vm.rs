//! The paging state shared by every process.
//!
//! [`Vm`] owns the frame table, the swap table, one supplemental page table
//! per process and every mapping, all behind a single lock. Each public
//! operation holds the lock from start to finish, including any eviction it
//! triggers. File locks are only ever taken with the paging lock held.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::{
    AllocFlags, BlockDevice, FaultError, FrameNumber, FramePool, FrameTable, Mapping, MappingId,
    PAGE_SIZE, PageFault, PageNumber, PageTableEntry, ProcessId, Segment, SharedFile,
    SupplementalPageTable, SwapTable, VirtualAddress, VmConfig, VmError, arch,
    frame_table::FrameOwners, mmap::MappingTable,
};

/// Snapshot of resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub resident_frames: usize,
    /// Frames eligible for eviction.
    pub queued_frames: usize,
    pub swap_slots: usize,
    pub swap_slots_used: usize,
    pub evictions: u64,
    pub processes: usize,
    pub mappings: usize,
}

/// Resources released when a process exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Teardown {
    pub mappings: usize,
    pub frames: usize,
    pub swap_slots: usize,
}

pub(crate) struct VmState<D> {
    pub(crate) config: VmConfig,
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapTable<D>,
    pub(crate) spaces: BTreeMap<ProcessId, SupplementalPageTable>,
    pub(crate) mappings: MappingTable,
}

/// Everything eviction may touch besides the frame table itself.
struct Residents<'a, D> {
    spaces: &'a mut BTreeMap<ProcessId, SupplementalPageTable>,
    swap: &'a mut SwapTable<D>,
    mappings: &'a MappingTable,
}

impl<D: BlockDevice> FrameOwners for Residents<'_, D> {
    fn test_and_clear_accessed(&mut self, owner: ProcessId, page: PageNumber) -> bool {
        self.spaces
            .get_mut(&owner)
            .is_some_and(|space| space.directory_mut().test_and_clear_accessed(page))
    }

    fn evict(&mut self, owner: ProcessId, page: PageNumber, contents: &[u8]) -> Result<(), VmError> {
        let space = self
            .spaces
            .get_mut(&owner)
            .unwrap_or_else(|| panic!("frame owner {owner} has no address space"));
        let mapping = space
            .entry(page)
            .and_then(PageTableEntry::mapping)
            .and_then(|id| self.mappings.get(id));

        match mapping {
            Some(mapping) if mapping.evicts_to_file(page) => {
                if space.directory().is_dirty(page) {
                    mapping.write_page(page, contents)?;
                }
                space.evict_to_file(page);
            }
            _ => {
                let slot = self.swap.allocate_slot(contents)?;
                space.evict_to_swap(page, slot);
            }
        }
        Ok(())
    }
}

impl<D: BlockDevice> VmState<D> {
    pub(crate) fn acquire_frame(
        &mut self,
        flags: AllocFlags,
        pid: ProcessId,
        page: PageNumber,
    ) -> Result<FrameNumber, VmError> {
        let mut residents = Residents {
            spaces: &mut self.spaces,
            swap: &mut self.swap,
            mappings: &self.mappings,
        };
        self.frames.acquire(flags, pid, page, &mut residents)
    }

    fn insert_mapping(&mut self, pid: ProcessId, segment: Segment) -> Result<MappingId, VmError> {
        if segment.address.as_usize() == 0 {
            return Err(VmError::NullAddress);
        }
        if !segment.address.is_aligned(PAGE_SIZE) {
            return Err(VmError::Misaligned(segment.address));
        }
        let length = match segment.length() {
            Some(length) if length > 0 => length,
            _ => return Err(VmError::InvalidLength),
        };
        match segment.address.as_usize().checked_add(length) {
            Some(end) if end <= arch::PHYS_BASE => {}
            _ => return Err(VmError::InvalidLength),
        }

        let space = self.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess(pid))?;
        let base = segment.address.page_number();
        let pages = length.div_ceil(PAGE_SIZE);
        if let Some(page) = (0..pages).map(|i| base + i).find(|&page| !space.is_available(page)) {
            return Err(VmError::Overlap(page));
        }

        let mapping = Mapping::new(self.mappings.allocate_id(), pid, segment);
        for page in mapping.pages() {
            let installed = space.install_file(&mapping, page);
            debug_assert!(installed);
        }
        let id = mapping.id();
        log::debug!(
            "mapping {id}: {pages} pages at {} for {pid}",
            mapping.base().start()
        );
        self.mappings.insert(mapping);
        Ok(id)
    }

    /// Writes back and removes every page of mapping `id`.
    fn remove_mapping(&mut self, id: MappingId) -> Result<(), VmError> {
        let mapping = self.mappings.remove(id).ok_or(VmError::NoSuchMapping(id))?;
        let space = self
            .spaces
            .get_mut(&mapping.owner())
            .expect("mapping outlived its address space");
        let removed = mapping
            .pages()
            .filter(|&page| space.uninstall_file(&mapping, page, &mut self.frames, &mut self.swap))
            .count();
        log::debug!("mapping {id}: unmapped {removed} pages");
        Ok(())
    }

    /// Returns the frame behind `addr` after performing the MMU's access
    /// bookkeeping, faulting the page in first if needed.
    fn user_frame(
        &mut self,
        pid: ProcessId,
        addr: VirtualAddress,
        write: bool,
        stack_pointer: VirtualAddress,
    ) -> Result<FrameNumber, VmError> {
        let page = addr.page_number();
        let space = self.spaces.get_mut(&pid).ok_or(VmError::NoSuchProcess(pid))?;
        if let Some(frame) = space.directory_mut().record_access(page, write) {
            return Ok(frame);
        }

        self.resolve_fault(pid, &PageFault::new(addr, write, stack_pointer))?;
        self.spaces
            .get_mut(&pid)
            .and_then(|space| space.directory_mut().record_access(page, write))
            .ok_or(VmError::Fault(FaultError::PermissionDenied))
    }

    /// Calls `f` with each page-sized piece of the user range
    /// `[addr, addr + len)`, its frame and its offset within the range.
    fn for_each_user_chunk(
        &mut self,
        pid: ProcessId,
        addr: VirtualAddress,
        len: usize,
        write: bool,
        stack_pointer: VirtualAddress,
        mut f: impl FnMut(&mut [u8], usize),
    ) -> Result<(), VmError> {
        match addr.as_usize().checked_add(len) {
            Some(end) if end <= arch::PHYS_BASE => {}
            _ => return Err(VmError::Fault(FaultError::KernelAddress)),
        }
        let mut done = 0;
        while done < len {
            let current = addr + done;
            let start = current.page_offset();
            let chunk = (PAGE_SIZE - start).min(len - done);
            let frame = self.user_frame(pid, current, write, stack_pointer)?;
            f(&mut self.frames.bytes_mut(frame)[start..start + chunk], done);
            done += chunk;
        }
        Ok(())
    }

    fn stats(&self) -> VmStats {
        VmStats {
            total_frames: self.frames.total_frames(),
            free_frames: self.frames.free_frames(),
            resident_frames: self.frames.resident_frames(),
            queued_frames: self.frames.queued_frames(),
            swap_slots: self.swap.capacity(),
            swap_slots_used: self.swap.used(),
            evictions: self.frames.evictions(),
            processes: self.spaces.len(),
            mappings: self.mappings.len(),
        }
    }
}

/// Demand-paged virtual memory for every user process.
pub struct Vm<D> {
    state: Mutex<VmState<D>>,
}

impl<D: BlockDevice> Vm<D> {
    /// Creates the paging state over the user frames in `frames`, swapping to
    /// `swap_device`.
    ///
    /// # Panics
    ///
    /// Panics if `config` describes an invalid stack region.
    pub fn new(config: VmConfig, frames: FramePool, swap_device: D) -> Self {
        config.assert_valid();
        log::info!(
            "vm: stack region {}..{:#x}, slack {} bytes",
            config.stack_bottom(),
            arch::PHYS_BASE,
            config.stack_slack
        );
        Self {
            state: Mutex::new(VmState {
                config,
                frames: FrameTable::new(frames),
                swap: SwapTable::new(swap_device),
                spaces: BTreeMap::new(),
                mappings: MappingTable::default(),
            }),
        }
    }

    /// Creates an empty address space for `pid`.
    pub fn create_process(&self, pid: ProcessId) -> Result<(), VmError> {
        let mut state = self.state.lock();
        if state.spaces.contains_key(&pid) {
            return Err(VmError::ProcessExists(pid));
        }
        let stack_bottom = state.config.stack_bottom_page();
        state
            .spaces
            .insert(pid, SupplementalPageTable::new(pid, stack_bottom));
        log::debug!("created address space for {pid}");
        Ok(())
    }

    /// Tears down `pid`'s address space.
    ///
    /// Mappings are removed first so their dirty pages reach the file; then
    /// every remaining frame and swap slot is released.
    pub fn exit_process(&self, pid: ProcessId) -> Result<Teardown, VmError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.spaces.contains_key(&pid) {
            return Err(VmError::NoSuchProcess(pid));
        }

        let ids = state.mappings.owned_by(pid);
        for &id in &ids {
            state.remove_mapping(id)?;
        }

        let space = state
            .spaces
            .remove(&pid)
            .ok_or(VmError::NoSuchProcess(pid))?;
        let released = space.destroy(&mut state.frames, &mut state.swap);
        let teardown = Teardown {
            mappings: ids.len(),
            frames: released.frames,
            swap_slots: released.swap_slots,
        };
        log::debug!("tore down {pid}: {teardown:?}");
        Ok(teardown)
    }

    /// Resolves a page fault at `vaddr` in `pid`.
    ///
    /// Returns `false` if the access is invalid or cannot be satisfied, in
    /// which case the caller terminates the process.
    pub fn handle_page_fault(
        &self,
        pid: ProcessId,
        vaddr: VirtualAddress,
        is_write: bool,
        esp: VirtualAddress,
    ) -> bool {
        match self.resolve_fault(pid, &PageFault::new(vaddr, is_write, esp)) {
            Ok(_) => true,
            Err(err) => {
                log::debug!("unresolved fault at {vaddr} in {pid}: {err}");
                false
            }
        }
    }

    /// Resolves `fault`, returning the frame that now backs the faulting page.
    pub fn resolve_fault(&self, pid: ProcessId, fault: &PageFault) -> Result<FrameNumber, FaultError> {
        self.state.lock().resolve_fault(pid, fault)
    }

    /// Backs the page at `vaddr` with a zeroed frame immediately.
    ///
    /// Used for the initial stack page and for eagerly loaded segments.
    pub fn install_page(
        &self,
        pid: ProcessId,
        vaddr: VirtualAddress,
        writable: bool,
    ) -> Result<FrameNumber, VmError> {
        if !vaddr.is_user() {
            return Err(VmError::Fault(FaultError::KernelAddress));
        }
        let page = vaddr.page_number();
        let mut state = self.state.lock();
        let space = state.spaces.get(&pid).ok_or(VmError::NoSuchProcess(pid))?;
        if space.entry(page).is_some() {
            return Err(VmError::Overlap(page));
        }

        let frame = state.acquire_frame(AllocFlags::ZERO, pid, page)?;
        let space = state
            .spaces
            .get_mut(&pid)
            .expect("address space vanished while installing a page");
        let installed = space.install_frame(page, frame, writable);
        debug_assert!(installed);
        state.frames.mark_not_referenced(frame);
        Ok(frame)
    }

    /// Maps `length` bytes of `file` at `addr` in `pid`'s address space.
    ///
    /// Pages are loaded on first access. Bytes of the range past the end of
    /// the file read as zero.
    pub fn create_mapping(
        &self,
        pid: ProcessId,
        file: SharedFile,
        addr: VirtualAddress,
        length: usize,
    ) -> Result<MappingId, VmError> {
        let mut state = self.state.lock();
        if file.lock().is_empty() {
            return Err(VmError::EmptyFile);
        }
        state.insert_mapping(pid, Segment::mmap(file, addr, length))
    }

    /// Maps an executable segment lazily.
    pub fn map_segment(&self, pid: ProcessId, segment: Segment) -> Result<MappingId, VmError> {
        self.state.lock().insert_mapping(pid, segment)
    }

    /// Unmaps mapping `id` of `pid`, writing dirty pages back to the file.
    pub fn destroy_mapping(&self, pid: ProcessId, id: MappingId) -> Result<(), VmError> {
        let mut state = self.state.lock();
        match state.mappings.get(id) {
            Some(mapping) if mapping.owner() == pid => state.remove_mapping(id),
            _ => Err(VmError::NoSuchMapping(id)),
        }
    }

    /// Copies `data` into `pid`'s memory at `addr`, faulting pages in as needed.
    pub fn copy_to_user(
        &self,
        pid: ProcessId,
        addr: VirtualAddress,
        data: &[u8],
        esp: VirtualAddress,
    ) -> Result<(), VmError> {
        self.state
            .lock()
            .for_each_user_chunk(pid, addr, data.len(), true, esp, |dest, at| {
                dest.copy_from_slice(&data[at..at + dest.len()]);
            })
    }

    /// Copies `pid`'s memory at `addr` into `buf`, faulting pages in as needed.
    pub fn copy_from_user(
        &self,
        pid: ProcessId,
        addr: VirtualAddress,
        buf: &mut [u8],
        esp: VirtualAddress,
    ) -> Result<(), VmError> {
        let len = buf.len();
        self.state
            .lock()
            .for_each_user_chunk(pid, addr, len, false, esp, |src, at| {
                buf[at..at + src.len()].copy_from_slice(src);
            })
    }

    /// Returns the supplemental entry for the page containing `vaddr`.
    pub fn entry(&self, pid: ProcessId, vaddr: VirtualAddress) -> Option<PageTableEntry> {
        let state = self.state.lock();
        state.spaces.get(&pid)?.entry(vaddr.page_number()).copied()
    }

    pub fn stats(&self) -> VmStats {
        self.state.lock().stats()
    }
}
