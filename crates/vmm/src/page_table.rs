//! Per-process supplemental page table.
//!
//! The supplemental table records, for every user page the process may touch,
//! where its contents currently live. It owns the process's
//! [`PageDirectory`] and keeps the two in step: a page has a hardware
//! translation exactly when its entry is backed by a frame.

use alloc::collections::{BTreeMap, btree_map};

use crate::{
    BlockDevice, FrameNumber, FrameTable, Mapping, MappingId, PageDirectory, PageNumber,
    ProcessId, SwapSlot, SwapTable,
};

/// Where the contents of a page live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Resident in a frame, with a hardware translation.
    Frame(FrameNumber),
    /// Evicted to a swap slot.
    Swap(SwapSlot),
    /// Not resident; the mapping's file provides the contents.
    File(MappingId),
}

/// One page of a process's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    backing: Backing,
    writable: bool,
    mapping: Option<MappingId>,
}

impl PageTableEntry {
    pub fn backing(&self) -> Backing {
        self.backing
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Mapping the page belongs to, if any.
    pub fn mapping(&self) -> Option<MappingId> {
        self.mapping
    }

    pub fn frame(&self) -> Option<FrameNumber> {
        match self.backing {
            Backing::Frame(frame) => Some(frame),
            _ => None,
        }
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.backing, Backing::Frame(_))
    }
}

/// Resources handed back by [`SupplementalPageTable::destroy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Released {
    pub frames: usize,
    pub swap_slots: usize,
}

/// The supplemental page table of one process.
pub struct SupplementalPageTable {
    owner: ProcessId,
    entries: BTreeMap<PageNumber, PageTableEntry>,
    directory: PageDirectory,
    /// Lowest page of the stack region.
    stack_bottom: PageNumber,
}

impl SupplementalPageTable {
    pub fn new(owner: ProcessId, stack_bottom: PageNumber) -> Self {
        Self {
            owner,
            entries: BTreeMap::new(),
            directory: PageDirectory::new(),
            stack_bottom,
        }
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn entry(&self, page: PageNumber) -> Option<&PageTableEntry> {
        self.entries.get(&page)
    }

    pub fn directory(&self) -> &PageDirectory {
        &self.directory
    }

    pub fn directory_mut(&mut self) -> &mut PageDirectory {
        &mut self.directory
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `page` lies below the stack region and has no entry.
    pub fn is_available(&self, page: PageNumber) -> bool {
        page < self.stack_bottom && !self.entries.contains_key(&page)
    }

    /// Records `page` as resident in `frame` and installs its translation.
    ///
    /// Returns `false` if `page` already has an entry.
    pub fn install_frame(&mut self, page: PageNumber, frame: FrameNumber, writable: bool) -> bool {
        if self.entries.contains_key(&page) {
            return false;
        }
        self.entries.insert(
            page,
            PageTableEntry {
                backing: Backing::Frame(frame),
                writable,
                mapping: None,
            },
        );
        self.directory.map(page, frame, writable);
        true
    }

    /// Records `page` as lazily backed by `mapping`.
    ///
    /// Returns `false` if the page is in use or inside the stack region.
    pub fn install_file(&mut self, mapping: &Mapping, page: PageNumber) -> bool {
        if !self.is_available(page) {
            return false;
        }
        self.entries.insert(
            page,
            PageTableEntry {
                backing: Backing::File(mapping.id()),
                writable: mapping.is_writable(),
                mapping: Some(mapping.id()),
            },
        );
        true
    }

    /// Makes a non-resident page resident in `frame`.
    ///
    /// # Panics
    ///
    /// Panics if `page` has no entry or is already resident.
    pub fn fault_in(&mut self, page: PageNumber, frame: FrameNumber) {
        let entry = self
            .entries
            .get_mut(&page)
            .unwrap_or_else(|| panic!("faulting in {page:?} without an entry"));
        assert!(!entry.is_resident(), "{page:?} is already resident");
        entry.backing = Backing::Frame(frame);
        self.directory.map(page, frame, entry.writable);
    }

    /// Removes a page of `mapping`, writing it back first if it is resident
    /// and dirty.
    ///
    /// Returns `false` if `page` has no entry or belongs to another mapping.
    pub fn uninstall_file<D: BlockDevice>(
        &mut self,
        mapping: &Mapping,
        page: PageNumber,
        frames: &mut FrameTable,
        swap: &mut SwapTable<D>,
    ) -> bool {
        let entry = match self.entries.entry(page) {
            btree_map::Entry::Occupied(entry) if entry.get().mapping == Some(mapping.id()) => {
                entry.remove()
            }
            _ => return false,
        };

        match entry.backing {
            Backing::File(_) => {}
            Backing::Frame(frame) => {
                let dirty = self.directory.is_dirty(page);
                self.directory.unmap(page);
                if dirty {
                    if let Err(err) = mapping.write_page(page, frames.bytes(frame)) {
                        log::warn!(
                            "write-back of {page:?} for mapping {} failed: {err}",
                            mapping.id()
                        );
                    }
                }
                frames.release(frame);
            }
            Backing::Swap(slot) => swap.release(slot),
        }
        true
    }

    /// Records that resident `page` now lives in its mapping's file and
    /// removes its translation.
    ///
    /// # Panics
    ///
    /// Panics if the page is not resident or has no mapping.
    pub fn evict_to_file(&mut self, page: PageNumber) -> FrameNumber {
        let (frame, entry) = self.resident_entry(page);
        let mapping = entry
            .mapping
            .unwrap_or_else(|| panic!("{page:?} has no mapping to evict to"));
        entry.backing = Backing::File(mapping);
        self.directory.unmap(page);
        frame
    }

    /// Records that resident `page` now lives in `slot` and removes its
    /// translation.
    ///
    /// # Panics
    ///
    /// Panics if the page is not resident.
    pub fn evict_to_swap(&mut self, page: PageNumber, slot: SwapSlot) -> FrameNumber {
        let (frame, entry) = self.resident_entry(page);
        entry.backing = Backing::Swap(slot);
        self.directory.unmap(page);
        frame
    }

    /// Drops every entry, releasing resident frames and swap slots.
    ///
    /// File contents are not written back; mappings must be torn down first.
    pub fn destroy<D: BlockDevice>(
        mut self,
        frames: &mut FrameTable,
        swap: &mut SwapTable<D>,
    ) -> Released {
        let mut released = Released::default();
        for (page, entry) in core::mem::take(&mut self.entries) {
            match entry.backing {
                Backing::Frame(frame) => {
                    self.directory.unmap(page);
                    frames.release(frame);
                    released.frames += 1;
                }
                Backing::Swap(slot) => {
                    swap.release(slot);
                    released.swap_slots += 1;
                }
                Backing::File(_) => {}
            }
        }
        debug_assert!(self.directory.is_empty());
        released
    }

    fn resident_entry(&mut self, page: PageNumber) -> (FrameNumber, &mut PageTableEntry) {
        let owner = self.owner;
        match self.entries.get_mut(&page) {
            Some(entry) => match entry.backing {
                Backing::Frame(frame) => (frame, entry),
                _ => panic!("{page:?} of {owner} is not resident"),
            },
            None => panic!("{page:?} of {owner} is not resident"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        AllocFlags, FramePool, MemoryDisk, MemoryFile, PAGE_SIZE, SECTORS_PER_SLOT, Segment,
        SharedFile, VirtualAddress, frame_table::FrameOwners,
    };
    use alloc::vec;

    const PID: ProcessId = ProcessId::new(3);
    const STACK_BOTTOM: PageNumber = PageNumber::new(0xBF800);
    const BASE: PageNumber = PageNumber::new(0x10000);

    /// Frame owner used where the pool is large enough never to evict.
    struct NoEviction;

    impl FrameOwners for NoEviction {
        fn test_and_clear_accessed(&mut self, _: ProcessId, _: PageNumber) -> bool {
            unreachable!()
        }

        fn evict(&mut self, _: ProcessId, _: PageNumber, _: &[u8]) -> Result<(), crate::VmError> {
            unreachable!()
        }
    }

    struct Fixture {
        table: SupplementalPageTable,
        frames: FrameTable,
        swap: SwapTable<MemoryDisk>,
        file: SharedFile,
        mapping: Mapping,
    }

    fn setup() -> Fixture {
        crate::console::init();
        let file: SharedFile = MemoryFile::shared(vec![0x5A; 2 * PAGE_SIZE]);
        let segment = Segment::mmap(file.clone(), BASE.start(), 2 * PAGE_SIZE);
        Fixture {
            table: SupplementalPageTable::new(PID, STACK_BOTTOM),
            frames: FrameTable::new(FramePool::emulated(4)),
            swap: SwapTable::new(MemoryDisk::new(4 * SECTORS_PER_SLOT as u32)),
            file,
            mapping: Mapping::new(MappingId::new(1), PID, segment),
        }
    }

    fn take_frame(fixture: &mut Fixture, page: PageNumber) -> FrameNumber {
        fixture
            .frames
            .acquire(AllocFlags::ZERO, PID, page, &mut NoEviction)
            .unwrap()
    }

    fn resident_mapping_page(fixture: &mut Fixture) -> FrameNumber {
        let frame = take_frame(fixture, BASE);
        assert!(fixture.table.install_file(&fixture.mapping, BASE));
        fixture.table.fault_in(BASE, frame);
        frame
    }

    mod install {
        use super::*;

        #[test]
        fn frame_installs_translation() {
            let mut fixture = setup();
            let page = PageNumber::new(0x20);
            let frame = take_frame(&mut fixture, page);
            assert!(fixture.table.install_frame(page, frame, false));

            let entry = fixture.table.entry(page).unwrap();
            assert_eq!(entry.backing(), Backing::Frame(frame));
            assert!(!entry.is_writable());
            let (mapped, flags) = fixture.table.directory().translate(page).unwrap();
            assert_eq!(mapped, frame);
            assert!(!flags.is_writable());
        }

        #[test]
        fn duplicate_frame_is_rejected() {
            let mut fixture = setup();
            let page = PageNumber::new(0x20);
            let first = take_frame(&mut fixture, page);
            let second = take_frame(&mut fixture, page);
            assert!(fixture.table.install_frame(page, first, true));
            assert!(!fixture.table.install_frame(page, second, true));
            assert_eq!(fixture.table.len(), 1);
        }

        #[test]
        fn file_page_has_no_translation() {
            let mut fixture = setup();
            assert!(fixture.table.install_file(&fixture.mapping, BASE));
            let entry = fixture.table.entry(BASE).unwrap();
            assert_eq!(entry.backing(), Backing::File(MappingId::new(1)));
            assert_eq!(entry.mapping(), Some(MappingId::new(1)));
            assert!(!fixture.table.directory().is_mapped(BASE));
        }

        #[test]
        fn file_page_in_stack_region_is_rejected() {
            let mut fixture = setup();
            assert!(!fixture.table.install_file(&fixture.mapping, STACK_BOTTOM));
            assert!(fixture.table.is_available(STACK_BOTTOM - 1));
        }

        #[test]
        fn file_page_over_existing_entry_is_rejected() {
            let mut fixture = setup();
            assert!(fixture.table.install_file(&fixture.mapping, BASE));
            assert!(!fixture.table.install_file(&fixture.mapping, BASE));
        }
    }

    mod evict {
        use super::*;

        #[test]
        fn to_swap_clears_translation() {
            let mut fixture = setup();
            let page = PageNumber::new(0x20);
            let frame = take_frame(&mut fixture, page);
            fixture.table.install_frame(page, frame, true);

            let slot = fixture.swap.allocate_slot(fixture.frames.bytes(frame)).unwrap();
            assert_eq!(fixture.table.evict_to_swap(page, slot), frame);
            assert_eq!(fixture.table.entry(page).unwrap().backing(), Backing::Swap(slot));
            assert!(!fixture.table.directory().is_mapped(page));
        }

        #[test]
        fn to_file_restores_file_backing() {
            let mut fixture = setup();
            let frame = resident_mapping_page(&mut fixture);
            assert_eq!(fixture.table.evict_to_file(BASE), frame);
            assert_eq!(
                fixture.table.entry(BASE).unwrap().backing(),
                Backing::File(MappingId::new(1))
            );
        }

        #[test]
        #[should_panic(expected = "is not resident")]
        fn non_resident_page_panics() {
            let mut fixture = setup();
            fixture.table.install_file(&fixture.mapping, BASE);
            fixture.table.evict_to_file(BASE);
        }
    }

    mod uninstall {
        use super::*;

        #[test]
        fn dirty_page_is_written_back() {
            let mut fixture = setup();
            let frame = resident_mapping_page(&mut fixture);
            fixture.frames.bytes_mut(frame).fill(0x77);
            fixture.table.directory_mut().set_dirty(BASE, true);

            assert!(fixture.table.uninstall_file(
                &fixture.mapping,
                BASE,
                &mut fixture.frames,
                &mut fixture.swap
            ));
            assert!(fixture.table.entry(BASE).is_none());
            assert_eq!(fixture.frames.resident_frames(), 0);

            let mut head = [0u8; 4];
            fixture.file.lock().read_at(0, &mut head);
            assert_eq!(head, [0x77; 4]);
        }

        #[test]
        fn clean_page_is_not_written_back() {
            let mut fixture = setup();
            let frame = resident_mapping_page(&mut fixture);
            fixture.frames.bytes_mut(frame).fill(0x77);

            fixture.table.uninstall_file(
                &fixture.mapping,
                BASE,
                &mut fixture.frames,
                &mut fixture.swap,
            );
            let mut head = [0u8; 4];
            fixture.file.lock().read_at(0, &mut head);
            assert_eq!(head, [0x5A; 4]);
        }

        #[test]
        fn page_without_entry_is_rejected() {
            let mut fixture = setup();
            assert!(!fixture.table.uninstall_file(
                &fixture.mapping,
                BASE,
                &mut fixture.frames,
                &mut fixture.swap
            ));
        }

        #[test]
        fn page_of_another_mapping_is_kept() {
            let mut fixture = setup();
            let page = PageNumber::new(0x20);
            let frame = take_frame(&mut fixture, page);
            fixture.table.install_frame(page, frame, true);
            assert!(!fixture.table.uninstall_file(
                &fixture.mapping,
                page,
                &mut fixture.frames,
                &mut fixture.swap
            ));
            assert!(fixture.table.entry(page).is_some());
        }

        #[test]
        fn swapped_static_page_releases_slot() {
            let mut fixture = setup();
            let segment = Segment {
                static_data: true,
                ..Segment::mmap(fixture.file.clone(), VirtualAddress::new(0x2000_0000), PAGE_SIZE)
            };
            let mapping = Mapping::new(MappingId::new(2), PID, segment);
            let page = mapping.base();
            let frame = take_frame(&mut fixture, page);
            fixture.table.install_file(&mapping, page);
            fixture.table.fault_in(page, frame);
            let slot = fixture.swap.allocate_slot(fixture.frames.bytes(frame)).unwrap();
            fixture.table.evict_to_swap(page, slot);
            fixture.frames.release(frame);

            assert!(fixture.table.uninstall_file(
                &mapping,
                page,
                &mut fixture.frames,
                &mut fixture.swap
            ));
            assert_eq!(fixture.swap.used(), 0);
        }
    }

    #[test]
    fn destroy_releases_everything() {
        let mut fixture = setup();
        let swapped = PageNumber::new(0x20);
        let frame = take_frame(&mut fixture, swapped);
        fixture.table.install_frame(swapped, frame, true);
        let slot = fixture.swap.allocate_slot(fixture.frames.bytes(frame)).unwrap();
        fixture.table.evict_to_swap(swapped, slot);
        fixture.frames.release(frame);

        let resident = PageNumber::new(0x21);
        let frame = take_frame(&mut fixture, resident);
        fixture.table.install_frame(resident, frame, true);
        fixture.table.install_file(&fixture.mapping, BASE);

        let Fixture {
            table,
            mut frames,
            mut swap,
            ..
        } = fixture;
        let released = table.destroy(&mut frames, &mut swap);
        assert_eq!(
            released,
            Released {
                frames: 1,
                swap_slots: 1
            }
        );
        assert_eq!(frames.free_frames(), frames.total_frames());
        assert_eq!(swap.used(), 0);
    }
}
