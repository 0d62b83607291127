//! File-backed regions of user address spaces.
//!
//! A [`Mapping`] ties a page-aligned range of one process's address space to a
//! byte range of a [`File`]. The first `file_length` bytes of the range come
//! from the file; the following `zero_length` bytes read as zero and are never
//! written back.
//!
//! Mappings created by `mmap` are writable and write dirty pages back to the
//! file. Executable segments are mapped with `static_data` set: their pages are
//! loaded from the file on first touch but evict to swap, so the file is never
//! modified.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use core::fmt;

use spin::Mutex;

use crate::{PAGE_SIZE, PageNumber, ProcessId, VirtualAddress, VmError};

/// Byte-addressed file contents, as provided by the filesystem.
pub trait File: Send {
    /// Current length of the file in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads up to `buf.len()` bytes at `offset`, returning how many were read.
    ///
    /// Reads stop at end of file.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;

    /// Writes up to `buf.len()` bytes at `offset`, returning how many were written.
    fn write_at(&mut self, offset: usize, buf: &[u8]) -> usize;
}

/// A file shared between the filesystem and the mappings of it.
///
/// The lock stands in for the filesystem lock. It is only taken while the
/// paging lock is held, never the other way around.
pub type SharedFile = Arc<Mutex<dyn File>>;

/// A fixed-size file held in memory.
///
/// Writes past the end of the file are truncated.
#[derive(Debug, Clone, Default)]
pub struct MemoryFile {
    data: Vec<u8>,
}

impl MemoryFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Wraps the file for sharing with mappings.
    pub fn shared(data: Vec<u8>) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new(data)))
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl File for MemoryFile {
    fn len(&self) -> usize {
        self.data.len()
    }

    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let Some(available) = self.data.get(offset..) else {
            return 0;
        };
        let count = available.len().min(buf.len());
        buf[..count].copy_from_slice(&available[..count]);
        count
    }

    fn write_at(&mut self, offset: usize, buf: &[u8]) -> usize {
        let Some(available) = self.data.get_mut(offset..) else {
            return 0;
        };
        let count = available.len().min(buf.len());
        available[..count].copy_from_slice(&buf[..count]);
        count
    }
}

/// Identifies a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MappingId(usize);

impl MappingId {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Describes a file region to map lazily into an address space.
#[derive(Clone)]
pub struct Segment {
    pub file: SharedFile,
    /// Page-aligned start of the region.
    pub address: VirtualAddress,
    /// Byte offset in the file of the region's first byte.
    pub offset: usize,
    /// Bytes of the region read from the file.
    pub file_length: usize,
    /// Bytes after `file_length` that read as zero.
    pub zero_length: usize,
    pub writable: bool,
    /// Evict to swap and never write back.
    pub static_data: bool,
}

impl Segment {
    /// A writable `mmap` region of `length` bytes over `file`.
    ///
    /// Bytes of the region beyond the end of the file read as zero.
    pub fn mmap(file: SharedFile, address: VirtualAddress, length: usize) -> Self {
        let file_length = length.min(file.lock().len());
        Self {
            file,
            address,
            offset: 0,
            file_length,
            zero_length: length - file_length,
            writable: true,
            static_data: false,
        }
    }

    /// Total length of the region in bytes, or `None` if it overflows.
    pub fn length(&self) -> Option<usize> {
        self.file_length.checked_add(self.zero_length)
    }
}

/// A file region installed into a process's address space.
pub struct Mapping {
    id: MappingId,
    owner: ProcessId,
    base: PageNumber,
    file: SharedFile,
    offset: usize,
    file_length: usize,
    zero_length: usize,
    writable: bool,
    static_data: bool,
}

impl Mapping {
    pub(crate) fn new(id: MappingId, owner: ProcessId, segment: Segment) -> Self {
        debug_assert!(segment.address.is_aligned(PAGE_SIZE));
        Self {
            id,
            owner,
            base: segment.address.page_number(),
            file: segment.file,
            offset: segment.offset,
            file_length: segment.file_length,
            zero_length: segment.zero_length,
            writable: segment.writable,
            static_data: segment.static_data,
        }
    }

    pub fn id(&self) -> MappingId {
        self.id
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// First page of the mapping.
    pub fn base(&self) -> PageNumber {
        self.base
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_static(&self) -> bool {
        self.static_data
    }

    pub fn page_count(&self) -> usize {
        (self.file_length + self.zero_length).div_ceil(PAGE_SIZE)
    }

    pub fn pages(&self) -> impl Iterator<Item = PageNumber> + use<> {
        let base = self.base;
        (0..self.page_count()).map(move |i| base + i)
    }

    pub fn contains(&self, page: PageNumber) -> bool {
        page >= self.base && page - self.base < self.page_count()
    }

    /// Whether an evicted `page` can be restored from the file.
    ///
    /// Static pages never can. Writable pages need file bytes to hold their
    /// contents; a writable page wholly past the end of the file does not.
    pub fn evicts_to_file(&self, page: PageNumber) -> bool {
        !self.static_data && (!self.writable || self.file_range(page).1 > 0)
    }

    /// Returns the file offset of `page` and how many of its bytes the file backs.
    fn file_range(&self, page: PageNumber) -> (usize, usize) {
        assert!(self.contains(page), "{page:?} is outside mapping {}", self.id);
        let start = (page - self.base) * PAGE_SIZE;
        let backed = self.file_length.saturating_sub(start).min(PAGE_SIZE);
        (self.offset + start, backed)
    }

    /// Fills `dest` with the contents of `page`, zeroing whatever the file
    /// does not provide.
    pub fn read_page(&self, page: PageNumber, dest: &mut [u8]) {
        let (offset, backed) = self.file_range(page);
        let read = if backed > 0 {
            self.file.lock().read_at(offset, &mut dest[..backed])
        } else {
            0
        };
        dest[read..].fill(0);
    }

    /// Writes the file-backed part of `page` from `src`.
    ///
    /// Does nothing for read-only or static mappings.
    pub fn write_page(&self, page: PageNumber, src: &[u8]) -> Result<(), VmError> {
        if !self.writable || self.static_data {
            return Ok(());
        }
        let (offset, backed) = self.file_range(page);
        if backed == 0 {
            return Ok(());
        }
        let written = self.file.lock().write_at(offset, &src[..backed]);
        if written < backed {
            return Err(VmError::ShortWrite);
        }
        Ok(())
    }
}

/// Every mapping of every process, keyed by id.
#[derive(Default)]
pub(crate) struct MappingTable {
    mappings: BTreeMap<MappingId, Mapping>,
    next_id: usize,
}

impl MappingTable {
    pub fn allocate_id(&mut self) -> MappingId {
        self.next_id += 1;
        MappingId(self.next_id)
    }

    pub fn insert(&mut self, mapping: Mapping) {
        let previous = self.mappings.insert(mapping.id, mapping);
        debug_assert!(previous.is_none());
    }

    pub fn get(&self, id: MappingId) -> Option<&Mapping> {
        self.mappings.get(&id)
    }

    pub fn remove(&mut self, id: MappingId) -> Option<Mapping> {
        self.mappings.remove(&id)
    }

    pub fn owned_by(&self, owner: ProcessId) -> Vec<MappingId> {
        self.mappings
            .values()
            .filter(|mapping| mapping.owner == owner)
            .map(|mapping| mapping.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }
}
