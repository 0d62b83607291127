//! Hardware translations of one address space.
//!
//! A [`PageDirectory`] holds the leaf entries the MMU consults for a single
//! process: which frame backs each page, whether writes are allowed, and the
//! accessed and dirty bits the MMU sets on use. Only the pager installs or
//! removes entries; the MMU (or [`PageDirectory::record_access`] under
//! emulation) only sets bits.

use alloc::collections::BTreeMap;

use crate::{
    FrameNumber, PageNumber,
    arch::{PageEntry, PageFlags},
};

/// Leaf translations of one process, keyed by page.
#[derive(Default)]
pub struct PageDirectory {
    entries: BTreeMap<PageNumber, PageEntry>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a translation from `page` to `frame` with clear accessed and
    /// dirty bits.
    ///
    /// # Panics
    ///
    /// Panics if `page` already has a translation.
    pub fn map(&mut self, page: PageNumber, frame: FrameNumber, writable: bool) {
        let entry = PageEntry::new(frame.start(), PageFlags::user_page(writable));
        let previous = self.entries.insert(page, entry);
        assert!(previous.is_none(), "{page:?} is already mapped");
    }

    /// Removes the translation for `page`, returning the frame it pointed at.
    pub fn unmap(&mut self, page: PageNumber) -> Option<FrameNumber> {
        self.entries
            .remove(&page)
            .and_then(PageEntry::address)
            .map(|address| address.frame_number())
    }

    /// Returns the frame and flags for `page`, if it is mapped.
    pub fn translate(&self, page: PageNumber) -> Option<(FrameNumber, PageFlags)> {
        let entry = self.entries.get(&page)?;
        Some((entry.address()?.frame_number(), entry.flags()))
    }

    pub fn is_mapped(&self, page: PageNumber) -> bool {
        self.entries.contains_key(&page)
    }

    pub fn is_accessed(&self, page: PageNumber) -> bool {
        self.flags(page).is_some_and(PageFlags::is_accessed)
    }

    pub fn is_dirty(&self, page: PageNumber) -> bool {
        self.flags(page).is_some_and(PageFlags::is_dirty)
    }

    pub fn set_accessed(&mut self, page: PageNumber, accessed: bool) {
        self.update(page, |flags| flags.set_accessed(accessed));
    }

    pub fn set_dirty(&mut self, page: PageNumber, dirty: bool) {
        self.update(page, |flags| flags.set_dirty(dirty));
    }

    /// Reads and clears the accessed bit of `page`.
    ///
    /// Returns `false` for unmapped pages.
    pub fn test_and_clear_accessed(&mut self, page: PageNumber) -> bool {
        let accessed = self.is_accessed(page);
        if accessed {
            self.set_accessed(page, false);
        }
        accessed
    }

    /// Performs the bookkeeping the MMU does on a user access to `page`.
    ///
    /// Sets the accessed bit (and the dirty bit for writes) and returns the
    /// backing frame, or `None` when the access would fault: the page is not
    /// mapped, or `write` targets a read-only page.
    pub fn record_access(&mut self, page: PageNumber, write: bool) -> Option<FrameNumber> {
        let entry = self.entries.get_mut(&page)?;
        let mut flags = entry.flags();
        if write && !flags.is_writable() {
            return None;
        }
        flags.set_accessed(true);
        if write {
            flags.set_dirty(true);
        }
        entry.set_flags(flags);
        Some(entry.address()?.frame_number())
    }

    /// Number of installed translations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn flags(&self, page: PageNumber) -> Option<PageFlags> {
        self.entries.get(&page).map(|entry| entry.flags())
    }

    fn update(&mut self, page: PageNumber, f: impl FnOnce(&mut PageFlags)) {
        if let Some(entry) = self.entries.get_mut(&page) {
            let mut flags = entry.flags();
            f(&mut flags);
            entry.set_flags(flags);
        }
    }
}
