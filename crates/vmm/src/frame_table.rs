//! Ownership of user frames and clock (second-chance) eviction.
//!
//! Every frame taken from the [`FramePool`] is recorded together with the
//! process and page it backs. Frames become eviction candidates once they are
//! marked not-referenced, which appends them to a circular queue scanned by the
//! clock hand.
//!
//! The queue is threaded through the record arena by index: each queued record
//! stores the index of its neighbours, `head` is the oldest insertion and
//! `hand` is where the next scan starts. Insertion order and the hand are
//! independent; new frames are linked in just before `head`.

use alloc::{boxed::Box, vec::Vec};
use core::ops::BitOr;

use crate::{FrameNumber, FramePool, PageNumber, ProcessId, VmError};

/// Options for [`FrameTable::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocFlags(u8);

impl AllocFlags {
    /// Zero the frame before returning it.
    pub const ZERO: Self = Self(1 << 0);
    /// Panic instead of returning an error when no frame can be produced.
    pub const ASSERT: Self = Self(1 << 1);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The owners of resident pages, as seen from the frame table.
///
/// Eviction needs to read the hardware accessed bit of a page and to move a
/// victim's contents to its backing store; both live outside the frame table.
pub trait FrameOwners {
    /// Reads and clears the accessed bit of `owner`'s translation for `page`.
    fn test_and_clear_accessed(&mut self, owner: ProcessId, page: PageNumber) -> bool;

    /// Persists `contents` for `owner`'s `page` and removes its translation.
    ///
    /// On success the page table entry no longer refers to the frame.
    fn evict(&mut self, owner: ProcessId, page: PageNumber, contents: &[u8]) -> Result<(), VmError>;
}

#[derive(Clone, Copy)]
struct FrameRecord {
    owner: ProcessId,
    page: PageNumber,
    /// Not yet handed to the clock queue.
    referenced: bool,
    next: usize,
    prev: usize,
}

/// Tracks which (process, page) owns each allocated frame.
pub struct FrameTable {
    pool: FramePool,
    records: Box<[Option<FrameRecord>]>,
    head: Option<usize>,
    hand: Option<usize>,
    queued: usize,
    resident: usize,
    evictions: u64,
}

impl FrameTable {
    pub fn new(pool: FramePool) -> Self {
        let records = (0..pool.total_frames()).map(|_| None).collect::<Vec<_>>();
        log::info!("frame table: {} user frames", pool.total_frames());
        Self {
            pool,
            records: records.into_boxed_slice(),
            head: None,
            hand: None,
            queued: 0,
            resident: 0,
            evictions: 0,
        }
    }

    /// Obtains a frame for `owner`'s `page`.
    ///
    /// Takes a free frame from the pool if there is one, otherwise evicts the
    /// victim chosen by the clock. The returned frame is recorded as referenced
    /// and is not an eviction candidate until
    /// [`mark_not_referenced`](Self::mark_not_referenced) is called.
    ///
    /// # Panics
    ///
    /// Panics on failure if `flags` contains [`AllocFlags::ASSERT`].
    pub fn acquire(
        &mut self,
        flags: AllocFlags,
        owner: ProcessId,
        page: PageNumber,
        owners: &mut impl FrameOwners,
    ) -> Result<FrameNumber, VmError> {
        let frame = match self.pool.allocate() {
            Some(frame) => frame,
            None => match self.evict(owners) {
                Ok(frame) => frame,
                Err(err) if flags.contains(AllocFlags::ASSERT) => {
                    panic!("no frame available for {page:?} of {owner}: {err}")
                }
                Err(err) => return Err(err),
            },
        };

        if flags.contains(AllocFlags::ZERO) {
            self.pool.bytes_mut(frame).fill(0);
        }

        let index = self.pool.index_of(frame);
        debug_assert!(self.records[index].is_none());
        self.records[index] = Some(FrameRecord {
            owner,
            page,
            referenced: true,
            next: index,
            prev: index,
        });
        self.resident += 1;
        Ok(frame)
    }

    /// Makes `frame` an eviction candidate.
    ///
    /// The first call appends the frame to the clock queue; later calls do
    /// nothing. Returns `false` if the frame is not tracked.
    pub fn mark_not_referenced(&mut self, frame: FrameNumber) -> bool {
        if !self.pool.contains(frame) {
            return false;
        }
        let index = self.pool.index_of(frame);
        match &self.records[index] {
            None => false,
            Some(record) if !record.referenced => true,
            Some(_) => {
                self.push_back(index);
                true
            }
        }
    }

    /// Stops tracking `frame` and returns it to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the frame is not tracked.
    pub fn release(&mut self, frame: FrameNumber) {
        let index = self.pool.index_of(frame);
        let record = self.records[index]
            .as_ref()
            .unwrap_or_else(|| panic!("releasing untracked {frame:?}"));
        if !record.referenced {
            self.unlink(index);
        }
        self.records[index] = None;
        self.resident -= 1;
        self.pool.deallocate(frame);
    }

    /// Returns the owner and page backed by `frame`, if it is tracked.
    pub fn owner_of(&self, frame: FrameNumber) -> Option<(ProcessId, PageNumber)> {
        if !self.pool.contains(frame) {
            return None;
        }
        let record = self.records[self.pool.index_of(frame)].as_ref()?;
        Some((record.owner, record.page))
    }

    pub fn bytes(&self, frame: FrameNumber) -> &[u8] {
        self.pool.bytes(frame)
    }

    pub fn bytes_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        self.pool.bytes_mut(frame)
    }

    pub fn total_frames(&self) -> usize {
        self.pool.total_frames()
    }

    pub fn free_frames(&self) -> usize {
        self.pool.free_frames()
    }

    /// Frames currently owned by some page.
    pub fn resident_frames(&self) -> usize {
        self.resident
    }

    /// Frames in the clock queue.
    pub fn queued_frames(&self) -> usize {
        self.queued
    }

    pub fn evictions(&self) -> u64 {
        self.evictions
    }

    /// Frame the clock hand points at.
    pub fn hand(&self) -> Option<FrameNumber> {
        self.hand.map(|index| self.pool.frame_at(index))
    }

    fn record(&self, index: usize) -> &FrameRecord {
        self.records[index]
            .as_ref()
            .expect("clock queue links to an untracked frame")
    }

    fn record_mut(&mut self, index: usize) -> &mut FrameRecord {
        self.records[index]
            .as_mut()
            .expect("clock queue links to an untracked frame")
    }

    fn push_back(&mut self, index: usize) {
        match self.head {
            None => {
                let record = self.record_mut(index);
                record.next = index;
                record.prev = index;
                self.head = Some(index);
                self.hand = Some(index);
            }
            Some(head) => {
                let tail = self.record(head).prev;
                let record = self.record_mut(index);
                record.next = head;
                record.prev = tail;
                self.record_mut(tail).next = index;
                self.record_mut(head).prev = index;
            }
        }
        self.record_mut(index).referenced = false;
        self.queued += 1;
    }

    /// Removes `index` from the ring, moving the head and hand past it.
    fn unlink(&mut self, index: usize) {
        if self.queued == 1 {
            self.head = None;
            self.hand = None;
        } else {
            let FrameRecord { next, prev, .. } = *self.record(index);
            self.record_mut(prev).next = next;
            self.record_mut(next).prev = prev;
            if self.head == Some(index) {
                self.head = Some(next);
            }
            if self.hand == Some(index) {
                self.hand = Some(next);
            }
        }
        self.queued -= 1;
    }

    /// Runs the clock from the hand until it finds a page whose accessed bit
    /// is clear, clearing the bits it passes over.
    ///
    /// Terminates within one revolution plus one step, since every page the
    /// hand passes loses its accessed bit.
    fn select_victim(&mut self, owners: &mut impl FrameOwners) -> Option<usize> {
        let mut hand = self.hand?;
        loop {
            let FrameRecord {
                owner, page, next, ..
            } = *self.record(hand);
            if !owners.test_and_clear_accessed(owner, page) {
                self.hand = Some(hand);
                return Some(hand);
            }
            #[cfg(feature = "detailed-logging")]
            log::trace!("clock: second chance for {page:?} of {owner}");
            hand = next;
        }
    }

    /// Evicts the first victim the clock finds whose owner can persist it.
    ///
    /// A victim that cannot be written out stays resident and the hand moves
    /// past it. After one revolution every accessed bit is clear, so within
    /// two revolutions each candidate has been tried; the last error is
    /// returned if none could be evicted.
    fn evict(&mut self, owners: &mut impl FrameOwners) -> Result<FrameNumber, VmError> {
        let mut attempts = 2 * self.queued;
        let victim = loop {
            let victim = self.select_victim(owners).ok_or(VmError::OutOfFrames)?;
            let FrameRecord {
                owner, page, next, ..
            } = *self.record(victim);
            let frame = self.pool.frame_at(victim);
            match owners.evict(owner, page, self.pool.bytes(frame)) {
                Ok(()) => break victim,
                Err(err) => {
                    log::debug!("cannot evict {page:?} of {owner}: {err}");
                    self.hand = Some(next);
                    attempts -= 1;
                    if attempts == 0 {
                        return Err(err);
                    }
                }
            }
        };
        let frame = self.pool.frame_at(victim);
        let FrameRecord { owner, page, .. } = *self.record(victim);

        self.unlink(victim);
        self.records[victim] = None;
        self.resident -= 1;
        self.evictions += 1;
        log::debug!("evicted {frame:?} backing {page:?} of {owner}");
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::{BTreeMap, BTreeSet};

    const PID: ProcessId = ProcessId::new(1);

    /// Owners whose accessed bits are set explicitly by each test.
    #[derive(Default)]
    struct TestOwners {
        accessed: BTreeSet<PageNumber>,
        evicted: Vec<PageNumber>,
        saved: BTreeMap<PageNumber, u8>,
        /// Pages whose contents cannot be persisted.
        refuse: BTreeSet<PageNumber>,
    }

    impl FrameOwners for TestOwners {
        fn test_and_clear_accessed(&mut self, _owner: ProcessId, page: PageNumber) -> bool {
            self.accessed.remove(&page)
        }

        fn evict(&mut self, _owner: ProcessId, page: PageNumber, contents: &[u8]) -> Result<(), VmError> {
            if self.refuse.contains(&page) {
                return Err(VmError::SwapFull);
            }
            self.evicted.push(page);
            self.saved.insert(page, contents[0]);
            Ok(())
        }
    }

    fn setup(frames: usize) -> (FrameTable, TestOwners) {
        crate::console::init();
        (FrameTable::new(FramePool::emulated(frames)), TestOwners::default())
    }

    fn fill(table: &mut FrameTable, owners: &mut TestOwners, pages: &[usize]) -> Vec<FrameNumber> {
        pages
            .iter()
            .map(|&page| {
                let frame = table
                    .acquire(AllocFlags::ZERO, PID, PageNumber::new(page), owners)
                    .unwrap();
                table.bytes_mut(frame)[0] = page as u8;
                assert!(table.mark_not_referenced(frame));
                frame
            })
            .collect()
    }

    mod acquire {
        use super::*;

        #[test]
        fn zeroes_on_request() {
            let (mut table, mut owners) = setup(1);
            let frame = table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(1), &mut owners)
                .unwrap();
            table.bytes_mut(frame).fill(0xEE);
            table.release(frame);

            let frame = table
                .acquire(AllocFlags::ZERO, PID, PageNumber::new(2), &mut owners)
                .unwrap();
            assert!(table.bytes(frame).iter().all(|&byte| byte == 0));
        }

        #[test]
        fn records_owner() {
            let (mut table, mut owners) = setup(2);
            let frame = table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(9), &mut owners)
                .unwrap();
            assert_eq!(table.owner_of(frame), Some((PID, PageNumber::new(9))));
            assert_eq!(table.resident_frames(), 1);
            assert_eq!(table.free_frames(), 1);
        }

        #[test]
        fn out_of_frames_without_candidates() {
            let (mut table, mut owners) = setup(1);
            table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(1), &mut owners)
                .unwrap();
            assert_eq!(
                table.acquire(AllocFlags::empty(), PID, PageNumber::new(2), &mut owners),
                Err(VmError::OutOfFrames)
            );
        }

        #[test]
        #[should_panic(expected = "no frame available")]
        fn assert_flag_panics() {
            let (mut table, mut owners) = setup(1);
            table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(1), &mut owners)
                .unwrap();
            let _ = table.acquire(
                AllocFlags::ZERO | AllocFlags::ASSERT,
                PID,
                PageNumber::new(2),
                &mut owners,
            );
        }
    }

    mod mark {
        use super::*;

        #[test]
        fn idempotent() {
            let (mut table, mut owners) = setup(2);
            let frame = table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(1), &mut owners)
                .unwrap();
            assert!(table.mark_not_referenced(frame));
            assert!(table.mark_not_referenced(frame));
            assert_eq!(table.queued_frames(), 1);
            assert_eq!(table.hand(), Some(frame));
        }

        #[test]
        fn unknown_frame() {
            let (mut table, _) = setup(2);
            assert!(!table.mark_not_referenced(FrameNumber::new(0)));
            assert!(!table.mark_not_referenced(FrameNumber::new(50)));
        }
    }

    mod release {
        use super::*;

        #[test]
        fn advances_hand_past_released_frame() {
            let (mut table, mut owners) = setup(3);
            let frames = fill(&mut table, &mut owners, &[1, 2, 3]);
            assert_eq!(table.hand(), Some(frames[0]));

            table.release(frames[0]);
            assert_eq!(table.hand(), Some(frames[1]));
            assert_eq!(table.queued_frames(), 2);
            assert_eq!(table.free_frames(), 1);
        }

        #[test]
        fn last_release_clears_hand() {
            let (mut table, mut owners) = setup(1);
            let frames = fill(&mut table, &mut owners, &[1]);
            table.release(frames[0]);
            assert_eq!(table.hand(), None);
            assert_eq!(table.queued_frames(), 0);
        }

        #[test]
        fn release_of_unqueued_frame_keeps_ring() {
            let (mut table, mut owners) = setup(3);
            let frames = fill(&mut table, &mut owners, &[1, 2]);
            let pinned = table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(3), &mut owners)
                .unwrap();
            table.release(pinned);
            assert_eq!(table.queued_frames(), 2);
            assert_eq!(table.hand(), Some(frames[0]));
        }

        #[test]
        #[should_panic(expected = "releasing untracked")]
        fn untracked_frame_panics() {
            let (mut table, _) = setup(2);
            table.release(FrameNumber::new(1));
        }
    }

    mod clock {
        use super::*;

        #[test]
        fn evicts_in_insertion_order_when_unaccessed() {
            let (mut table, mut owners) = setup(3);
            fill(&mut table, &mut owners, &[1, 2, 3]);

            fill(&mut table, &mut owners, &[4, 5, 6]);
            assert_eq!(
                owners.evicted,
                [PageNumber::new(1), PageNumber::new(2), PageNumber::new(3)]
            );
            assert_eq!(table.evictions(), 3);
        }

        #[test]
        fn accessed_page_gets_second_chance() {
            let (mut table, mut owners) = setup(3);
            fill(&mut table, &mut owners, &[1, 2, 3]);
            owners.accessed.insert(PageNumber::new(1));

            fill(&mut table, &mut owners, &[4]);
            assert_eq!(owners.evicted, [PageNumber::new(2)]);
            assert!(owners.accessed.is_empty());
        }

        #[test]
        fn all_accessed_falls_back_to_hand() {
            let (mut table, mut owners) = setup(2);
            fill(&mut table, &mut owners, &[1, 2]);
            owners.accessed.extend([PageNumber::new(1), PageNumber::new(2)]);

            fill(&mut table, &mut owners, &[3]);
            assert_eq!(owners.evicted, [PageNumber::new(1)]);
        }

        #[test]
        fn victim_contents_are_handed_to_owner() {
            let (mut table, mut owners) = setup(1);
            fill(&mut table, &mut owners, &[7]);
            let frames = fill(&mut table, &mut owners, &[8]);
            assert_eq!(owners.saved.get(&PageNumber::new(7)), Some(&7));
            assert_eq!(table.owner_of(frames[0]), Some((PID, PageNumber::new(8))));
            assert_eq!(table.resident_frames(), 1);
        }

        #[test]
        fn failed_eviction_keeps_victim() {
            let (mut table, mut owners) = setup(1);
            let frames = fill(&mut table, &mut owners, &[1]);
            owners.refuse.insert(PageNumber::new(1));
            assert_eq!(
                table.acquire(AllocFlags::empty(), PID, PageNumber::new(2), &mut owners),
                Err(VmError::SwapFull)
            );
            assert_eq!(table.owner_of(frames[0]), Some((PID, PageNumber::new(1))));
            assert_eq!(table.queued_frames(), 1);
            assert_eq!(table.hand(), Some(frames[0]));
        }

        #[test]
        fn unpersistable_victim_is_skipped() {
            let (mut table, mut owners) = setup(3);
            let frames = fill(&mut table, &mut owners, &[1, 2, 3]);
            owners.refuse.insert(PageNumber::new(1));
            owners.accessed.insert(PageNumber::new(2));

            fill(&mut table, &mut owners, &[4]);
            assert_eq!(owners.evicted, [PageNumber::new(3)]);
            assert_eq!(table.owner_of(frames[0]), Some((PID, PageNumber::new(1))));
            assert_eq!(table.owner_of(frames[1]), Some((PID, PageNumber::new(2))));
        }

        #[test]
        fn accessed_page_is_tried_after_refusals() {
            let (mut table, mut owners) = setup(3);
            fill(&mut table, &mut owners, &[1, 2, 3]);
            owners.refuse.extend([PageNumber::new(1), PageNumber::new(2)]);
            owners.accessed.insert(PageNumber::new(3));

            fill(&mut table, &mut owners, &[4]);
            assert_eq!(owners.evicted, [PageNumber::new(3)]);
            assert_eq!(table.resident_frames(), 3);
        }

        #[test]
        fn fails_when_no_victim_can_be_persisted() {
            let (mut table, mut owners) = setup(2);
            let frames = fill(&mut table, &mut owners, &[1, 2]);
            owners.refuse.extend([PageNumber::new(1), PageNumber::new(2)]);

            assert_eq!(
                table.acquire(AllocFlags::empty(), PID, PageNumber::new(3), &mut owners),
                Err(VmError::SwapFull)
            );
            assert!(owners.evicted.is_empty());
            assert_eq!(table.queued_frames(), 2);
            assert_eq!(table.owner_of(frames[0]), Some((PID, PageNumber::new(1))));
            assert_eq!(table.owner_of(frames[1]), Some((PID, PageNumber::new(2))));
        }

        #[test]
        fn unqueued_frames_are_never_victims() {
            let (mut table, mut owners) = setup(2);
            let pinned = table
                .acquire(AllocFlags::empty(), PID, PageNumber::new(1), &mut owners)
                .unwrap();
            fill(&mut table, &mut owners, &[2]);

            fill(&mut table, &mut owners, &[3]);
            assert_eq!(owners.evicted, [PageNumber::new(2)]);
            assert_eq!(table.owner_of(pinned), Some((PID, PageNumber::new(1))));
        }
    }
}
