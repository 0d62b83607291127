//! Swap slots and the swap table.
//!
//! The swap device is divided into page-sized slots with no on-disk metadata.
//! Slot `i` occupies sectors `[i * k, i * k + k)` where `k` is
//! [`SECTORS_PER_SLOT`]. Slots are handed out LIFO: the most recently released
//! slot is reused first, otherwise the allocation tail advances.

use alloc::{boxed::Box, vec, vec::Vec};
use core::fmt;

use crate::{BlockDevice, PAGE_SIZE, SECTOR_SIZE, Sector, VmError};

/// Number of device sectors that hold one page.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

/// Index of a page-sized slot on the swap device.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// First device sector of this slot.
    pub const fn first_sector(self) -> Sector {
        (self.0 * SECTORS_PER_SLOT) as Sector
    }
}

impl fmt::Debug for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwapSlot({})", self.0)
    }
}

/// Allocation state of the swap slots.
pub struct SwapAllocator {
    /// Slots below `tail` have been handed out at least once.
    tail: usize,
    /// Released slots, most recent last.
    free: Vec<SwapSlot>,
    live: Box<[bool]>,
    used: usize,
}

impl SwapAllocator {
    /// Creates an allocator for `capacity` slots, all free.
    pub fn new(capacity: usize) -> Self {
        Self {
            tail: 0,
            free: Vec::new(),
            live: vec![false; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    /// Reserves a slot, or returns `None` when every slot is in use.
    pub fn allocate(&mut self) -> Option<SwapSlot> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None if self.tail < self.capacity() => {
                self.tail += 1;
                SwapSlot(self.tail - 1)
            }
            None => return None,
        };
        debug_assert!(!self.live[slot.0]);
        self.live[slot.0] = true;
        self.used += 1;
        Some(slot)
    }

    /// Returns a slot to the free set.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently allocated.
    pub fn release(&mut self, slot: SwapSlot) {
        assert!(
            self.is_allocated(slot),
            "releasing swap slot {} that is not allocated",
            slot.0
        );
        self.live[slot.0] = false;
        self.used -= 1;
        self.free.push(slot);
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.live.get(slot.0).copied().unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.live.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }
}

/// The swap device together with its slot allocator.
pub struct SwapTable<D> {
    device: D,
    slots: SwapAllocator,
}

impl<D: BlockDevice> SwapTable<D> {
    /// Takes ownership of `device`, sizing the slot map from its sector count.
    ///
    /// Trailing sectors that cannot hold a whole page are left unused.
    pub fn new(device: D) -> Self {
        let capacity = device.sector_count() as usize / SECTORS_PER_SLOT;
        log::info!(
            "swap: {} sectors, {} slots of {} bytes",
            device.sector_count(),
            capacity,
            PAGE_SIZE
        );
        Self {
            device,
            slots: SwapAllocator::new(capacity),
        }
    }

    /// Reserves a slot and writes `contents` (one page) into it.
    ///
    /// The slot is released again if the device write fails.
    pub fn allocate_slot(&mut self, contents: &[u8]) -> Result<SwapSlot, VmError> {
        assert_eq!(contents.len(), PAGE_SIZE, "swap writes whole pages");
        let slot = self.slots.allocate().ok_or(VmError::SwapFull)?;
        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(contents.chunks_exact(SECTOR_SIZE)) {
            if let Err(err) = self.device.write(sector, chunk) {
                self.slots.release(slot);
                return Err(VmError::Io(err));
            }
        }
        log::trace!("swap: wrote {slot:?}");
        Ok(slot)
    }

    /// Reads `slot` into `dest` (one page) and frees the slot.
    ///
    /// On a device error the slot stays allocated and keeps its contents.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not allocated.
    pub fn load(&mut self, slot: SwapSlot, dest: &mut [u8]) -> Result<(), VmError> {
        assert_eq!(dest.len(), PAGE_SIZE, "swap reads whole pages");
        assert!(
            self.slots.is_allocated(slot),
            "loading swap slot {} that is not allocated",
            slot.0
        );
        let first = slot.first_sector();
        for (sector, chunk) in (first..).zip(dest.chunks_exact_mut(SECTOR_SIZE)) {
            self.device.read(sector, chunk)?;
        }
        self.slots.release(slot);
        log::trace!("swap: read {slot:?}");
        Ok(())
    }

    /// Frees `slot` without reading it.
    pub fn release(&mut self, slot: SwapSlot) {
        self.slots.release(slot);
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn used(&self) -> usize {
        self.slots.used()
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.slots.is_allocated(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockError, MemoryDisk};

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; PAGE_SIZE]
    }

    mod allocator {
        use super::*;

        #[test]
        fn tail_grows_then_exhausts() {
            let mut slots = SwapAllocator::new(3);
            assert_eq!(slots.allocate(), Some(SwapSlot(0)));
            assert_eq!(slots.allocate(), Some(SwapSlot(1)));
            assert_eq!(slots.allocate(), Some(SwapSlot(2)));
            assert_eq!(slots.allocate(), None);
            assert_eq!(slots.used(), 3);
        }

        #[test]
        fn released_slot_is_reused_first() {
            let mut slots = SwapAllocator::new(8);
            let a = slots.allocate().unwrap();
            let b = slots.allocate().unwrap();
            let _c = slots.allocate().unwrap();

            slots.release(a);
            slots.release(b);
            assert_eq!(slots.allocate(), Some(b));
            assert_eq!(slots.allocate(), Some(a));
            assert_eq!(slots.allocate(), Some(SwapSlot(3)));
        }

        #[test]
        fn live_slots_never_alias() {
            let mut slots = SwapAllocator::new(16);
            let mut live = Vec::new();
            for round in 0..64 {
                if round % 3 == 2 {
                    slots.release(live.remove(round % live.len()));
                } else if let Some(slot) = slots.allocate() {
                    assert!(!live.contains(&slot), "{slot:?} handed out twice");
                    live.push(slot);
                }
            }
            assert_eq!(slots.used(), live.len());
        }

        #[test]
        #[should_panic(expected = "not allocated")]
        fn double_release_panics() {
            let mut slots = SwapAllocator::new(2);
            let slot = slots.allocate().unwrap();
            slots.release(slot);
            slots.release(slot);
        }

        #[test]
        #[should_panic(expected = "not allocated")]
        fn releasing_out_of_range_slot_panics() {
            let mut slots = SwapAllocator::new(2);
            slots.release(SwapSlot(7));
        }
    }

    mod table {
        use super::*;

        #[test]
        fn capacity_from_sector_count() {
            let swap = SwapTable::new(MemoryDisk::new(SECTORS_PER_SLOT as Sector * 4 + 3));
            assert_eq!(swap.capacity(), 4);
        }

        #[test]
        fn slot_round_trip() {
            let mut swap = SwapTable::new(MemoryDisk::new(SECTORS_PER_SLOT as Sector * 2));
            let mut contents = page(0);
            for (i, byte) in contents.iter_mut().enumerate() {
                *byte = i as u8;
            }

            let slot = swap.allocate_slot(&contents).unwrap();
            let other = swap.allocate_slot(&page(0xFF)).unwrap();
            assert_ne!(slot, other);

            let mut out = page(0);
            swap.load(slot, &mut out).unwrap();
            assert_eq!(out, contents);
            assert!(!swap.is_allocated(slot));
            assert_eq!(swap.used(), 1);
        }

        #[test]
        fn full_swap_reports_error() {
            let mut swap = SwapTable::new(MemoryDisk::new(SECTORS_PER_SLOT as Sector));
            swap.allocate_slot(&page(1)).unwrap();
            assert_eq!(swap.allocate_slot(&page(2)), Err(VmError::SwapFull));
        }

        struct FailingDisk;

        impl BlockDevice for FailingDisk {
            fn sector_count(&self) -> Sector {
                SECTORS_PER_SLOT as Sector * 2
            }

            fn read(&mut self, _sector: Sector, _buf: &mut [u8]) -> Result<(), BlockError> {
                Err(BlockError::Device)
            }

            fn write(&mut self, _sector: Sector, _buf: &[u8]) -> Result<(), BlockError> {
                Err(BlockError::Device)
            }
        }

        #[test]
        fn failed_write_releases_slot() {
            let mut swap = SwapTable::new(FailingDisk);
            assert_eq!(
                swap.allocate_slot(&page(1)),
                Err(VmError::Io(BlockError::Device))
            );
            assert_eq!(swap.used(), 0);
        }
    }
}
