//! Block devices used as swap.

use alloc::{vec, vec::Vec};

use crate::BlockError;

/// Size of one device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Index of a sector on a block device.
pub type Sector = u32;

/// A sector-addressed storage device.
///
/// Buffers passed to [`read`](Self::read) and [`write`](Self::write) are
/// exactly [`SECTOR_SIZE`] bytes long.
pub trait BlockDevice: Send {
    /// Number of sectors on the device.
    fn sector_count(&self) -> Sector;

    fn read(&mut self, sector: Sector, buf: &mut [u8]) -> Result<(), BlockError>;

    fn write(&mut self, sector: Sector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device backed by host memory.
pub struct MemoryDisk {
    data: Vec<u8>,
}

impl MemoryDisk {
    /// Creates a zeroed disk of `sectors` sectors.
    pub fn new(sectors: Sector) -> Self {
        Self {
            data: vec![0; sectors as usize * SECTOR_SIZE],
        }
    }

    fn range(&self, sector: Sector) -> Result<core::ops::Range<usize>, BlockError> {
        if sector >= self.sector_count() {
            return Err(BlockError::OutOfRange { sector });
        }
        let start = sector as usize * SECTOR_SIZE;
        Ok(start..start + SECTOR_SIZE)
    }
}

impl BlockDevice for MemoryDisk {
    fn sector_count(&self) -> Sector {
        (self.data.len() / SECTOR_SIZE) as Sector
    }

    fn read(&mut self, sector: Sector, buf: &mut [u8]) -> Result<(), BlockError> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let range = self.range(sector)?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, sector: Sector, buf: &[u8]) -> Result<(), BlockError> {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}
