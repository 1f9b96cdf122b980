//! RAM-backed block device
//!
//! The emulated counterpart of the card controller: a plain `Vec` of sectors.
//! Used by the SD/FAT backend tests (formatted as a FAT volume) and anywhere
//! a whole-device image is more convenient than real hardware.

use crate::device::block::{BlockDevice, BlockError, SECTOR_SIZE};

/// In-memory block device.
pub struct RamDisk {
    data: Vec<u8>,
}

impl RamDisk {
    /// Create a zero-filled disk of `sector_count` sectors.
    pub fn new(sector_count: u64) -> Self {
        Self {
            data: vec![0u8; sector_count as usize * SECTOR_SIZE],
        }
    }

    /// Wrap an existing image; the length is rounded down to whole sectors.
    pub fn from_image(mut data: Vec<u8>) -> Self {
        data.truncate(data.len() / SECTOR_SIZE * SECTOR_SIZE);
        Self { data }
    }

    fn range(&self, sector: u64) -> Result<usize, BlockError> {
        let start = sector as usize * SECTOR_SIZE;
        if start + SECTOR_SIZE > self.data.len() {
            return Err(BlockError::InvalidSector(sector));
        }
        Ok(start)
    }
}

impl BlockDevice for RamDisk {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), BlockError> {
        let start = self.range(sector)?;
        buf.copy_from_slice(&self.data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<(), BlockError> {
        let start = self.range(sector)?;
        self.data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> u64 {
        (self.data.len() / SECTOR_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sector_round_trip() {
        let mut disk = RamDisk::new(4);
        let mut block = [0u8; SECTOR_SIZE];
        block[0] = 0xde;
        block[511] = 0xad;
        disk.write_sector(2, &block).unwrap();

        let mut back = [0u8; SECTOR_SIZE];
        disk.read_sector(2, &mut back).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn out_of_range_sector_rejected() {
        let mut disk = RamDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(
            disk.read_sector(4, &mut buf),
            Err(BlockError::InvalidSector(4))
        );
    }
}
