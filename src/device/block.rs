//! Block device abstraction
//!
//! Unified interface for sector-granular storage:
//! - SD/MMC card controller ([`crate::device::CardController`])
//! - RAM-backed disk ([`crate::device::RamDisk`])

use thiserror::Error;

/// Sector size shared by every device in this crate.
pub const SECTOR_SIZE: usize = 512;

/// Block device error types.
///
/// Transient link faults (data CRC mismatches) are retried inside the driver
/// and never surface here unless a retry bound is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlockError {
    /// Device not ready or not present
    #[error("device not ready or not present")]
    NotReady,
    /// Sector number outside the device
    #[error("invalid sector {0}")]
    InvalidSector(u64),
    /// Data CRC mismatch on a block transfer
    #[error("data CRC error on sector {sector}")]
    Crc { sector: u64 },
    /// Configured retry bound exceeded while a block kept failing
    #[error("retries exhausted on sector {sector}")]
    RetriesExhausted { sector: u64 },
}

/// Block device trait
///
/// Implemented by storage drivers. Receivers are `&mut self`: the monitor has
/// exactly one command execution context, so devices have a single owner and
/// no interior locking.
pub trait BlockDevice {
    /// Read one 512-byte sector.
    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), BlockError>;

    /// Write one 512-byte sector.
    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<(), BlockError>;

    /// Total number of sectors.
    fn sector_count(&self) -> u64;
}
