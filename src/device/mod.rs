//! Device abstraction layer
//!
//! Trait-based abstractions for the storage hardware, allowing the same
//! driver and filesystem code to work with both:
//! - the real SD/MMC controller register window (MMIO)
//! - emulated devices (register-file fakes in tests, RAM disks)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              VFS / FAT layer                │
//! └──────────────────┬──────────────────────────┘
//!                    │ BlockDevice
//! ┌──────────────────┴──────────────────────────┐
//! │  CardController          RamDisk            │
//! └──────────────────┬──────────────────────────┘
//!                    │ MmcBus
//! ┌──────────────────┴──────────────────────────┐
//! │  Mmio (real register window)  /  test fakes │
//! └─────────────────────────────────────────────┘
//! ```

pub mod block;
pub mod mmc;
pub mod ramdisk;

pub use block::{BlockDevice, BlockError, SECTOR_SIZE};
pub use mmc::{CardConfig, CardController, Mmio, MmcBus, SdVersion};
pub use ramdisk::RamDisk;
