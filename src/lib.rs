//! pimon storage & transfer subsystem
//!
//! The storage side of a serial-console monitor for an embedded board: a
//! virtual file system unifying raw memory ranges, host files, and a FAT
//! volume on an SD/MMC card, plus an XMODEM engine that moves files across
//! the serial link.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  monitor commands (cp, dump, ls, send, recv)     │   external
//! └──────────┬───────────────────────┬───────────────┘
//!            │ Vfs                   │ Console
//! ┌──────────┴──────────┐   ┌────────┴───────────────┐
//! │  vfs: mem/host/sd   │   │  xmodem: send/receive  │
//! └──────────┬──────────┘   └────────────────────────┘
//!            │ BlockDevice
//! ┌──────────┴──────────────────────────────────────┐
//! │  device: CardController / RamDisk over MmcBus   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! Everything is single-threaded and blocking: one command runs at a time,
//! and all waits are poll loops. Hardware sits behind the [`MmcBus`] and
//! [`console::Console`] traits, so the same code drives the board's register
//! windows and the emulated devices used in tests.

pub mod console;
pub mod device;
pub mod vfs;
pub mod xmodem;

pub use console::Console;
pub use device::{BlockDevice, BlockError, CardConfig, CardController, Mmio, MmcBus, RamDisk};
pub use vfs::{Handle, OpenMode, Vfs, VfsError};
pub use xmodem::{TransferStats, XmodemError};
