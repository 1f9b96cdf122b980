//! SD/MMC Card Controller Driver
//!
//! Drives the card command/response/data-FIFO register window: card reset and
//! voltage/capability negotiation, relative-address selection, partition
//! discovery, and raw 512-byte block transfer with CRC-failure retry.
//!
//! The register window itself is reached through the [`MmcBus`] trait so the
//! identical driver runs against the real MMIO block on the board and against
//! an emulated register file in tests.
//!
//! # References
//! - SD physical layer simplified spec, part 1
//! - <http://wiki.seabright.co.nz/wiki/SdCardProtocol.html>

use bitflags::bitflags;
use log::{debug, info};

use crate::device::block::{BlockDevice, BlockError, SECTOR_SIZE};

// =============================================================================
// Register Definitions
// =============================================================================

/// Register offsets within the controller window.
pub mod reg {
    pub const CMD: usize = 0x00; // Command Register
    pub const ARG: usize = 0x04; // Command Argument Register
    pub const TIMEOUT: usize = 0x08; // Timeout Register
    pub const CLKDIV: usize = 0x0c; // Clock Divider Register
    pub const RSP0: usize = 0x10; // Response Register 0
    pub const RSP1: usize = 0x14; // Response Register 1
    pub const RSP2: usize = 0x18; // Response Register 2
    pub const RSP3: usize = 0x1c; // Response Register 3
    pub const STATUS: usize = 0x20; // Status Register
    pub const VDD: usize = 0x30; // Voltage Supply Register
    pub const EDM: usize = 0x34; // Embedded Debug Mode Register
    pub const HOST_CFG: usize = 0x38; // Host Configuration Register
    pub const HBCT: usize = 0x3c; // Host Byte Count Register
    pub const DATA: usize = 0x40; // Data FIFO Access
    pub const HBLC: usize = 0x50; // Host Block Count Register
}

bitflags! {
    /// Command register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CmdFlags: u32 {
        const ENABLE   = 1 << 15;
        const FAIL     = 1 << 14;
        const BUSY     = 1 << 11;
        const NO_RSP   = 1 << 10;
        const LONG_RSP = 1 << 9;
        const WRITE    = 1 << 7;
        const READ     = 1 << 6;
    }
}

/// Status register: word-transfer ready bit.
const STATUS_FIFO_READY: u32 = 1 << 0;
/// Status register: any of these bits means the block data failed its CRC.
const STATUS_ERROR_MASK: u32 = 0xe8;

/// Card command opcodes.
mod cmd {
    pub const GO_IDLE_STATE: u32 = 0;
    pub const ALL_SEND_CID: u32 = 2;
    pub const SEND_RELATIVE_ADDR: u32 = 3;
    pub const SELECT_CARD: u32 = 7;
    pub const SEND_IF_COND: u32 = 8;
    pub const SEND_CSD: u32 = 9;
    pub const STOP_TRANSMISSION: u32 = 12;
    pub const SET_BLOCKLEN: u32 = 16;
    pub const READ_SINGLE_BLOCK: u32 = 17;
    pub const READ_MULTIPLE_BLOCK: u32 = 18;
    pub const WRITE_MULTIPLE_BLOCK: u32 = 25;
    pub const SD_SEND_OP_COND: u32 = 41; // ACMD
    pub const APP_CMD: u32 = 55;
}

/// SEND_IF_COND argument: 2.7-3.6V range plus check pattern.
const IF_COND_CHECK: u32 = 0x155;
/// ACMD41 argument for v2 cards: HCS plus the voltage window.
const OP_COND_HCS: u32 = 0x4010_0000;

/// Conservative identification-phase clock divider.
const CLKDIV_IDENT: u32 = 0x96;
/// Full-speed divider once the card is selected.
const CLKDIV_FULL: u32 = 0x04;

const WORDS_PER_SECTOR: usize = SECTOR_SIZE / 4;

// =============================================================================
// Bus Abstraction
// =============================================================================

/// Access to the card controller hardware.
///
/// [`Mmio`] implements this over the real register window; tests provide an
/// emulated register file.
pub trait MmcBus {
    /// One-time board setup: pin multiplexing and pull-ups for the card
    /// interface.
    fn setup(&mut self);

    /// Read a 32-bit register at `reg` (see [`reg`]).
    fn read_reg(&mut self, reg: usize) -> u32;

    /// Write a 32-bit register at `reg`.
    fn write_reg(&mut self, reg: usize, value: u32);

    /// Busy-wait for approximately `ms` milliseconds.
    fn delay_ms(&mut self, ms: u32);
}

/// Real register window: volatile access at a fixed physical base.
pub struct Mmio {
    mmc_base: usize,
    gpio_base: usize,
}

// GPIO function-select and pull-up registers used to route the card pins.
const GPIO_FSEL4: usize = 0x10;
const GPIO_FSEL5: usize = 0x14;
const GPIO_PUD: usize = 0x94;

/// Rough spin count per millisecond for [`Mmio::delay_ms`]; the card protocol
/// only needs "short" and "around 100ms", not precision.
const SPINS_PER_MS: u32 = 100_000;

impl Mmio {
    /// # Safety-relevant note
    ///
    /// The addresses must map the card controller and GPIO register windows;
    /// all accesses are raw volatile reads/writes.
    pub const fn new(mmc_base: usize, gpio_base: usize) -> Self {
        Self { mmc_base, gpio_base }
    }

    fn write_gpio(&mut self, reg: usize, value: u32) {
        unsafe {
            core::ptr::write_volatile((self.gpio_base + reg) as *mut u32, value);
        }
    }
}

impl MmcBus for Mmio {
    fn setup(&mut self) {
        // Route the card interface pins and enable pull-ups.
        self.write_gpio(GPIO_FSEL4, 0x2400_0000);
        self.write_gpio(GPIO_FSEL5, 0x924);
        self.write_gpio(GPIO_PUD, 2);
    }

    fn read_reg(&mut self, reg: usize) -> u32 {
        unsafe { core::ptr::read_volatile((self.mmc_base + reg) as *const u32) }
    }

    fn write_reg(&mut self, reg: usize, value: u32) {
        unsafe {
            core::ptr::write_volatile((self.mmc_base + reg) as *mut u32, value);
        }
    }

    fn delay_ms(&mut self, ms: u32) {
        for _ in 0..ms.saturating_mul(SPINS_PER_MS) {
            core::hint::spin_loop();
        }
    }
}

// =============================================================================
// Driver Implementation
// =============================================================================

/// Card generation reported by SEND_IF_COND.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdVersion {
    V1,
    V2,
}

/// Driver knobs.
#[derive(Debug, Clone, Copy)]
pub struct CardConfig {
    /// Bound on per-block CRC retries. `None` retries forever: a dead card
    /// link is unrecoverable anyway, so the historical policy is to keep
    /// trying. Tests inject a limit.
    pub max_block_retries: Option<u32>,
    /// Settle delay after each successful block, before the next command.
    pub settle_delay_ms: u32,
    /// Backoff between ACMD41 ready polls.
    pub ready_poll_delay_ms: u32,
}

impl Default for CardConfig {
    fn default() -> Self {
        Self {
            max_block_retries: None,
            settle_delay_ms: 1,
            ready_poll_delay_ms: 100,
        }
    }
}

/// SD/MMC card controller driver.
///
/// Owns its bus; the storage subsystem owns the controller. No global state.
pub struct CardController<B: MmcBus> {
    bus: B,
    config: CardConfig,
    version: Option<SdVersion>,
    high_capacity: bool,
    /// Added to every logical sector before it is issued to the card;
    /// discovered once from the MBR at init time.
    partition_offset: u64,
    sector_count: u64,
    initialized: bool,
}

impl<B: MmcBus> CardController<B> {
    pub fn new(bus: B) -> Self {
        Self::with_config(bus, CardConfig::default())
    }

    pub fn with_config(bus: B, config: CardConfig) -> Self {
        Self {
            bus,
            config,
            version: None,
            high_capacity: false,
            partition_offset: 0,
            sector_count: 0,
            initialized: false,
        }
    }

    pub fn version(&self) -> Option<SdVersion> {
        self.version
    }

    pub fn is_high_capacity(&self) -> bool {
        self.high_capacity
    }

    /// Partition offset in sectors, 0 in whole-device mode.
    pub fn partition_offset(&self) -> u64 {
        self.partition_offset
    }

    /// Bring the card up. Nothing else may touch the card until this
    /// completes; the ACMD41 ready poll deliberately has no bound.
    pub fn init(&mut self) -> Result<(), BlockError> {
        self.bus.setup();
        self.bus.write_reg(reg::CLKDIV, CLKDIV_IDENT);
        self.bus.write_reg(reg::HOST_CFG, 0xa);
        self.bus.write_reg(reg::VDD, 0x1);

        // Reset the card.
        self.bus.write_reg(reg::CMD, 0);
        self.rpc(cmd::GO_IDLE_STATE, CmdFlags::empty(), 0);

        // SEND_IF_COND: a v2 card echoes the check pattern back.
        let e = self.rpc(cmd::SEND_IF_COND, CmdFlags::empty(), IF_COND_CHECK);
        self.wait_idle();
        let version = if e == 0 && (self.response(0) & 0xff) == (IF_COND_CHECK & 0xff) {
            SdVersion::V2
        } else {
            SdVersion::V1
        };
        info!(
            "mmc: found {} card",
            match version {
                SdVersion::V2 => "SDHC v2",
                SdVersion::V1 => "SD v1",
            }
        );
        self.version = Some(version);

        // Poll ACMD41 until the card reports ready. The HCS bit is only
        // legal on v2 cards.
        let op_arg = match version {
            SdVersion::V2 => OP_COND_HCS,
            SdVersion::V1 => 0,
        };
        loop {
            self.rpc(cmd::APP_CMD, CmdFlags::empty(), 0);
            let e = self.rpc(cmd::SD_SEND_OP_COND, CmdFlags::empty(), op_arg);
            self.wait_idle();
            if e == 0 && (self.response(0) & (1 << 31)) != 0 {
                break;
            }
            self.bus.delay_ms(self.config.ready_poll_delay_ms);
        }
        self.high_capacity = (self.response(0) & (1 << 30)) != 0;
        if self.high_capacity {
            info!("mmc: high capacity mode");
        }

        // Identify the card, learn its RCA and capacity, then select it.
        self.rpc(cmd::ALL_SEND_CID, CmdFlags::LONG_RSP, 0);
        self.wait_idle();
        self.rpc(cmd::SEND_RELATIVE_ADDR, CmdFlags::empty(), 0);
        self.wait_idle();
        let rca = self.response(0) & 0xffff_0000;
        debug!("mmc: RCA is {:#06x}", rca >> 16);

        self.rpc(cmd::SEND_CSD, CmdFlags::LONG_RSP, rca);
        self.wait_idle();
        self.sector_count = self.parse_csd_capacity();
        info!("mmc: {} sectors", self.sector_count);

        self.rpc(cmd::SELECT_CARD, CmdFlags::empty(), rca);
        self.wait_idle();

        // 512-byte blocks, then full clock for the data phase.
        self.rpc(cmd::SET_BLOCKLEN, CmdFlags::empty(), SECTOR_SIZE as u32);
        self.wait_idle();
        self.bus.write_reg(reg::CLKDIV, CLKDIV_FULL);

        self.initialized = true;

        // Find the FAT partition. No MBR signature means the card is a bare
        // filesystem image ("whole-device" mode).
        let mut mbr = [0u8; SECTOR_SIZE];
        self.transfer_block(0, &mut mbr, false, true)?;
        if let Some(offset) = scan_partition_table(&mbr) {
            info!("mmc: FAT partition at sector {:#x}", offset);
            self.partition_offset = offset;
        } else {
            info!("mmc: no partition table, using whole device");
        }

        Ok(())
    }

    /// Block until the controller has finished the command in flight.
    fn wait_idle(&mut self) {
        let busy = (CmdFlags::ENABLE | CmdFlags::BUSY).bits();
        while self.bus.read_reg(reg::CMD) & busy != 0 {
            core::hint::spin_loop();
        }
    }

    /// Issue a command and return any latched error bits from the status
    /// register. Response words are read separately once idle.
    fn rpc(&mut self, index: u32, flags: CmdFlags, arg: u32) -> u32 {
        self.wait_idle();

        // Acknowledge stale latched error bits before the next command.
        let e = self.bus.read_reg(reg::STATUS) & 0xff;
        if e != 0 {
            self.bus.write_reg(reg::STATUS, e);
        }

        self.bus.write_reg(reg::ARG, arg);
        self.bus
            .write_reg(reg::CMD, CmdFlags::ENABLE.bits() | flags.bits() | index);

        self.bus.read_reg(reg::STATUS) & STATUS_ERROR_MASK
    }

    fn response(&mut self, word: usize) -> u32 {
        self.bus.read_reg(reg::RSP0 + word * 4)
    }

    /// CSD v2 capacity: C_SIZE spans RSP bits 69:48, capacity is
    /// (C_SIZE + 1) * 512 KiB, i.e. (C_SIZE + 1) * 1024 sectors.
    fn parse_csd_capacity(&mut self) -> u64 {
        let csd0 = self.response(0);
        let csd1 = self.response(1);
        let c_size = (((csd1 & 0x3f) as u64) << 16) | (((csd0 >> 16) & 0xffff) as u64);
        (c_size + 1) * 1024
    }

    /// Sector address as the card wants it: block index for high-capacity
    /// cards, byte offset otherwise.
    fn card_address(&self, physical_sector: u64) -> u32 {
        if self.high_capacity {
            physical_sector as u32
        } else {
            (physical_sector << 9) as u32
        }
    }

    /// Move one block, retrying the whole block on any CRC fault.
    fn transfer_block(
        &mut self,
        physical: u64,
        buf: &mut [u8; SECTOR_SIZE],
        write: bool,
        single: bool,
    ) -> Result<(), BlockError> {
        let mut attempt = 0u32;
        loop {
            match self.try_transfer(physical, buf, write, single) {
                Ok(()) => {
                    if !single {
                        self.rpc(cmd::STOP_TRANSMISSION, CmdFlags::empty(), 0);
                        self.wait_idle();
                    }
                    // Let the card settle before the next command.
                    self.bus.delay_ms(self.config.settle_delay_ms);
                    return Ok(());
                }
                Err(BlockError::Crc { .. }) => {
                    self.rpc(cmd::STOP_TRANSMISSION, CmdFlags::empty(), 0);
                    self.wait_idle();
                    attempt += 1;
                    if let Some(max) = self.config.max_block_retries {
                        if attempt > max {
                            return Err(BlockError::RetriesExhausted { sector: physical });
                        }
                    }
                    debug!("mmc: CRC fault on sector {physical}, retry {attempt}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt: issue the data command, then move exactly 128 words
    /// through the status-gated FIFO.
    fn try_transfer(
        &mut self,
        physical: u64,
        buf: &mut [u8; SECTOR_SIZE],
        write: bool,
        single: bool,
    ) -> Result<(), BlockError> {
        let (index, flag) = if write {
            (cmd::WRITE_MULTIPLE_BLOCK, CmdFlags::WRITE)
        } else if single {
            (cmd::READ_SINGLE_BLOCK, CmdFlags::READ)
        } else {
            (cmd::READ_MULTIPLE_BLOCK, CmdFlags::READ)
        };
        let addr = self.card_address(physical);
        self.rpc(index, flag, addr);
        self.wait_idle();

        for chunk in buf.chunks_exact_mut(4) {
            self.wait_fifo(physical)?;
            if write {
                let w = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                self.bus.write_reg(reg::DATA, w);
            } else {
                let w = self.bus.read_reg(reg::DATA);
                chunk.copy_from_slice(&w.to_le_bytes());
            }
        }
        Ok(())
    }

    /// Wait for the FIFO ready bit. Any other status bit is a CRC fault for
    /// the block in flight.
    fn wait_fifo(&mut self, sector: u64) -> Result<(), BlockError> {
        loop {
            let status = self.bus.read_reg(reg::STATUS);
            if status & STATUS_ERROR_MASK != 0 {
                return Err(BlockError::Crc { sector });
            }
            if status & STATUS_FIFO_READY != 0 {
                return Ok(());
            }
            core::hint::spin_loop();
        }
    }
}

impl<B: MmcBus> BlockDevice for CardController<B> {
    fn read_sector(&mut self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), BlockError> {
        if !self.initialized {
            return Err(BlockError::NotReady);
        }
        self.transfer_block(sector + self.partition_offset, buf, false, false)
    }

    fn write_sector(&mut self, sector: u64, buf: &[u8; SECTOR_SIZE]) -> Result<(), BlockError> {
        if !self.initialized {
            return Err(BlockError::NotReady);
        }
        let mut data = *buf;
        self.transfer_block(sector + self.partition_offset, &mut data, true, false)
    }

    fn sector_count(&self) -> u64 {
        self.sector_count
    }
}

// =============================================================================
// Partition Table
// =============================================================================

/// Offset of the four 16-byte partition entries in the MBR.
const MBR_PART_TABLE: usize = 0x1be;

/// Scan a master boot record for the first FAT partition and return its
/// starting LBA. `None` if the sector carries no MBR signature or no FAT
/// partition.
pub(crate) fn scan_partition_table(mbr: &[u8; SECTOR_SIZE]) -> Option<u64> {
    if mbr[510] != 0x55 || mbr[511] != 0xaa {
        return None;
    }
    for entry in 0..4 {
        let off = MBR_PART_TABLE + entry * 16;
        let part_type = mbr[off + 4];
        // FAT12, FAT16 (<32M, regular, LBA), FAT32 (CHS, LBA)
        if matches!(part_type, 0x01 | 0x04 | 0x06 | 0x0b | 0x0c | 0x0e) {
            let lba =
                u32::from_le_bytes([mbr[off + 8], mbr[off + 9], mbr[off + 10], mbr[off + 11]]);
            return Some(lba as u64);
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
