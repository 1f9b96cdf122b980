//! XMODEM file transfer
//!
//! Sender and receiver state machines moving a VFS file across the serial
//! console in framed, checksummed blocks:
//!
//! ```text
//! ┌────────┬────────┬─────────┬──────────────────┬─────────────────────┐
//! │ SOH/STX│ block# │ ~block# │ payload 128/1024 │ checksum or CRC-16  │
//! └────────┴────────┴─────────┴──────────────────┴─────────────────────┘
//! ```
//!
//! The receiver always asks for CRC-16 mode (`'C'`); the sender also speaks
//! plain-checksum mode for peers that open with NAK. Transient line faults
//! are handled inside the protocol: the receiver NAKs a bad frame and the
//! sender retransmits, so a fault never surfaces to the caller. A peer that
//! goes silent stalls the transfer; there is no overall abort timeout.

use log::{debug, info};
use thiserror::Error;

use crate::console::Console;
use crate::vfs::{Handle, Vfs, VfsError};

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const EOT: u8 = 0x04;
pub const ACK: u8 = 0x06;
pub const NAK: u8 = 0x15;
/// SUB, pads the tail of a final short block.
pub const PAD: u8 = 0x1a;
/// Opens a transfer in CRC-16 mode; otherwise equivalent to NAK.
pub const CRC_REQUEST: u8 = b'C';

/// Receiver inter-byte poll; on expiry the pending command byte is resent.
const RECV_POLL_MS: u32 = 1000;

#[derive(Debug, Error)]
pub enum XmodemError {
    #[error(transparent)]
    Vfs(#[from] VfsError),
    /// The destination stopped accepting bytes mid-transfer, e.g. a memory
    /// window smaller than the incoming file.
    #[error("destination cannot hold more data")]
    DestinationFull,
}

/// What a completed transfer moved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    /// Accepted data blocks (retransmissions not counted).
    pub blocks: u32,
    /// Sender: exact file bytes. Receiver: bytes as framed, including any
    /// final-block padding.
    pub bytes: u64,
    /// Retransmissions.
    pub retries: u32,
}

/// CRC-16/XMODEM: polynomial 0x1021, initial value 0, MSB first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Classic 8-bit modular-sum trailer.
fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b))
}

/// Block size for `remaining` bytes: 1K frames while a full one can be
/// filled, short-frame 128 for the tail.
fn block_size(remaining: u64) -> usize {
    if remaining >= 1024 {
        1024
    } else {
        128
    }
}

// =============================================================================
// Sender
// =============================================================================

/// Drive `file` out through the console. The peer paces the transfer: this
/// side only ever reacts to its control bytes.
pub fn send(
    console: &mut dyn Console,
    vfs: &mut Vfs,
    file: &Handle,
) -> Result<TransferStats, XmodemError> {
    let (_, len) = vfs.info(file)?;
    info!("xmodem: sending {len} bytes");

    let mut stats = TransferStats::default();
    let mut block: u8 = 1;
    let mut offset: u64 = 0;
    let mut size = block_size(len);
    let mut crc_mode = false;
    let mut sent_current = false;

    loop {
        match console.read_byte() {
            CRC_REQUEST => {
                crc_mode = true;
                if sent_current {
                    stats.retries += 1;
                }
                send_block(console, vfs, file, offset, size, block, crc_mode)?;
                sent_current = true;
            }
            NAK => {
                if sent_current {
                    stats.retries += 1;
                    debug!("xmodem: NAK, resending block {block}");
                }
                send_block(console, vfs, file, offset, size, block, crc_mode)?;
                sent_current = true;
            }
            ACK if sent_current => {
                stats.blocks += 1;
                stats.bytes += (size as u64).min(len - offset);
                block = block.wrapping_add(1);
                offset += size as u64;
                if offset >= len {
                    break;
                }
                size = block_size(len - offset);
                send_block(console, vfs, file, offset, size, block, crc_mode)?;
            }
            // Anything else is not a protocol event.
            _ => {}
        }
    }

    console.write_byte(EOT);
    // Block for the closing acknowledgement.
    let _ = console.read_byte();
    info!(
        "xmodem: sent {} bytes in {} blocks ({} retries)",
        stats.bytes, stats.blocks, stats.retries
    );
    Ok(stats)
}

fn send_block(
    console: &mut dyn Console,
    vfs: &mut Vfs,
    file: &Handle,
    offset: u64,
    size: usize,
    block: u8,
    crc_mode: bool,
) -> Result<(), XmodemError> {
    let mut payload = vec![PAD; size];
    let mut done = 0;
    while done < size {
        let n = vfs.read(file, offset + done as u64, &mut payload[done..])?;
        if n == 0 {
            break; // final block, the PAD fill stays
        }
        done += n;
    }

    console.write_byte(if size == 1024 { STX } else { SOH });
    console.write_byte(block);
    console.write_byte(!block);
    console.write_all(&payload);
    if crc_mode {
        let crc = crc16(&payload);
        console.write_byte((crc >> 8) as u8);
        console.write_byte(crc as u8);
    } else {
        console.write_byte(checksum(&payload));
    }
    Ok(())
}

// =============================================================================
// Receiver
// =============================================================================

/// Drive `file` in from the console. This side paces the transfer: it sends
/// a command byte (`'C'`, then ACK/NAK) and waits for the peer's response,
/// resending the command on poll timeout.
pub fn receive(
    console: &mut dyn Console,
    vfs: &mut Vfs,
    file: &Handle,
) -> Result<TransferStats, XmodemError> {
    let mut stats = TransferStats::default();
    let mut cmd = CRC_REQUEST;
    let mut last_block: u8 = 0;
    let mut offset: u64 = 0;
    let mut accepted_any = false;

    loop {
        console.write_byte(cmd);
        let Some(header) = console.read_byte_timeout(RECV_POLL_MS) else {
            continue;
        };
        let size = match header {
            SOH => 128,
            STX => 1024,
            EOT => {
                console.write_byte(ACK);
                info!(
                    "xmodem: received {} bytes in {} blocks ({} retries)",
                    stats.bytes, stats.blocks, stats.retries
                );
                return Ok(stats);
            }
            other => {
                // Line noise. Flush whatever rode in with it and re-issue
                // the command without consuming a sequence slot.
                debug!("xmodem: unexpected byte {other:#04x}, draining");
                console.drain();
                cmd = if accepted_any { NAK } else { CRC_REQUEST };
                continue;
            }
        };

        // block#, ~block#, payload, CRC-16 trailer, read as one unit. A
        // slow sender just extends the poll; only silence stalls us here.
        let mut frame = vec![0u8; size + 4];
        let mut got = 0;
        while got < frame.len() {
            if let Some(b) = console.read_byte_timeout(RECV_POLL_MS) {
                frame[got] = b;
                got += 1;
            }
        }

        let seq = frame[0];
        let nseq = frame[1];
        let payload = &frame[2..2 + size];
        let trailer = u16::from_be_bytes([frame[2 + size], frame[3 + size]]);

        if seq != !nseq || crc16(payload) != trailer {
            debug!("xmodem: bad frame for block {seq}, NAK");
            stats.retries += 1;
            cmd = NAK;
            continue;
        }

        if seq == last_block.wrapping_add(1) {
            // New data: write the framed payload as-is. Trimming any PAD
            // tail is the caller's business, not ours.
            let mut done = 0;
            while done < payload.len() {
                let n = vfs.write(file, offset + done as u64, &payload[done..])?;
                if n == 0 {
                    return Err(XmodemError::DestinationFull);
                }
                done += n;
            }
            offset += size as u64;
            last_block = seq;
            accepted_any = true;
            stats.blocks += 1;
            stats.bytes += size as u64;
            cmd = ACK;
        } else if accepted_any && seq == last_block {
            // Our ACK was lost and the peer retransmitted. Already
            // written, so re-ACK without touching the file.
            debug!("xmodem: duplicate block {seq}, re-ACK");
            cmd = ACK;
        } else {
            debug!("xmodem: out-of-sequence block {seq}, NAK");
            stats.retries += 1;
            cmd = NAK;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
