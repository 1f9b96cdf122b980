//! Serial console seam
//!
//! The interactive console (line editor, command dispatch) lives outside this
//! crate; storage code only ever sees this trait. The XMODEM engine drives a
//! transfer through it one byte at a time.
//!
//! All waits are synchronous: `read_byte` spins until input arrives, and
//! `read_byte_timeout` is a bounded wait on available input, not an async
//! cancellation point.

/// Byte-level console access.
pub trait Console {
    /// Read a byte, blocking until one is available.
    fn read_byte(&mut self) -> u8;

    /// Wait up to `ms` milliseconds for a byte.
    ///
    /// Returns `None` on timeout. Callers that need retransmission (the
    /// XMODEM receiver) re-issue their command byte when this times out.
    fn read_byte_timeout(&mut self, ms: u32) -> Option<u8>;

    /// Write a single byte.
    fn write_byte(&mut self, byte: u8);

    /// Check whether input is immediately available.
    fn has_input(&mut self) -> bool;

    /// Write a full buffer.
    fn write_all(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.write_byte(b);
        }
    }

    /// Discard all immediately-available input (line-noise recovery).
    fn drain(&mut self) {
        while self.has_input() {
            let _ = self.read_byte();
        }
    }
}
