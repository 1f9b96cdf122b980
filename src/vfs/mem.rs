//! Memory-backed files
//!
//! Treats a contiguous address range as a file. Paths are `<hex-start>` or
//! `<hex-start>+<hex-length>` with no `0x` prefix; a bare start address is
//! only legal for writing, where its implicit length runs to the top of the
//! address space. Pure pointer arithmetic, no hardware.

use crate::vfs::{OpenMode, VfsError};

/// An open window onto raw memory.
pub struct MemFile {
    start: usize,
    length: usize,
}

pub(crate) fn open(subpath: &str, mode: OpenMode) -> Result<MemFile, VfsError> {
    let (start_s, len_s) = match subpath.split_once('+') {
        Some((s, l)) => (s, Some(l)),
        None => (subpath, None),
    };
    let start = usize::from_str_radix(start_s, 16).map_err(|_| VfsError::MalformedMemPath)?;
    let length = match len_s {
        Some(l) => usize::from_str_radix(l, 16).map_err(|_| VfsError::MalformedMemPath)?,
        // A read without a length would scan unbounded memory; a write is
        // naturally bounded by the incoming data.
        None => match mode {
            OpenMode::Write => usize::MAX - start,
            OpenMode::Read => return Err(VfsError::UnboundedRead),
        },
    };
    Ok(MemFile { start, length })
}

impl MemFile {
    /// Bytes transferable at `offset`: zero past the end, truncated at the
    /// end, never wrapped or extended.
    fn clamp(&self, offset: u64, want: usize) -> usize {
        if offset >= self.length as u64 {
            return 0;
        }
        want.min((self.length as u64 - offset) as usize)
    }

    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> usize {
        let n = self.clamp(offset, buf.len());
        if n > 0 {
            // The operator named this address range; the monitor takes it
            // on faith, exactly like a dump command would.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    (self.start + offset as usize) as *const u8,
                    buf.as_mut_ptr(),
                    n,
                );
            }
        }
        n
    }

    pub(crate) fn write(&self, offset: u64, buf: &[u8]) -> usize {
        let n = self.clamp(offset, buf.len());
        if n > 0 {
            unsafe {
                core::ptr::copy_nonoverlapping(
                    buf.as_ptr(),
                    (self.start + offset as usize) as *mut u8,
                    n,
                );
            }
        }
        n
    }

    /// Base address and length. The base is real here, unlike the other
    /// backends, so address-printing callers can show true addresses.
    pub(crate) fn info(&self) -> (u64, u64) {
        (self.start as u64, self.length as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_window(len: usize) -> usize {
        Box::leak(vec![0u8; len].into_boxed_slice()).as_mut_ptr() as usize
    }

    #[test]
    fn clamps_at_window_end() {
        let addr = leaked_window(0x10);
        let file = open(&format!("{addr:x}+10"), OpenMode::Write).unwrap();

        let data = [0xaau8; 8];
        assert_eq!(file.write(0xc, &data), 4); // truncated to the remainder
        assert_eq!(file.write(0x10, &data), 0); // offset == length
        assert_eq!(file.write(0x20, &data), 0); // offset > length

        let mut back = [0u8; 8];
        assert_eq!(file.read(0xc, &mut back), 4);
        assert_eq!(&back[..4], &[0xaa; 4]);
    }

    #[test]
    fn bare_start_is_write_only() {
        assert!(matches!(
            open("1000", OpenMode::Read),
            Err(VfsError::UnboundedRead)
        ));
        let file = open("1000", OpenMode::Write).unwrap();
        assert_eq!(file.info(), (0x1000, (usize::MAX - 0x1000) as u64));
    }

    #[test]
    fn malformed_hex_is_rejected() {
        assert!(matches!(
            open("12g4", OpenMode::Write),
            Err(VfsError::MalformedMemPath)
        ));
        assert!(matches!(
            open("1000+zz", OpenMode::Write),
            Err(VfsError::MalformedMemPath)
        ));
        assert!(matches!(
            open("", OpenMode::Write),
            Err(VfsError::MalformedMemPath)
        ));
    }
}
