//! Virtual file system
//!
//! One uniform open/close/read/write/info/enumerate contract over several
//! storage backends, selected by the scheme prefix of a `scheme:subpath`
//! path:
//!
//! - `mem:`  — a raw address range ([`mem`])
//! - `host:` — a host file, host builds only ([`host`])
//! - `sd:`   — a file on the card's FAT volume ([`sd`])
//!
//! Callers address file contents positionally; handles carry no cursor. A
//! short read is end-of-data, never an error.
//!
//! Dispatch is a match over the closed set of backends rather than a
//! registration table: the scheme set is fixed at build time.

pub mod mem;
pub mod sd;

#[cfg(feature = "host")]
pub mod host;

use thiserror::Error;

use crate::device::BlockDevice;

/// VFS error types.
#[derive(Debug, Error)]
pub enum VfsError {
    #[error("malformed path (no VFS specifier)")]
    NoScheme,
    #[error("unknown VFS scheme `{0}`")]
    UnknownScheme(String),
    #[error("malformed mem: path (use <hex-start> or <hex-start>+<hex-length>)")]
    MalformedMemPath,
    #[error("mem: reads require an explicit length")]
    UnboundedRead,
    #[error("backend does not support enumeration")]
    EnumerateUnsupported,
    #[error("no card present")]
    NoCard,
    #[error("filesystem error: {0}")]
    Filesystem(String),
    #[cfg(feature = "host")]
    #[error("host I/O error: {0}")]
    Host(#[from] std::io::Error),
}

/// Open disposition. Write means create-or-replace, not append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// An open file. Owned exclusively by the caller that opened it and released
/// by [`Vfs::close`].
pub enum Handle {
    Mem(mem::MemFile),
    #[cfg(feature = "host")]
    Host(host::HostFile),
    Sd(sd::SdHandle),
}

/// The storage subsystem's front door.
///
/// Owns the SD backend (and through it the card); the memory and host
/// backends are stateless.
pub struct Vfs {
    sd: sd::SdBackend,
}

impl Vfs {
    /// A VFS with no card attached; `sd:` paths report the absence.
    pub fn new() -> Self {
        Self {
            sd: sd::SdBackend::empty(),
        }
    }

    /// A VFS backed by an initialized card (or any other block device).
    pub fn with_card(dev: Box<dyn BlockDevice>) -> Self {
        Self {
            sd: sd::SdBackend::new(dev),
        }
    }

    fn split(path: &str) -> Result<(&str, &str), VfsError> {
        path.split_once(':').ok_or(VfsError::NoScheme)
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<Handle, VfsError> {
        let (scheme, subpath) = Self::split(path)?;
        match scheme {
            "mem" => Ok(Handle::Mem(mem::open(subpath, mode)?)),
            #[cfg(feature = "host")]
            "host" => Ok(Handle::Host(host::open(subpath, mode)?)),
            "sd" => Ok(Handle::Sd(self.sd.open(subpath, mode)?)),
            other => Err(VfsError::UnknownScheme(other.to_string())),
        }
    }

    /// Release a handle. Consuming it by value makes double-close
    /// unrepresentable.
    pub fn close(&mut self, handle: Handle) {
        drop(handle);
    }

    /// Read at `offset`, returning the bytes actually transferred. Zero
    /// means end of data.
    pub fn read(
        &mut self,
        handle: &Handle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, VfsError> {
        match handle {
            Handle::Mem(f) => Ok(f.read(offset, buf)),
            #[cfg(feature = "host")]
            Handle::Host(f) => f.read(offset, buf),
            Handle::Sd(f) => self.sd.read(f, offset, buf),
        }
    }

    /// Write at `offset`, returning the bytes actually written.
    pub fn write(&mut self, handle: &Handle, offset: u64, buf: &[u8]) -> Result<usize, VfsError> {
        match handle {
            Handle::Mem(f) => Ok(f.write(offset, buf)),
            #[cfg(feature = "host")]
            Handle::Host(f) => f.write(offset, buf),
            Handle::Sd(f) => self.sd.write(f, offset, buf),
        }
    }

    /// Base address and length. The base is 0 except for `mem:` files,
    /// where it is the window's physical start address.
    pub fn info(&mut self, handle: &Handle) -> Result<(u64, u64), VfsError> {
        match handle {
            Handle::Mem(f) => Ok(f.info()),
            #[cfg(feature = "host")]
            Handle::Host(f) => f.info(),
            Handle::Sd(f) => self.sd.info(f),
        }
    }

    /// List a directory, calling `visit(name, is_dir, size)` per entry.
    /// Only the `sd:` backend has directories.
    pub fn enumerate(
        &mut self,
        path: &str,
        visit: &mut dyn FnMut(&str, bool, u64),
    ) -> Result<(), VfsError> {
        let (scheme, subpath) = Self::split(path)?;
        match scheme {
            "sd" => self.sd.enumerate(subpath, visit),
            "mem" => Err(VfsError::EnumerateUnsupported),
            #[cfg(feature = "host")]
            "host" => Err(VfsError::EnumerateUnsupported),
            other => Err(VfsError::UnknownScheme(other.to_string())),
        }
    }

    /// Flush and release the card's filesystem, e.g. before power-down.
    pub fn unmount(&mut self) -> Result<(), VfsError> {
        self.sd.unmount()
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaked_window(len: usize) -> usize {
        Box::leak(vec![0u8; len].into_boxed_slice()).as_mut_ptr() as usize
    }

    #[test]
    fn path_without_scheme_is_rejected() {
        let mut vfs = Vfs::new();
        assert!(matches!(
            vfs.open("no-colon-here", OpenMode::Read),
            Err(VfsError::NoScheme)
        ));
    }

    #[test]
    fn unknown_scheme_is_named_in_the_error() {
        let mut vfs = Vfs::new();
        let err = vfs.open("tape:whatever", OpenMode::Read).err();
        assert!(matches!(err, Some(VfsError::UnknownScheme(s)) if s == "tape"));
    }

    #[test]
    fn mem_path_with_length_opens_exact_window() {
        let mut vfs = Vfs::new();
        let addr = leaked_window(0x10);
        let handle = vfs
            .open(&format!("mem:{addr:x}+10"), OpenMode::Read)
            .unwrap();
        assert_eq!(vfs.info(&handle).unwrap(), (addr as u64, 0x10));
        vfs.close(handle);
    }

    #[test]
    fn mem_round_trip_with_clamping() {
        let mut vfs = Vfs::new();
        let addr = leaked_window(0x40);
        let path = format!("mem:{addr:x}+40");

        let handle = vfs.open(&path, OpenMode::Write).unwrap();
        let data: Vec<u8> = (0u8..0x40).collect();
        assert_eq!(vfs.write(&handle, 0, &data).unwrap(), 0x40);
        vfs.close(handle);

        let handle = vfs.open(&path, OpenMode::Read).unwrap();
        let mut buf = [0u8; 0x40];
        assert_eq!(vfs.read(&handle, 0, &mut buf).unwrap(), 0x40);
        assert_eq!(&buf[..], &data[..]);

        // offset == length reads nothing; an overhang is truncated.
        assert_eq!(vfs.read(&handle, 0x40, &mut buf).unwrap(), 0);
        assert_eq!(vfs.read(&handle, 0x30, &mut buf).unwrap(), 0x10);
        assert_eq!(&buf[..0x10], &data[0x30..]);
        vfs.close(handle);
    }

    #[test]
    fn enumerate_rejected_on_flat_backends() {
        let mut vfs = Vfs::new();
        assert!(matches!(
            vfs.enumerate("mem:1000+10", &mut |_, _, _| {}),
            Err(VfsError::EnumerateUnsupported)
        ));
    }

    #[cfg(feature = "host")]
    #[test]
    fn host_round_trip_through_dispatcher() {
        let dir = tempfile::tempdir().unwrap();
        let path = format!("host:{}", dir.path().join("f.bin").display());

        let mut vfs = Vfs::new();
        let handle = vfs.open(&path, OpenMode::Write).unwrap();
        vfs.write(&handle, 0, b"dispatch").unwrap();
        vfs.close(handle);

        let handle = vfs.open(&path, OpenMode::Read).unwrap();
        assert_eq!(vfs.info(&handle).unwrap(), (0, 8));
        let mut buf = [0u8; 8];
        assert_eq!(vfs.read(&handle, 0, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"dispatch");
        vfs.close(handle);
    }
}
