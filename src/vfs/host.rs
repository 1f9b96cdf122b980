//! Host-backed files
//!
//! Proxies VFS calls to the host filesystem. Only available in host builds;
//! on the board there is no host to proxy to.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::vfs::{OpenMode, VfsError};

/// An open host file. Each VFS call re-opens the path: the contract is
/// stateless positional I/O, so nothing is gained by holding the descriptor.
pub struct HostFile {
    path: PathBuf,
}

pub(crate) fn open(subpath: &str, mode: OpenMode) -> Result<HostFile, VfsError> {
    let path = PathBuf::from(subpath);
    match mode {
        OpenMode::Read => {
            fs::metadata(&path)?;
        }
        OpenMode::Write => {
            // Create-or-replace, matching the other backends.
            File::create(&path)?;
        }
    }
    Ok(HostFile { path })
}

impl HostFile {
    pub(crate) fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize, VfsError> {
        let mut f = File::open(&self.path)?;
        let len = f.seek(SeekFrom::End(0))?;
        if offset >= len {
            return Ok(0);
        }
        f.seek(SeekFrom::Start(offset))?;
        let want = buf.len().min((len - offset) as usize);
        let mut done = 0;
        while done < want {
            let n = f.read(&mut buf[done..want])?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub(crate) fn write(&self, offset: u64, buf: &[u8]) -> Result<usize, VfsError> {
        let mut f = OpenOptions::new().write(true).open(&self.path)?;
        let len = f.seek(SeekFrom::End(0))?;
        f.seek(SeekFrom::Start(offset.min(len)))?;
        f.write_all(buf)?;
        Ok(buf.len())
    }

    pub(crate) fn info(&self) -> Result<(u64, u64), VfsError> {
        Ok((0, fs::metadata(&self.path)?.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let subpath = path.to_str().unwrap();

        let file = open(subpath, OpenMode::Write).unwrap();
        assert_eq!(file.write(0, b"hello host").unwrap(), 10);

        let file = open(subpath, OpenMode::Read).unwrap();
        assert_eq!(file.info().unwrap(), (0, 10));
        let mut buf = [0u8; 16];
        assert_eq!(file.read(0, &mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"hello host");

        // Past-end reads are EOF, not errors.
        assert_eq!(file.read(10, &mut buf).unwrap(), 0);
    }

    #[test]
    fn read_mode_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(open(path.to_str().unwrap(), OpenMode::Read).is_err());
    }
}
