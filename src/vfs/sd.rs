//! SD/FAT backend
//!
//! Thin adapter between the VFS contract and the `fatfs` library, which in
//! turn reads and writes sectors through a [`BlockDevice`]. The volume is
//! mounted lazily on first use and can be explicitly unmounted before
//! power-down; the next operation remounts.

use std::cell::RefCell;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use fatfs::{FileSystem, FsOptions};
use log::{debug, info};

use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::vfs::{OpenMode, VfsError};

/// The card is shared between the mounted filesystem and the backend that
/// needs to remount after an unmount. Single-threaded ownership, so a
/// refcell is enough.
pub(crate) type SharedBlockDevice = Rc<RefCell<Box<dyn BlockDevice>>>;

/// An open FAT file. Holds the path only: each VFS call re-opens the file in
/// the mounted volume, which keeps the handle valid across unmount/remount.
pub struct SdHandle {
    path: String,
}

/// Map library error codes to the messages the monitor shows the operator.
fn fs_err(e: io::Error) -> VfsError {
    let msg = match e.kind() {
        io::ErrorKind::NotFound => "file or path not found".to_string(),
        io::ErrorKind::AlreadyExists => "file already exists".to_string(),
        io::ErrorKind::InvalidData => "no usable filesystem".to_string(),
        io::ErrorKind::InvalidInput => "malformed path".to_string(),
        io::ErrorKind::WriteZero => "volume full".to_string(),
        io::ErrorKind::UnexpectedEof => "unexpected end of volume".to_string(),
        _ => e.to_string(),
    };
    VfsError::Filesystem(msg)
}

// =============================================================================
// Byte-stream adapter
// =============================================================================

/// `fatfs` wants a byte-granular `Read + Write + Seek` stream; the card gives
/// whole sectors. This adapter bounces partial-sector accesses through a
/// 512-byte buffer.
pub(crate) struct SectorStream {
    dev: SharedBlockDevice,
    pos: u64,
}

impl SectorStream {
    pub(crate) fn new(dev: SharedBlockDevice) -> Self {
        Self { dev, pos: 0 }
    }

    fn byte_len(&self) -> u64 {
        self.dev.borrow().sector_count() * SECTOR_SIZE as u64
    }
}

impl Read for SectorStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.byte_len();
        if self.pos >= len {
            return Ok(0);
        }
        let want = buf.len().min((len - self.pos) as usize);
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < want {
            let sector = self.pos / SECTOR_SIZE as u64;
            let within = (self.pos % SECTOR_SIZE as u64) as usize;
            self.dev
                .borrow_mut()
                .read_sector(sector, &mut sector_buf)
                .map_err(io::Error::other)?;
            let n = (want - done).min(SECTOR_SIZE - within);
            buf[done..done + n].copy_from_slice(&sector_buf[within..within + n]);
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }
}

impl Write for SectorStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = self.byte_len();
        if self.pos >= len {
            return Ok(0);
        }
        let want = buf.len().min((len - self.pos) as usize);
        let mut done = 0;
        let mut sector_buf = [0u8; SECTOR_SIZE];
        while done < want {
            let sector = self.pos / SECTOR_SIZE as u64;
            let within = (self.pos % SECTOR_SIZE as u64) as usize;
            let n = (want - done).min(SECTOR_SIZE - within);
            // Partial sectors are read-modify-write.
            if within != 0 || n != SECTOR_SIZE {
                self.dev
                    .borrow_mut()
                    .read_sector(sector, &mut sector_buf)
                    .map_err(io::Error::other)?;
            }
            sector_buf[within..within + n].copy_from_slice(&buf[done..done + n]);
            self.dev
                .borrow_mut()
                .write_sector(sector, &sector_buf)
                .map_err(io::Error::other)?;
            done += n;
            self.pos += n as u64;
        }
        Ok(done)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SectorStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.byte_len() as i64 + d,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of device",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

// =============================================================================
// Backend
// =============================================================================

/// FAT volume over the card, mounted on demand.
pub(crate) struct SdBackend {
    dev: Option<SharedBlockDevice>,
    fs: Option<FileSystem<SectorStream>>,
}

impl SdBackend {
    /// A backend with no card; every operation reports the absence.
    pub(crate) fn empty() -> Self {
        Self { dev: None, fs: None }
    }

    pub(crate) fn new(dev: Box<dyn BlockDevice>) -> Self {
        Self::with_shared(Rc::new(RefCell::new(dev)))
    }

    pub(crate) fn with_shared(dev: SharedBlockDevice) -> Self {
        Self {
            dev: Some(dev),
            fs: None,
        }
    }

    fn mount(&mut self) -> Result<&FileSystem<SectorStream>, VfsError> {
        if self.fs.is_none() {
            let dev = self.dev.as_ref().ok_or(VfsError::NoCard)?.clone();
            let fs = FileSystem::new(SectorStream::new(dev), FsOptions::new()).map_err(fs_err)?;
            info!("sd: mounted FAT volume");
            self.fs = Some(fs);
        }
        self.fs.as_ref().ok_or(VfsError::NoCard)
    }

    /// Flush and drop the mounted volume. The card stays attached, so the
    /// next operation mounts again.
    pub(crate) fn unmount(&mut self) -> Result<(), VfsError> {
        if let Some(fs) = self.fs.take() {
            debug!("sd: unmounting");
            fs.unmount().map_err(fs_err)?;
        }
        Ok(())
    }

    pub(crate) fn open(&mut self, subpath: &str, mode: OpenMode) -> Result<SdHandle, VfsError> {
        let fs = self.mount()?;
        let root = fs.root_dir();
        match mode {
            OpenMode::Read => {
                root.open_file(subpath).map_err(fs_err)?;
            }
            OpenMode::Write => {
                // Create-or-replace.
                let mut file = root.create_file(subpath).map_err(fs_err)?;
                file.truncate().map_err(fs_err)?;
            }
        }
        Ok(SdHandle {
            path: subpath.to_string(),
        })
    }

    pub(crate) fn read(
        &mut self,
        handle: &SdHandle,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, VfsError> {
        let fs = self.mount()?;
        let mut file = fs.root_dir().open_file(&handle.path).map_err(fs_err)?;
        let len = file.seek(SeekFrom::End(0)).map_err(fs_err)?;
        if offset >= len {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(offset)).map_err(fs_err)?;
        let want = buf.len().min((len - offset) as usize);
        let mut done = 0;
        while done < want {
            let n = file.read(&mut buf[done..want]).map_err(fs_err)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    pub(crate) fn write(
        &mut self,
        handle: &SdHandle,
        offset: u64,
        buf: &[u8],
    ) -> Result<usize, VfsError> {
        let fs = self.mount()?;
        let mut file = fs.root_dir().open_file(&handle.path).map_err(fs_err)?;
        let len = file.seek(SeekFrom::End(0)).map_err(fs_err)?;
        // FAT files cannot be sparse; past-end writes land at the end.
        file.seek(SeekFrom::Start(offset.min(len))).map_err(fs_err)?;
        let mut done = 0;
        while done < buf.len() {
            let n = file.write(&buf[done..]).map_err(fs_err)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        file.flush().map_err(fs_err)?;
        Ok(done)
    }

    pub(crate) fn info(&mut self, handle: &SdHandle) -> Result<(u64, u64), VfsError> {
        let fs = self.mount()?;
        let mut file = fs.root_dir().open_file(&handle.path).map_err(fs_err)?;
        let len = file.seek(SeekFrom::End(0)).map_err(fs_err)?;
        Ok((0, len))
    }

    pub(crate) fn enumerate(
        &mut self,
        subpath: &str,
        visit: &mut dyn FnMut(&str, bool, u64),
    ) -> Result<(), VfsError> {
        let fs = self.mount()?;
        let root = fs.root_dir();
        let dir = if subpath.is_empty() || subpath == "/" {
            root
        } else {
            root.open_dir(subpath).map_err(fs_err)?
        };
        for entry in dir.iter() {
            let entry = entry.map_err(fs_err)?;
            visit(&entry.file_name(), entry.is_dir(), entry.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamDisk;

    /// A freshly formatted 1 MiB card image.
    fn formatted_card() -> SharedBlockDevice {
        let _ = env_logger::builder().is_test(true).try_init();
        let dev: SharedBlockDevice = Rc::new(RefCell::new(Box::new(RamDisk::new(2048))));
        fatfs::format_volume(
            &mut SectorStream::new(dev.clone()),
            fatfs::FormatVolumeOptions::new(),
        )
        .unwrap();
        dev
    }

    #[test]
    fn write_then_read_round_trip() {
        let mut sd = SdBackend::with_shared(formatted_card());

        let handle = sd.open("hello.txt", OpenMode::Write).unwrap();
        assert_eq!(sd.write(&handle, 0, b"hello card").unwrap(), 10);
        assert_eq!(sd.info(&handle).unwrap(), (0, 10));

        let handle = sd.open("hello.txt", OpenMode::Read).unwrap();
        let mut buf = [0u8; 32];
        assert_eq!(sd.read(&handle, 0, &mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"hello card");

        // Clamped, not an error.
        assert_eq!(sd.read(&handle, 10, &mut buf).unwrap(), 0);
        assert_eq!(sd.read(&handle, 6, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"card");
    }

    #[test]
    fn write_mode_replaces_existing_contents() {
        let mut sd = SdBackend::with_shared(formatted_card());

        let handle = sd.open("f.bin", OpenMode::Write).unwrap();
        sd.write(&handle, 0, &[0x55u8; 600]).unwrap();

        let handle = sd.open("f.bin", OpenMode::Write).unwrap();
        sd.write(&handle, 0, b"tiny").unwrap();
        assert_eq!(sd.info(&handle).unwrap(), (0, 4));
    }

    #[test]
    fn enumerate_lists_root_entries() {
        let mut sd = SdBackend::with_shared(formatted_card());
        let handle = sd.open("a.txt", OpenMode::Write).unwrap();
        sd.write(&handle, 0, b"aaa").unwrap();

        let mut seen = Vec::new();
        sd.enumerate("/", &mut |name, is_dir, size| {
            seen.push((name.to_string(), is_dir, size));
        })
        .unwrap();
        assert!(seen.contains(&("a.txt".to_string(), false, 3)));
    }

    #[test]
    fn unmount_then_remount_preserves_data() {
        let mut sd = SdBackend::with_shared(formatted_card());
        let handle = sd.open("keep.bin", OpenMode::Write).unwrap();
        sd.write(&handle, 0, b"persisted").unwrap();

        sd.unmount().unwrap();

        // Next access mounts again from the same card.
        let handle = sd.open("keep.bin", OpenMode::Read).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(sd.read(&handle, 0, &mut buf).unwrap(), 9);
        assert_eq!(&buf[..9], b"persisted");
    }

    #[test]
    fn missing_card_is_reported() {
        let mut sd = SdBackend::empty();
        assert!(matches!(
            sd.open("x", OpenMode::Read),
            Err(VfsError::NoCard)
        ));
    }

    #[test]
    fn missing_file_reports_filesystem_error() {
        let mut sd = SdBackend::with_shared(formatted_card());
        assert!(matches!(
            sd.open("absent.txt", OpenMode::Read),
            Err(VfsError::Filesystem(_))
        ));
    }
}
