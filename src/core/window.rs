// Page-aligned memory mapping of one file region, with forward remap and write growth.
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::{Mmap, MmapMut, MmapOptions};
use tracing::debug;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OpenMode {
    #[default]
    ReadOnly,
    /// Accepted for compatibility; maps read+write exactly like `ReadWrite`.
    WriteOnly,
    ReadWrite,
}

impl OpenMode {
    pub fn allows_write(self) -> bool {
        matches!(self, OpenMode::WriteOnly | OpenMode::ReadWrite)
    }
}

enum Mapping {
    Read(Mmap),
    Write(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::Read(mmap) => mmap,
            Mapping::Write(mmap) => mmap,
        }
    }
}

/// Owns the file handle and at most one live mapping of it.
///
/// Views handed out by [`MappedWindow::bytes`] borrow the window, so every
/// operation that replaces the mapping (which needs `&mut self`) ends them.
pub struct MappedWindow {
    path: PathBuf,
    file: File,
    mode: OpenMode,
    mapping: Option<Mapping>,
    map_offset: u64,
    mapped_len: usize,
    file_len: u64,
    locked: bool,
}

impl MappedWindow {
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let mut options = OpenOptions::new();
        options.read(true);
        if mode.allows_write() {
            options.write(true).create(true).truncate(false);
        }
        let file = options
            .open(&path)
            .map_err(|err| Error::new(ErrorKind::OpenFailed).with_path(&path).with_source(err))?;

        let locked = mode.allows_write();
        if locked {
            FileExt::try_lock_exclusive(&file).map_err(|err| {
                Error::new(ErrorKind::OpenFailed)
                    .with_message("file is locked for writing")
                    .with_hint(lock_error_hint(&err))
                    .with_path(&path)
                    .with_source(err)
            })?;
        }

        let file_len = file
            .metadata()
            .map(|meta| meta.len())
            .map_err(|err| Error::new(ErrorKind::StatFailed).with_path(&path).with_source(err))?;

        Ok(Self {
            path,
            file,
            mode,
            mapping: None,
            map_offset: 0,
            mapped_len: 0,
            file_len,
            locked,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    pub fn map_offset(&self) -> u64 {
        self.map_offset
    }

    pub fn mapped_len(&self) -> usize {
        self.mapped_len
    }

    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.mapping, Some(Mapping::Write(_)))
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.mapping {
            Some(mapping) => mapping.bytes(),
            None => &[],
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self.mapping.as_mut() {
            Some(Mapping::Write(mmap)) => Some(&mut mmap[..]),
            _ => None,
        }
    }

    /// Maps a read-only window starting at the page boundary at or below `offset`.
    ///
    /// Returns the distance from the aligned start to `offset`, which is where
    /// the caller's logical position begins inside the new mapping.
    pub fn map_range(&mut self, offset: u64, length: usize) -> Result<usize, Error> {
        self.unmap();
        if offset >= self.file_len {
            return Err(Error::new(ErrorKind::InvalidOffset)
                .with_message("offset is at or beyond end of file")
                .with_path(&self.path)
                .with_offset(offset));
        }

        let page = page_size()?;
        let aligned = align_down(offset, page);
        let delta = usize::try_from(offset - aligned).map_err(|_| {
            Error::new(ErrorKind::MapFailed).with_message("page delta overflows usize")
        })?;
        let available = self.file_len - offset;
        let effective = usize::try_from(available.min(length as u64)).unwrap_or(length);

        self.map_offset = aligned;
        if effective == 0 {
            return Ok(0);
        }

        let mapped_len = delta + effective;
        let mmap = unsafe {
            MmapOptions::new()
                .offset(aligned)
                .len(mapped_len)
                .map(&self.file)
                .map_err(|err| {
                    Error::new(ErrorKind::MapFailed)
                        .with_path(&self.path)
                        .with_offset(aligned)
                        .with_source(err)
                })?
        };
        debug!(
            path = %self.path.display(),
            offset,
            aligned,
            mapped_len,
            file_len = self.file_len,
            "mapped window"
        );
        self.mapping = Some(Mapping::Read(mmap));
        self.mapped_len = mapped_len;
        Ok(delta)
    }

    /// Replaces the current read window with the one starting at `next_offset`,
    /// the first byte the caller has not consumed yet.
    pub fn remap_forward(&mut self, next_offset: u64, desired_len: usize) -> Result<usize, Error> {
        debug!(
            path = %self.path.display(),
            from = self.map_offset,
            next_offset,
            desired_len,
            "advancing window"
        );
        self.map_range(next_offset, desired_len)
    }

    /// Maps the whole file from offset zero, writable when the mode allows it.
    /// An empty file leaves the window unmapped.
    pub fn map_full(&mut self) -> Result<(), Error> {
        self.unmap();
        self.map_offset = 0;
        if self.file_len == 0 {
            return Ok(());
        }

        let len = usize::try_from(self.file_len).map_err(|_| {
            Error::new(ErrorKind::MapFailed)
                .with_message("file too large to map")
                .with_path(&self.path)
        })?;
        let map_err = |err: io::Error| {
            Error::new(ErrorKind::MapFailed)
                .with_path(&self.path)
                .with_source(err)
        };
        let mapping = if self.mode.allows_write() {
            Mapping::Write(unsafe { MmapOptions::new().len(len).map_mut(&self.file) }.map_err(map_err)?)
        } else {
            Mapping::Read(unsafe { MmapOptions::new().len(len).map(&self.file) }.map_err(map_err)?)
        };
        debug!(path = %self.path.display(), len, "mapped full file");
        self.mapping = Some(mapping);
        self.mapped_len = len;
        Ok(())
    }

    /// Grows a write mapping so it spans at least `required_len` bytes.
    ///
    /// The size doubles until it fits (an unmapped window starts at exactly
    /// `required_len`). The file is extended before it is remapped, so the
    /// mapping never reaches past the end of the file.
    pub fn grow(&mut self, required_len: usize) -> Result<(), Error> {
        if !self.mode.allows_write() {
            return Err(Error::new(ErrorKind::WriteError)
                .with_message("window is read-only")
                .with_path(&self.path));
        }
        let mut new_len = self.mapped_len.saturating_mul(2);
        if new_len == 0 {
            new_len = required_len;
        }
        while new_len < required_len {
            new_len = new_len.saturating_mul(2);
        }

        debug!(
            path = %self.path.display(),
            from = self.mapped_len,
            to = new_len,
            required_len,
            "growing write window"
        );
        self.file.set_len(new_len as u64).map_err(|err| {
            Error::new(ErrorKind::WriteError)
                .with_message("failed to extend file")
                .with_path(&self.path)
                .with_source(err)
        })?;
        self.file_len = new_len as u64;
        self.map_full()
    }

    pub fn flush_range(&self, start: usize, len: usize) -> Result<(), Error> {
        match &self.mapping {
            Some(Mapping::Write(mmap)) => mmap.flush_range(start, len).map_err(|err| {
                Error::new(ErrorKind::WriteError)
                    .with_path(&self.path)
                    .with_offset(self.map_offset + start as u64)
                    .with_source(err)
            }),
            _ => Ok(()),
        }
    }

    pub fn flush(&self) -> Result<(), Error> {
        match &self.mapping {
            Some(Mapping::Write(mmap)) => mmap.flush().map_err(|err| {
                Error::new(ErrorKind::WriteError)
                    .with_path(&self.path)
                    .with_source(err)
            }),
            _ => Ok(()),
        }
    }

    /// Unmaps and cuts the file down to `len` bytes.
    pub fn truncate(&mut self, len: u64) -> Result<(), Error> {
        self.unmap();
        self.file.set_len(len).map_err(|err| {
            Error::new(ErrorKind::WriteError)
                .with_message("failed to truncate file")
                .with_path(&self.path)
                .with_source(err)
        })?;
        self.file_len = len;
        Ok(())
    }

    pub fn unmap(&mut self) {
        if self.mapping.take().is_some() {
            debug!(path = %self.path.display(), offset = self.map_offset, len = self.mapped_len, "unmapped window");
        }
        self.mapped_len = 0;
    }
}

impl Drop for MappedWindow {
    fn drop(&mut self) {
        self.unmap();
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

pub fn page_size() -> Result<u64, Error> {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        return Err(Error::new(ErrorKind::MapFailed).with_message("page size unavailable"));
    }
    Ok(size as u64)
}

pub fn align_down(offset: u64, page: u64) -> u64 {
    (offset / page) * page
}

fn lock_error_hint(err: &io::Error) -> &'static str {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return "permission denied while locking the file";
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => "another writer holds the file",
        io::ErrorKind::PermissionDenied => "permission denied while locking the file",
        _ => "file lock failed",
    }
}

#[cfg(test)]
mod tests {
    use super::{MappedWindow, OpenMode, align_down, page_size};
    use crate::core::error::ErrorKind;

    #[test]
    fn align_down_rounds_to_page_boundary() {
        assert_eq!(align_down(0, 4096), 0);
        assert_eq!(align_down(4095, 4096), 0);
        assert_eq!(align_down(4096, 4096), 4096);
        assert_eq!(align_down(10_000, 4096), 8192);
    }

    #[test]
    fn map_range_reports_delta_from_aligned_start() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ticks.AAPL");
        let page = page_size().expect("page") as usize;
        std::fs::write(&path, vec![b'x'; page * 2 + 100]).expect("write");

        let mut window = MappedWindow::open(&path, OpenMode::ReadOnly).expect("open");
        let delta = window.map_range(page as u64 + 10, 50).expect("map");
        assert_eq!(delta, 10);
        assert_eq!(window.map_offset(), page as u64);
        assert_eq!(window.mapped_len(), 60);
        assert_eq!(window.bytes().len(), 60);
    }

    #[test]
    fn map_range_clamps_to_end_of_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.txt");
        std::fs::write(&path, b"0123456789").expect("write");

        let mut window = MappedWindow::open(&path, OpenMode::ReadOnly).expect("open");
        let delta = window.map_range(4, 1024).expect("map");
        assert_eq!(delta, 4);
        assert_eq!(&window.bytes()[delta..], b"456789");
    }

    #[test]
    fn map_range_rejects_offset_past_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.txt");
        std::fs::write(&path, b"abc").expect("write");

        let mut window = MappedWindow::open(&path, OpenMode::ReadOnly).expect("open");
        let err = window.map_range(3, 10).expect_err("offset at end");
        assert_eq!(err.kind(), ErrorKind::InvalidOffset);
        assert_eq!(err.offset(), Some(3));
        assert!(!window.is_mapped());
    }

    #[test]
    fn grow_doubles_until_large_enough() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("out.txt");

        let mut window = MappedWindow::open(&path, OpenMode::ReadWrite).expect("open");
        assert!(!window.is_mapped());
        window.grow(5).expect("initial");
        assert_eq!(window.mapped_len(), 5);
        window.grow(6).expect("double");
        assert_eq!(window.mapped_len(), 10);
        window.grow(35).expect("double twice");
        assert_eq!(window.mapped_len(), 40);
        assert_eq!(window.file_len(), 40);
        assert!(window.is_writable());
        let meta = std::fs::metadata(&path).expect("meta");
        assert_eq!(meta.len(), 40);
    }

    #[test]
    fn read_only_window_cannot_grow() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("in.txt");
        std::fs::write(&path, b"line\n").expect("write");

        let mut window = MappedWindow::open(&path, OpenMode::ReadOnly).expect("open");
        let err = window.grow(64).expect_err("read only");
        assert_eq!(err.kind(), ErrorKind::WriteError);
    }

    #[test]
    fn second_writer_is_refused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locked.txt");

        let _first = MappedWindow::open(&path, OpenMode::ReadWrite).expect("first");
        let err = match MappedWindow::open(&path, OpenMode::WriteOnly) {
            Ok(_) => panic!("expected lock contention"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::OpenFailed);
        assert!(err.hint().is_some());
    }

    #[test]
    fn lock_errors_map_to_hints() {
        let err = std::io::Error::from_raw_os_error(libc::EWOULDBLOCK);
        assert_eq!(super::lock_error_hint(&err), "another writer holds the file");

        let err = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(
            super::lock_error_hint(&err),
            "permission denied while locking the file"
        );

        let err = std::io::Error::from_raw_os_error(libc::EBADF);
        assert_eq!(super::lock_error_hint(&err), "file lock failed");
    }
}
