// Line extraction over a mapped window: chunked reads with stitched remaps, append-growth writes.
use std::borrow::Cow;
use std::ops::Deref;
use std::path::Path;

use bstr::{BStr, BString, ByteSlice};
use tracing::{debug, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::window::{MappedWindow, OpenMode};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Durability {
    /// Flush each written line before `write_line` returns.
    #[default]
    Flush,
    /// Leave flushing to `flush`/`finish`.
    Deferred,
}

/// Position of one line inside the mapping generation that produced it.
///
/// `prefix_len` counts bytes stitched from earlier windows; they live in the
/// cursor until the next read call. The stitch holds at most one window of
/// bytes; `overflow` counts the bytes of a longer line that were scanned but
/// not kept.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct LineBounds {
    pub start: usize,
    pub end: usize,
    pub prefix_len: usize,
    pub overflow: usize,
    pub generation: u64,
}

impl LineBounds {
    /// Full length of the line, including any overflow.
    pub fn len(&self) -> usize {
        self.prefix_len + self.overflow + (self.end - self.start)
    }

    /// The line did not fit in one window and cannot be viewed.
    pub fn is_oversize(&self) -> bool {
        self.overflow > 0
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stitched(&self) -> bool {
        self.prefix_len > 0
    }
}

/// A line borrowed from the cursor. Zero-copy unless it crossed a window boundary.
#[derive(Debug)]
pub struct LineView<'a> {
    bytes: Cow<'a, [u8]>,
    generation: u64,
}

impl LineView<'_> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn is_zero_copy(&self) -> bool {
        matches!(self.bytes, Cow::Borrowed(_))
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn to_bstring(&self) -> BString {
        BString::from(self.bytes.as_ref())
    }
}

impl Deref for LineView<'_> {
    type Target = BStr;

    fn deref(&self) -> &BStr {
        self.bytes.as_bstr()
    }
}

pub struct LineCursor {
    window: MappedWindow,
    position: usize,
    window_start: usize,
    window_len: usize,
    chunked: bool,
    generation: u64,
    logical_len: u64,
    carry: Vec<u8>,
    overflow: usize,
    durability: Durability,
    valid: bool,
    finished: bool,
    last_error: Option<ErrorKind>,
}

impl LineCursor {
    /// Opens `path` and maps the whole file (nothing for an empty file).
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self, Error> {
        let mut window = MappedWindow::open(path, mode)?;
        window.map_full()?;
        let window_len = window.mapped_len();
        Ok(Self::from_window(window, 0, window_len, false))
    }

    /// Opens `path` with a read window of `len` bytes starting at `offset`.
    ///
    /// Reads with remap enabled slide the window forward `len` bytes at a
    /// time. Chunked cursors never write.
    pub fn open_window(
        path: impl AsRef<Path>,
        offset: u64,
        len: usize,
        mode: OpenMode,
    ) -> Result<Self, Error> {
        let mut window = MappedWindow::open(path, mode)?;
        let delta = if offset == 0 && window.file_len() == 0 {
            0
        } else {
            window.map_range(offset, len)?
        };
        Ok(Self::from_window(window, delta, len, true))
    }

    fn from_window(window: MappedWindow, start: usize, window_len: usize, chunked: bool) -> Self {
        let logical_len = window.file_len();
        Self {
            window,
            position: start,
            window_start: start,
            window_len,
            chunked,
            generation: 0,
            logical_len,
            carry: Vec::new(),
            overflow: 0,
            durability: Durability::default(),
            valid: true,
            finished: false,
            last_error: None,
        }
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }

    pub fn set_durability(&mut self, durability: Durability) {
        self.durability = durability;
    }

    pub fn path(&self) -> &Path {
        self.window.path()
    }

    pub fn mode(&self) -> OpenMode {
        self.window.mode()
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.last_error
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn position(&self) -> Option<usize> {
        self.valid.then_some(self.position)
    }

    pub fn mapped_len(&self) -> Option<usize> {
        self.valid.then(|| self.window.mapped_len())
    }

    pub fn map_offset(&self) -> Option<u64> {
        self.valid.then(|| self.window.map_offset())
    }

    /// Length of the file content, excluding growth padding not yet written.
    pub fn file_len(&self) -> Option<u64> {
        self.valid.then_some(self.logical_len)
    }

    pub fn is_eof(&self) -> bool {
        !self.valid || (self.position >= self.readable_end() && !self.can_remap())
    }

    fn readable_end(&self) -> usize {
        let logical = self.logical_len.saturating_sub(self.window.map_offset());
        let mapped = self.window.mapped_len();
        usize::try_from(logical).map_or(mapped, |logical| logical.min(mapped))
    }

    fn can_remap(&self) -> bool {
        self.chunked
            && self.window_len > 0
            && self.window.map_offset() + (self.readable_end() as u64) < self.window.file_len()
    }

    fn fail(&mut self, err: Error) -> Error {
        let kind = err.kind();
        if matches!(kind, ErrorKind::MapFailed | ErrorKind::StatFailed) {
            warn!(path = %self.window.path().display(), error = %err, "cursor invalidated");
            self.valid = false;
        }
        self.last_error = Some(kind);
        err
    }

    fn advance_window(&mut self) -> Result<(), Error> {
        let next_offset = self.window.map_offset() + self.position as u64;
        match self.window.remap_forward(next_offset, self.window_len) {
            Ok(delta) => {
                self.position = delta;
                self.window_start = delta;
                self.generation += 1;
                Ok(())
            }
            Err(err) => {
                self.valid = false;
                Err(self.fail(err))
            }
        }
    }

    /// Finds the next line and moves the position past its terminator.
    ///
    /// With `allow_remap`, reaching the end of the window maps the next one;
    /// a line that crosses the boundary is stitched from both windows.
    pub fn next_line_bounds(&mut self, allow_remap: bool) -> Result<LineBounds, Error> {
        if !self.valid {
            let err = Error::new(ErrorKind::NotMapped).with_path(self.window.path());
            return Err(self.fail(err));
        }
        self.carry.clear();
        self.overflow = 0;
        if !self.window.is_mapped() && !(allow_remap && self.can_remap()) {
            let err = Error::new(ErrorKind::NotMapped)
                .with_message("no bytes are mapped")
                .with_path(self.window.path());
            return Err(self.fail(err));
        }

        loop {
            let end = self.readable_end();
            if self.position >= end {
                if allow_remap && self.can_remap() {
                    self.advance_window()?;
                    continue;
                }
                if !self.carry.is_empty() {
                    return Ok(self.bounds(self.position, self.position));
                }
                return Err(self.fail(Error::new(ErrorKind::EndOfFile)));
            }

            let start = self.position;
            let data = &self.window.bytes()[start..end];
            match data.find_byte(b'\n') {
                Some(idx) => {
                    self.position = start + idx + 1;
                    return Ok(self.bounds(start, start + idx));
                }
                None if allow_remap && self.can_remap() => {
                    let keep = data.len().min(self.window_len.saturating_sub(self.carry.len()));
                    self.carry.extend_from_slice(&data[..keep]);
                    self.overflow += data.len() - keep;
                    self.position = end;
                }
                None => {
                    self.position = end;
                    return Ok(self.bounds(start, end));
                }
            }
        }
    }

    fn bounds(&mut self, start: usize, end: usize) -> LineBounds {
        self.last_error = None;
        LineBounds {
            start,
            end,
            prefix_len: self.carry.len(),
            overflow: self.overflow,
            generation: self.generation,
        }
    }

    /// Resolves bounds from the latest `next_line_bounds` call into a view.
    pub fn view(&self, bounds: LineBounds) -> Result<LineView<'_>, Error> {
        if bounds.generation != self.generation
            || bounds.prefix_len != self.carry.len()
            || bounds.overflow != self.overflow
            || bounds.start > bounds.end
            || bounds.end > self.window.mapped_len()
        {
            return Err(Error::new(ErrorKind::InvalidPosition)
                .with_message("line bounds belong to an earlier mapping")
                .with_path(self.window.path()));
        }
        if bounds.is_oversize() {
            return Err(Error::new(ErrorKind::InvalidPosition)
                .with_message("line is longer than the read window")
                .with_path(self.window.path()));
        }
        let tail = &self.window.bytes()[bounds.start..bounds.end];
        let bytes = if bounds.is_stitched() {
            let mut line = Vec::with_capacity(bounds.len());
            line.extend_from_slice(&self.carry);
            line.extend_from_slice(tail);
            Cow::Owned(line)
        } else {
            Cow::Borrowed(tail)
        };
        Ok(LineView {
            bytes,
            generation: self.generation,
        })
    }

    pub fn read_line(&mut self, allow_remap: bool) -> Result<BString, Error> {
        let bounds = self.next_line_bounds(allow_remap)?;
        Ok(self.view(bounds)?.to_bstring())
    }

    /// Like `read_line` but borrows from the mapping; the view must be dropped
    /// before the cursor is used again.
    pub fn read_line_view(&mut self, allow_remap: bool) -> Result<LineView<'_>, Error> {
        let bounds = self.next_line_bounds(allow_remap)?;
        self.view(bounds)
    }

    /// Owned lines until end of file, remapping as needed.
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { cursor: self }
    }

    pub fn reset(&mut self) -> Result<(), Error> {
        if !self.valid {
            return Err(self.fail(Error::new(ErrorKind::NotMapped)));
        }
        self.position = self.window_start;
        self.carry.clear();
        self.overflow = 0;
        self.last_error = None;
        Ok(())
    }

    pub fn set_position(&mut self, position: usize) -> Result<(), Error> {
        if !self.valid {
            return Err(self.fail(Error::new(ErrorKind::NotMapped)));
        }
        if position > self.window.mapped_len() {
            let err = Error::new(ErrorKind::InvalidPosition)
                .with_message("position is outside the mapped window")
                .with_offset(position as u64);
            return Err(self.fail(err));
        }
        self.position = position;
        self.carry.clear();
        self.overflow = 0;
        self.last_error = None;
        Ok(())
    }

    /// Writes `text` plus a terminator at the current position, growing the file as needed.
    ///
    /// Empty lines are rejected even though reads return them.
    pub fn write_line(&mut self, text: impl AsRef<[u8]>) -> Result<(), Error> {
        let text = text.as_ref();
        if !self.valid {
            let err = Error::new(ErrorKind::WriteError).with_message("cursor is not valid");
            return Err(self.fail(err));
        }
        if !self.window.mode().allows_write() || self.chunked {
            let err = Error::new(ErrorKind::WriteError)
                .with_message("cursor is read-only")
                .with_path(self.window.path());
            return Err(self.fail(err));
        }
        if text.is_empty() {
            let err = Error::new(ErrorKind::WriteError).with_message("empty lines cannot be written");
            return Err(self.fail(err));
        }

        let start = self.position;
        let required = start + text.len() + 1;
        if required > self.window.mapped_len() {
            if let Err(err) = self.window.grow(required) {
                if !self.window.is_mapped() && self.logical_len > 0 {
                    self.valid = false;
                }
                return Err(self.fail(err));
            }
            self.generation += 1;
        }

        let Some(buf) = self.window.bytes_mut() else {
            let err = Error::new(ErrorKind::NotMapped).with_message("write window is not mapped");
            return Err(self.fail(err));
        };
        buf[start..start + text.len()].copy_from_slice(text);
        buf[start + text.len()] = b'\n';
        self.position = required;
        self.logical_len = self.logical_len.max(required as u64);

        if self.durability == Durability::Flush {
            if let Err(err) = self.window.flush_range(start, text.len() + 1) {
                return Err(self.fail(err));
            }
        }
        self.last_error = None;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        match self.window.flush() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Flushes and trims the file to the bytes actually written.
    pub fn finish(mut self) -> Result<(), Error> {
        self.flush()?;
        self.trim_to_logical()?;
        self.finished = true;
        Ok(())
    }

    fn trim_to_logical(&mut self) -> Result<(), Error> {
        if self.chunked || !self.window.mode().allows_write() {
            return Ok(());
        }
        if self.window.file_len() > self.logical_len {
            debug!(
                path = %self.window.path().display(),
                from = self.window.file_len(),
                to = self.logical_len,
                "trimming growth padding"
            );
            self.window.truncate(self.logical_len)?;
        }
        Ok(())
    }
}

#[cfg(test)]
impl LineCursor {
    pub(crate) fn invalidate(&mut self) {
        self.valid = false;
    }

    pub(crate) fn carry_capacity(&self) -> usize {
        self.carry.capacity()
    }
}

impl Drop for LineCursor {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.trim_to_logical() {
            warn!(path = %self.window.path().display(), error = %err, "failed to trim file on drop");
        }
    }
}

pub struct Lines<'a> {
    cursor: &'a mut LineCursor,
}

impl Iterator for Lines<'_> {
    type Item = Result<BString, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.cursor.read_line(true) {
            Ok(line) => Some(Ok(line)),
            Err(err) if err.kind().is_end_of_file() => None,
            // A valid cursor reports NotMapped only when nothing was ever mapped.
            Err(err) if err.kind() == ErrorKind::NotMapped && self.cursor.is_valid() => None,
            Err(err) => Some(Err(err)),
        }
    }
}
