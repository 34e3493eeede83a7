// Fan-in record type and time-bucket key extraction.
use std::path::Path;
use std::sync::Arc;

use bstr::{BStr, BString, ByteSlice};

/// One input line tagged with its source symbol and time bucket.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub symbol: Arc<str>,
    pub payload: BString,
    pub bucket: u64,
}

impl Record {
    /// Leading timestamp field: the payload up to its first comma.
    pub fn timestamp(&self) -> &BStr {
        let bytes = self.payload.as_bytes();
        match bytes.find_byte(b',') {
            Some(idx) => bytes[..idx].as_bstr(),
            None => bytes.as_bstr(),
        }
    }
}

/// Maps a line to the time bucket its record belongs to.
///
/// Lines without a key are skipped by the reader.
pub trait BucketKey: Send + Sync {
    fn bucket(&self, line: &[u8]) -> Option<u64>;
}

impl<F> BucketKey for F
where
    F: Fn(&[u8]) -> Option<u64> + Send + Sync,
{
    fn bucket(&self, line: &[u8]) -> Option<u64> {
        self(line)
    }
}

/// Minimum line length carrying a full `YYYY-MM-DD HH:MM:SS` prefix.
pub const TIMESTAMP_PREFIX_LEN: usize = 19;

/// Hour of day from a `YYYY-MM-DD HH:MM:SS[.fff]` prefix.
#[derive(Clone, Copy, Debug, Default)]
pub struct HourOfDay;

impl BucketKey for HourOfDay {
    fn bucket(&self, line: &[u8]) -> Option<u64> {
        if line.len() < TIMESTAMP_PREFIX_LEN {
            return None;
        }
        two_digits(&line[11..13]).filter(|hour| *hour < 24)
    }
}

/// Minute of day (`hour * 60 + minute`), for finer epochs.
#[derive(Clone, Copy, Debug, Default)]
pub struct MinuteOfDay;

impl BucketKey for MinuteOfDay {
    fn bucket(&self, line: &[u8]) -> Option<u64> {
        let hour = HourOfDay.bucket(line)?;
        let minute = two_digits(&line[14..16]).filter(|minute| *minute < 60)?;
        Some(hour * 60 + minute)
    }
}

fn two_digits(bytes: &[u8]) -> Option<u64> {
    match bytes {
        [tens @ b'0'..=b'9', ones @ b'0'..=b'9'] => {
            Some(u64::from(tens - b'0') * 10 + u64::from(ones - b'0'))
        }
        _ => None,
    }
}

/// Symbol named by an input file: everything after the first `.` of the file
/// name (`ticks.AAPL` → `AAPL`), or the whole name when it has none.
pub fn symbol_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    match name.split_once('.') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => name,
    }
}
