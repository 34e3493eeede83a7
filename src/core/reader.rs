//! Purpose: Stream one input file into the shared barrier queue, one epoch per time bucket.
//! Exports: `FileReader`, `ReaderConfig`, `ReaderOutcome`.
//! Role: Producer side of the fan-in; one reader per input file, one thread per reader.
//! Invariants: A record is enqueued only after the epoch of the previous bucket was released.
//! Invariants: The reader deregisters from the queue on every exit path (EOF, stop, error).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::cursor::LineCursor;
use crate::core::error::{Error, ErrorKind};
use crate::core::probe::{SystemProbe, default_chunk_size};
use crate::core::queue::BarrierQueue;
use crate::core::record::{BucketKey, Record, symbol_from_path};
use crate::core::window::OpenMode;

#[derive(Clone, Debug)]
pub struct ReaderConfig {
    /// Window size in bytes; lines longer than this are skipped.
    pub chunk_size: usize,
    /// Overrides the symbol derived from the file name.
    pub symbol: Option<String>,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(&SystemProbe),
            symbol: None,
        }
    }
}

impl ReaderConfig {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ReaderOutcome {
    pub lines: u64,
    pub enqueued: u64,
    pub skipped_empty: u64,
    pub skipped_oversize: u64,
    pub skipped_unkeyed: u64,
    pub epochs: u64,
    pub stopped: bool,
}

pub struct FileReader<K> {
    id: usize,
    path: PathBuf,
    symbol: Arc<str>,
    chunk_size: usize,
    cursor: LineCursor,
    key: K,
}

impl<K: BucketKey> FileReader<K> {
    pub fn open(id: usize, path: impl AsRef<Path>, key: K, config: &ReaderConfig) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        if config.chunk_size == 0 {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("chunk size must be positive")
                .with_path(&path));
        }
        let cursor = LineCursor::open_window(&path, 0, config.chunk_size, OpenMode::ReadOnly)?;
        let symbol = config
            .symbol
            .clone()
            .unwrap_or_else(|| symbol_from_path(&path));
        debug!(id, path = %path.display(), symbol = %symbol, chunk_size = config.chunk_size, "reader opened");
        Ok(Self {
            id,
            path,
            symbol: Arc::from(symbol),
            chunk_size: config.chunk_size,
            cursor,
            key,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Reads the file to the end, or until `stop` is set or the queue is aborted.
    pub fn run(&mut self, queue: &BarrierQueue<Record>, stop: &AtomicBool) -> Result<ReaderOutcome, Error> {
        let _registration = queue.registration();
        let mut outcome = ReaderOutcome::default();
        let mut current_bucket = None;
        info!(id = self.id, symbol = %self.symbol, path = %self.path.display(), "reader started");

        loop {
            if stop.load(Ordering::Relaxed) || queue.is_aborted() {
                outcome.stopped = true;
                break;
            }

            let bounds = match self.cursor.next_line_bounds(true) {
                Ok(bounds) => bounds,
                Err(err) if err.kind().is_end_of_file() => break,
                Err(err) if err.kind() == ErrorKind::NotMapped && self.cursor.is_valid() => {
                    debug!(id = self.id, path = %self.path.display(), "input is empty");
                    break;
                }
                Err(err) => {
                    warn!(id = self.id, path = %self.path.display(), error = %err, "reader failed");
                    return Err(err);
                }
            };
            outcome.lines += 1;

            if bounds.is_empty() {
                debug!(id = self.id, line = outcome.lines, "skipping empty line");
                outcome.skipped_empty += 1;
                continue;
            }
            if bounds.is_oversize() || bounds.len() > self.chunk_size {
                warn!(
                    id = self.id,
                    line = outcome.lines,
                    len = bounds.len(),
                    chunk_size = self.chunk_size,
                    "skipping line longer than chunk size"
                );
                outcome.skipped_oversize += 1;
                continue;
            }

            let view = self.cursor.view(bounds)?;
            let Some(bucket) = self.key.bucket(view.as_bytes()) else {
                warn!(id = self.id, line = outcome.lines, "skipping line without bucket key");
                outcome.skipped_unkeyed += 1;
                continue;
            };
            let payload = view.to_bstring();

            if current_bucket.is_some_and(|current| current != bucket) {
                info!(id = self.id, symbol = %self.symbol, from = ?current_bucket, to = bucket, "bucket boundary; waiting for epoch");
                queue.finish_epoch();
                outcome.epochs += 1;
                if queue.is_aborted() {
                    outcome.stopped = true;
                    break;
                }
            }
            current_bucket = Some(bucket);

            queue.enqueue(Record {
                symbol: Arc::clone(&self.symbol),
                payload,
                bucket,
            });
            outcome.enqueued += 1;
        }

        info!(
            id = self.id,
            symbol = %self.symbol,
            lines = outcome.lines,
            enqueued = outcome.enqueued,
            epochs = outcome.epochs,
            stopped = outcome.stopped,
            "reader finished"
        );
        Ok(outcome)
    }
}

impl<K: BucketKey + 'static> FileReader<K> {
    /// Runs the reader on its own named thread.
    ///
    /// If the thread cannot be started the reader is deregistered before the
    /// error is returned.
    pub fn spawn(
        mut self,
        queue: Arc<BarrierQueue<Record>>,
        stop: Arc<AtomicBool>,
    ) -> Result<JoinHandle<Result<ReaderOutcome, Error>>, Error> {
        let fallback = Arc::clone(&queue);
        thread::Builder::new()
            .name(format!("reader-{}", self.id))
            .spawn(move || self.run(&queue, &stop))
            .map_err(|err| {
                fallback.deregister_producer();
                Error::new(ErrorKind::Internal)
                    .with_message("failed to spawn reader thread")
                    .with_source(err)
            })
    }
}
