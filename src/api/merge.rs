//! Purpose: Drive the consumer side of the fan-in, one closed epoch at a time.
//! Exports: `EpochMerger`, `EpochSink`, `LineSink`, `MergeSummary`.
//! Role: Orders each epoch by timestamp and hands it to a sink before releasing producers.
//! Invariants: Producers are released only after the sink has accepted the whole epoch.
//! Invariants: A sink failure drops the consumer, which aborts the queue and frees producers.

use std::fs::File;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, info};

use crate::core::cursor::{Durability, LineCursor};
use crate::core::error::{Error, ErrorKind};
use crate::core::queue::QueueConsumer;
use crate::core::record::Record;
use crate::core::window::OpenMode;

/// Receives each epoch's records, already sorted.
pub trait EpochSink {
    fn write_epoch(&mut self, epoch: u64, records: &[Record]) -> Result<(), Error>;
}

impl<F> EpochSink for F
where
    F: FnMut(u64, &[Record]) -> Result<(), Error>,
{
    fn write_epoch(&mut self, epoch: u64, records: &[Record]) -> Result<(), Error> {
        self(epoch, records)
    }
}

/// Writes `<symbol>,<payload>` lines through a write-mode cursor.
pub struct LineSink {
    cursor: LineCursor,
    lines: u64,
}

impl LineSink {
    /// Creates (or truncates) `path` and locks it for writing.
    pub fn create(path: impl AsRef<Path>, durability: Durability) -> Result<Self, Error> {
        let path = path.as_ref();
        File::create(path).map_err(|err| {
            Error::new(ErrorKind::OpenFailed)
                .with_message("failed to create output file")
                .with_path(path)
                .with_source(err)
        })?;
        let cursor = LineCursor::open(path, OpenMode::ReadWrite)?.with_durability(durability);
        Ok(Self { cursor, lines: 0 })
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Flushes and trims the output to the written lines.
    pub fn finish(self) -> Result<u64, Error> {
        let lines = self.lines;
        self.cursor.finish()?;
        Ok(lines)
    }
}

impl EpochSink for LineSink {
    fn write_epoch(&mut self, _epoch: u64, records: &[Record]) -> Result<(), Error> {
        let mut line = Vec::new();
        for record in records {
            line.clear();
            line.extend_from_slice(record.symbol.as_bytes());
            line.push(b',');
            line.extend_from_slice(&record.payload);
            self.cursor.write_line(&line)?;
            self.lines += 1;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MergeSummary {
    pub epochs: u64,
    pub records: u64,
}

pub struct EpochMerger {
    consumer: QueueConsumer<Record>,
}

impl EpochMerger {
    pub fn new(consumer: QueueConsumer<Record>) -> Self {
        Self { consumer }
    }

    /// Runs until every producer has deregistered and the queue is drained.
    pub fn run(mut self, sink: &mut impl EpochSink) -> Result<MergeSummary, Error> {
        let mut summary = MergeSummary::default();
        loop {
            let epoch = self.consumer.queue().epoch();
            let batch = self.consumer.drain_epoch();
            let mut records = batch.records;
            records.sort_by(|a, b| {
                a.timestamp()
                    .cmp(b.timestamp())
                    .then_with(|| a.symbol.cmp(&b.symbol))
            });

            if records.is_empty() {
                debug!(epoch, "empty epoch");
            } else {
                sink.write_epoch(epoch, &records)?;
                summary.epochs += 1;
                summary.records += records.len() as u64;
                info!(epoch, records = records.len(), "epoch merged");
            }

            if batch.closed {
                break;
            }
            self.consumer.reset_epoch();
        }
        Ok(summary)
    }
}
