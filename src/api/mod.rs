//! Purpose: Define the public Rust API boundary for tickmerge.
//! Exports: Core types and operations needed by the CLI and integration tests.
//! Role: Public, additive-only surface over the core modules plus the epoch merge driver.
//! Invariants: Readers, the queue and cursors are reached through this module in callers.

mod merge;

pub use crate::core::cursor::{Durability, LineBounds, LineCursor, LineView, Lines};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::probe::{
    CHUNK_RESERVE, CapabilityProbe, FALLBACK_CHUNK_SIZE, SystemProbe, default_chunk_size,
    max_memory_per_thread,
};
pub use crate::core::queue::{BarrierQueue, EpochBatch, EpochTicket, ProducerRegistration, QueueConsumer};
pub use crate::core::reader::{FileReader, ReaderConfig, ReaderOutcome};
pub use crate::core::record::{BucketKey, HourOfDay, MinuteOfDay, Record, symbol_from_path};
pub use crate::core::window::{MappedWindow, OpenMode};
pub use merge::{EpochMerger, EpochSink, LineSink, MergeSummary};
