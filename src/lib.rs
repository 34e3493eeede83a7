//! Purpose: Library crate behind the `tickmerge` CLI and its tests.
//! Exports: `core` (windows, cursors, queue, readers, errors), `api` (merge driver), `notice`.
//! Role: Chunked line streaming plus epoch-barrier fan-in for time-bucketed merges.
//! Invariants: The library never installs a tracing subscriber; binaries do.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
pub mod notice;
