// Core modules: mapped windows, line cursors, the barrier queue and per-file readers.
pub mod cursor;
pub mod error;
pub mod probe;
pub mod queue;
pub mod reader;
pub mod record;
pub mod window;
