//! Write-ahead log: record codec, LSN allocation, segmented append, replay.
//!
//! Every change to the database is serialized into a [`record::LogRecord`],
//! appended through the [`manager::LogManager`] and, for commits, forced to
//! stable storage before the caller observes success. On restart the
//! [`reader`] module replays every surviving record so recovery can repair
//! the page file.

pub mod lsn;
pub mod manager;
pub mod reader;
pub mod record;
