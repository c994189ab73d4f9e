//! Incremental, deduplicating sync of a shared append-only history log.
//!
//! Several writers (this process, other processes, or a file-sync client
//! replicating another device's copy) append JSON lines to one file.
//! [`LogReader`] tails that file by byte offset and suppresses records whose
//! `id` it has already seen; [`ChangeWatcher`] drives the reader from OS
//! change notifications and hands each new batch to a callback.

pub mod codec;
pub mod error;
pub mod reader;
pub mod record;
pub mod telemetry;
pub mod watcher;
pub mod writer;

pub use error::{DecodeError, ReadError, WatchError};
pub use reader::LogReader;
pub use record::Record;
pub use watcher::{ChangeWatcher, WatchStats};
pub use writer::LogWriter;
