use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Why a single log line could not be turned into a [`crate::Record`].
///
/// Never surfaced by [`crate::LogReader::read_new`]; undecodable lines are
/// skipped there.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("record `id` must be a string")]
    InvalidId,
}

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to read history log {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// A line starting at `offset` is longer than the reader's buffer limit.
    /// The next read skips it.
    #[error("line at byte {offset} exceeds the {limit}-byte line limit")]
    LineTooLong { offset: u64, limit: usize },
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("history watcher is already running")]
    AlreadyRunning,
    #[error("history watcher must be started inside a tokio runtime")]
    NoRuntime,
    #[error("history log path {} has no file name", .path.display())]
    InvalidPath { path: PathBuf },
    #[error("failed to watch directory {}: {source}", .dir.display())]
    Watch {
        dir: PathBuf,
        #[source]
        source: notify::Error,
    },
}
