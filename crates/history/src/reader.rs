//! Incremental reader over the shared history log.
//!
//! The reader remembers a byte offset and every non-empty record id it has
//! delivered.  Each [`LogReader::read_new`] call picks up at the offset,
//! decodes complete lines, drops duplicates and corrupt lines, and advances
//! the offset by exactly the bytes it consumed.
//!
//! Known ids are never evicted, so memory grows with the number of distinct
//! ids ever seen in the log.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use histsync_config::DEFAULT_MAX_LINE_BYTES;
use tracing::{debug, warn};

use crate::codec;
use crate::error::ReadError;
use crate::record::Record;

#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    offset: u64,
    known_ids: HashSet<String>,
    max_line_bytes: usize,
    /// Start of a line that overflowed `max_line_bytes` during the previous
    /// read.  The next read skips that line instead of failing again.
    oversized_at: Option<u64>,
}

impl LogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_max_line_bytes(path, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_line_bytes(path: impl Into<PathBuf>, max_line_bytes: usize) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            known_ids: HashSet::new(),
            max_line_bytes: max_line_bytes.max(1),
            oversized_at: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Byte position up to which the log has been consumed.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Snapshot of every id seen or marked so far.
    pub fn known_ids(&self) -> HashSet<String> {
        self.known_ids.clone()
    }

    /// Treat `id` as already delivered.  Used by a process that appends a
    /// record itself and does not want it echoed back.  Empty ids are ignored.
    pub fn mark_known(&mut self, id: impl Into<String>) {
        let id = id.into();
        if !id.is_empty() {
            self.known_ids.insert(id);
        }
    }

    /// Return records appended since the previous call, in file order.
    ///
    /// A missing file yields no records.  If the file shrank below the stored
    /// offset it was truncated or replaced, and scanning restarts at byte 0
    /// with known ids retained.  Only a trailing line that is still missing
    /// its `\n` is left unconsumed.
    ///
    /// On error nothing from this call is committed: offset and known ids
    /// are unchanged, so a retry re-reads the same bytes.
    pub fn read_new(&mut self) -> Result<Vec<Record>, ReadError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(self.io_error(err)),
        };

        let size = file.metadata().map_err(|err| self.io_error(err))?.len();
        if size < self.offset {
            warn!(
                path = %self.path.display(),
                previous_offset = self.offset,
                current_size = size,
                "history log truncated or replaced; rescanning from start"
            );
            self.offset = 0;
            self.oversized_at = None;
        }
        if size == self.offset {
            return Ok(Vec::new());
        }

        let mut reader = BufReader::new(file);
        if self.offset > 0 {
            reader
                .seek(SeekFrom::Start(self.offset))
                .map_err(|err| self.io_error(err))?;
        }

        let mut scan = Scan::default();
        let mut position = self.offset;
        let mut skip_at = self.oversized_at;
        let mut line = Vec::new();

        loop {
            if skip_at == Some(position) {
                match skip_line(&mut reader).map_err(|err| self.io_error(err))? {
                    Some(skipped) => {
                        warn!(
                            path = %self.path.display(),
                            offset = position,
                            bytes = skipped,
                            "skipping oversized history line"
                        );
                        position += skipped;
                        skip_at = None;
                        continue;
                    }
                    // Still unterminated; wait for the writer to finish it.
                    None => break,
                }
            }

            line.clear();
            let limit = self.max_line_bytes as u64 + 1;
            let read = (&mut reader)
                .take(limit)
                .read_until(b'\n', &mut line)
                .map_err(|err| self.io_error(err))?;
            if read == 0 {
                break;
            }

            if line.last() != Some(&b'\n') {
                if line.len() > self.max_line_bytes {
                    self.oversized_at = Some(position);
                    return Err(ReadError::LineTooLong {
                        offset: position,
                        limit: self.max_line_bytes,
                    });
                }
                // Partial line at EOF: leave it for the next read.
                break;
            }

            let line_start = position;
            position += read as u64;
            scan.accept(&line, line_start, &self.known_ids, &self.path);
        }

        self.offset = position;
        self.oversized_at = skip_at;
        self.known_ids.extend(scan.fresh_ids);

        debug!(
            path = %self.path.display(),
            offset = self.offset,
            delivered = scan.records.len(),
            duplicates = scan.duplicates,
            corrupt = scan.corrupt,
            "history log scanned"
        );
        Ok(scan.records)
    }

    fn io_error(&self, source: io::Error) -> ReadError {
        ReadError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Per-call accumulator.  Ids stay here until the whole scan succeeds.
#[derive(Default)]
struct Scan {
    records: Vec<Record>,
    fresh_ids: HashSet<String>,
    duplicates: usize,
    corrupt: usize,
}

impl Scan {
    fn accept(&mut self, raw: &[u8], offset: u64, known: &HashSet<String>, path: &Path) {
        let Ok(text) = std::str::from_utf8(raw) else {
            self.corrupt += 1;
            warn!(path = %path.display(), offset, "skipping non-UTF-8 history line");
            return;
        };
        let text = text.trim_end_matches(['\n', '\r']);
        if text.trim().is_empty() {
            return;
        }

        let record = match codec::decode_line(text) {
            Ok(record) => record,
            Err(err) => {
                self.corrupt += 1;
                warn!(
                    path = %path.display(),
                    offset,
                    error = %err,
                    "skipping undecodable history line"
                );
                return;
            }
        };

        if record.has_id() {
            if known.contains(record.id()) || !self.fresh_ids.insert(record.id().to_string()) {
                self.duplicates += 1;
                return;
            }
        }
        self.records.push(record);
    }
}

/// Consume through the next `\n` without buffering the line.  Returns the
/// number of bytes consumed, or `None` if EOF arrives first.
fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut consumed = 0u64;
    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            return Ok(None);
        }
        match buf.iter().position(|&b| b == b'\n') {
            Some(idx) => {
                reader.consume(idx + 1);
                return Ok(Some(consumed + idx as u64 + 1));
            }
            None => {
                let len = buf.len();
                reader.consume(len);
                consumed += len as u64;
            }
        }
    }
}
