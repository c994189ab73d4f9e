use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::codec;
use crate::record::Record;

/// Appends records to the history log on behalf of this process.
///
/// Pair with [`crate::ChangeWatcher::mark_known`] so records written here are
/// not delivered back to the same process.
#[derive(Debug, Clone)]
pub struct LogWriter {
    path: PathBuf,
}

impl LogWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record as a single line.  Duplicate ids are written as-is;
    /// readers drop them.
    pub async fn append(&self, record: &Record) -> Result<()> {
        self.append_all(std::slice::from_ref(record)).await
    }

    /// Append several records with one write so they land together.
    pub async fn append_all(&self, records: &[Record]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("create history dir {}", parent.display()))?;
            }
        }

        let mut buf = String::new();
        for record in records {
            buf.push_str(&codec::encode_line(record).context("encode history record")?);
            buf.push('\n');
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open history log {}", self.path.display()))?;
        file.write_all(buf.as_bytes())
            .await
            .with_context(|| format!("append to history log {}", self.path.display()))?;
        // fsync so a sync client never picks up a half-flushed line.
        file.flush()
            .await
            .with_context(|| format!("flush history log {}", self.path.display()))?;
        file.sync_all()
            .await
            .with_context(|| format!("sync history log {}", self.path.display()))?;
        Ok(())
    }
}
