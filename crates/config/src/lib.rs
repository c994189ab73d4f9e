use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Debounce window applied when `debounce_ms` is not configured.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Longest single line the history reader will buffer (1 MiB).
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

// ── History config ───────────────────────────────────────────────────────────

/// Settings for the shared history log and the watcher that tails it.
///
/// Each `ChangeWatcher` takes its own copy of this struct at construction, so
/// two watchers in one process never share a debounce value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Path of the append-only JSONL log.  Its parent directory must exist
    /// before a watcher is started; the file itself may not exist yet.
    pub log_path: String,
    /// Quiet period (milliseconds) after the last change notification before
    /// the log is re-read.  A burst of writes inside this window collapses
    /// into a single read.
    pub debounce_ms: u64,
    /// Lines longer than this many bytes are rejected by the reader.
    pub max_line_bytes: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            log_path: ".histsync/history.jsonl".to_string(),
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

impl HistoryConfig {
    /// Debounce window as a `Duration`.  Zero is clamped to one millisecond.
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms.max(1))
    }

    pub fn log_path(&self) -> PathBuf {
        PathBuf::from(&self.log_path)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

// ── Telemetry config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SyncConfig {
    pub history: HistoryConfig,
    pub telemetry: TelemetryConfig,
}

impl SyncConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?;
        }

        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply `HISTSYNC_*` overrides on top of file values.  Empty values are
    /// ignored, as are debounce values that do not parse.
    fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("HISTSYNC_LOG_PATH") {
            if !value.is_empty() {
                self.history.log_path = value;
            }
        }

        if let Some(value) = lookup("HISTSYNC_DEBOUNCE_MS") {
            if let Ok(ms) = value.trim().parse::<u64>() {
                self.history.debounce_ms = ms;
            }
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered).with_context(|| format!("write config {}", path.display()))?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
