//! Debounced delivery of new history records driven by OS file notifications.
//!
//! Each watch session runs two tasks:
//!
//! - the **event loop**, which owns the OS watch on the log's parent
//!   directory, filters events down to writes/creates of the log file, and
//!   arms a debounce deadline that every qualifying event pushes back;
//! - the **delivery worker**, which receives one trigger per expired
//!   deadline and runs `read_new` followed by the callback on the blocking
//!   pool.
//!
//! Reads and callbacks are serialized by a delivery gate shared by every
//! session of one watcher, so batches never overlap even across a
//! stop/start.  The reader itself sits behind a separate lock held only for
//! the read, which lets `mark_known` interleave with a slow callback.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use histsync_config::HistoryConfig;
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::error::{ReadError, WatchError};
use crate::reader::LogReader;
use crate::record::Record;

pub const WATCHER_CHANNEL_CAPACITY: usize = 1000;

/// Oversized lines skipped within one delivery cycle before giving up until
/// the next change notification.
const MAX_OVERSIZED_SKIPS: usize = 64;

type Callback = Arc<dyn Fn(Vec<Record>) + Send + Sync>;

/// Tails one history log and calls back with each batch of new records.
///
/// All methods take `&self`, so a watcher can be shared behind an `Arc`
/// between the task that owns its lifecycle and the code that appends
/// local records and calls [`ChangeWatcher::mark_known`].
pub struct ChangeWatcher {
    path: PathBuf,
    config: HistoryConfig,
    reader: Arc<Mutex<LogReader>>,
    gate: Arc<Mutex<()>>,
    counters: Arc<ReadCounters>,
    session: Mutex<Option<WatchSession>>,
}

/// Read diagnostics accumulated over the watcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// `read_new` calls made by the watcher, retries included.
    pub reads: u64,
    /// Calls that returned an error.
    pub failed_reads: u64,
    /// Callback invocations.
    pub batches: u64,
}

#[derive(Debug, Default)]
struct ReadCounters {
    reads: AtomicU64,
    failed_reads: AtomicU64,
    batches: AtomicU64,
}

impl ReadCounters {
    fn snapshot(&self) -> WatchStats {
        WatchStats {
            reads: self.reads.load(Ordering::Relaxed),
            failed_reads: self.failed_reads.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Live state between `start` and `stop`.  Dropping it closes the stop
/// channel, which also ends both tasks.
struct WatchSession {
    stop_tx: watch::Sender<bool>,
    /// Checked under the reader lock before every read.
    stopped: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl std::fmt::Debug for ChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeWatcher")
            .field("path", &self.path)
            .field("debounce", &self.config.debounce())
            .field("running", &self.is_running())
            .finish()
    }
}

impl ChangeWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, HistoryConfig::default())
    }

    /// Watch `path` with the debounce window and line limit from `config`.
    /// `config.log_path` is ignored in favour of `path`.
    pub fn with_config(path: impl Into<PathBuf>, config: HistoryConfig) -> Self {
        let path = path.into();
        let reader = LogReader::with_max_line_bytes(&path, config.max_line_bytes);
        Self {
            path,
            config,
            reader: Arc::new(Mutex::new(reader)),
            gate: Arc::new(Mutex::new(())),
            counters: Arc::new(ReadCounters::default()),
            session: Mutex::new(None),
        }
    }

    /// Watch the log named by `config.log_path`.
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::with_config(config.log_path(), config.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_running(&self) -> bool {
        lock(&self.session).is_some()
    }

    pub fn offset(&self) -> u64 {
        lock(&self.reader).offset()
    }

    pub fn known_ids(&self) -> HashSet<String> {
        lock(&self.reader).known_ids()
    }

    pub fn stats(&self) -> WatchStats {
        self.counters.snapshot()
    }

    /// Exclude a locally written record from delivery.  Safe to call from
    /// any thread, including from inside the callback.
    pub fn mark_known(&self, id: impl Into<String>) {
        lock(&self.reader).mark_known(id);
    }

    /// Begin watching.  Must be called from within a tokio runtime.
    ///
    /// Fails without changing state if a session is already running or the
    /// parent directory cannot be watched.  On success an initial read is
    /// queued so content written before `start` is delivered even if no
    /// notification for it ever arrives.
    pub fn start<F>(&self, callback: F) -> Result<(), WatchError>
    where
        F: Fn(Vec<Record>) + Send + Sync + 'static,
    {
        let mut session = lock(&self.session);
        if session.is_some() {
            return Err(WatchError::AlreadyRunning);
        }
        let runtime = Handle::try_current().map_err(|_| WatchError::NoRuntime)?;
        let file_name = self
            .path
            .file_name()
            .map(OsStr::to_os_string)
            .ok_or_else(|| WatchError::InvalidPath {
                path: self.path.clone(),
            })?;
        let dir = watch_dir(&self.path);

        let (event_tx, event_rx) = mpsc::channel(WATCHER_CHANNEL_CAPACITY);
        let mut os_watcher = RecommendedWatcher::new(
            move |res| forward_event(&event_tx, res),
            NotifyConfig::default(),
        )
        .map_err(|source| WatchError::Watch {
            dir: dir.clone(),
            source,
        })?;
        os_watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                dir: dir.clone(),
                source,
            })?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        // Initial scan; the channel is fresh so this cannot fail.
        let _ = trigger_tx.try_send(());

        let stopped = Arc::new(AtomicBool::new(false));
        let delivery = Delivery {
            path: self.path.clone(),
            reader: self.reader.clone(),
            gate: self.gate.clone(),
            counters: self.counters.clone(),
            stopped: stopped.clone(),
            callback: Arc::new(callback),
        };
        runtime.spawn(run_delivery_worker(delivery, trigger_rx, stop_rx.clone()));

        let event_loop = runtime.spawn(run_event_loop(EventLoop {
            _os_watcher: os_watcher,
            events: event_rx,
            trigger: trigger_tx,
            stop_rx,
            file_name,
            debounce: self.config.debounce(),
        }));

        *session = Some(WatchSession {
            stop_tx,
            stopped,
            event_loop,
        });
        info!(
            path = %self.path.display(),
            dir = %dir.display(),
            debounce_ms = self.config.debounce().as_millis() as u64,
            "history watcher started"
        );
        Ok(())
    }

    /// End the session and release the OS watch.  A no-op when not running.
    ///
    /// No read is started after this returns.  A read already in progress is
    /// waited for; its callback is not, and may still run.
    pub async fn stop(&self) -> Result<(), WatchError> {
        let session = lock(&self.session).take();
        let Some(session) = session else {
            return Ok(());
        };

        session.stopped.store(true, Ordering::Release);
        let _ = session.stop_tx.send(true);
        // Reads check `stopped` while holding the reader lock, so taking the
        // lock once means no read that missed the flag is still running.
        let reader = self.reader.clone();
        let _ = tokio::task::spawn_blocking(move || drop(lock(&reader))).await;
        if let Err(err) = session.event_loop.await {
            if err.is_panic() {
                warn!(path = %self.path.display(), error = %err, "history event loop panicked");
            }
        }
        info!(path = %self.path.display(), "history watcher stopped");
        Ok(())
    }
}

struct EventLoop {
    /// Held so the OS watch lives exactly as long as the loop.
    _os_watcher: RecommendedWatcher,
    events: mpsc::Receiver<notify::Result<Event>>,
    trigger: mpsc::Sender<()>,
    stop_rx: watch::Receiver<bool>,
    file_name: OsString,
    debounce: Duration,
}

async fn run_event_loop(mut ctx: EventLoop) {
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            biased;
            changed = ctx.stop_rx.changed() => {
                if changed.is_err() || *ctx.stop_rx.borrow() {
                    break;
                }
            }
            received = ctx.events.recv() => match received {
                Some(Ok(event)) => {
                    if is_log_write(&event, &ctx.file_name) {
                        deadline = Some(Instant::now() + ctx.debounce);
                    } else {
                        debug!(kind = ?event.kind, paths = ?event.paths, "ignoring unrelated fs event");
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "history watcher notification error");
                }
                None => {
                    warn!("history watcher notification channel closed");
                    break;
                }
            },
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                deadline = None;
                // A full channel means a read is already queued and will see
                // these bytes too.
                match ctx.trigger.try_send(()) {
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Closed(())) => break,
                }
            }
        }
    }
    debug!("history watcher event loop exited");
}

#[derive(Clone)]
struct Delivery {
    path: PathBuf,
    reader: Arc<Mutex<LogReader>>,
    gate: Arc<Mutex<()>>,
    counters: Arc<ReadCounters>,
    stopped: Arc<AtomicBool>,
    callback: Callback,
}

impl Delivery {
    /// One read-then-callback cycle.  Runs on the blocking pool.
    fn read_and_deliver(&self) {
        let _gate = lock(&self.gate);
        let Some(result) = self.read_batch() else {
            return;
        };
        match result {
            Ok(records) if records.is_empty() => {}
            Ok(records) => {
                debug!(path = %self.path.display(), count = records.len(), "delivering history records");
                self.counters.batches.fetch_add(1, Ordering::Relaxed);
                (self.callback)(records);
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "history read failed; will retry on next change");
            }
        }
    }

    /// Read under the reader lock, or `None` once the session is stopped.
    ///
    /// An oversized line fails the first read and is skipped by the next, so
    /// the read is repeated at once rather than leaving the records around it
    /// waiting for another notification.
    fn read_batch(&self) -> Option<Result<Vec<Record>, ReadError>> {
        let mut reader = lock(&self.reader);
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }

        let mut result = self.counted_read(&mut reader);
        for _ in 0..MAX_OVERSIZED_SKIPS {
            let Err(ReadError::LineTooLong { offset, limit }) = &result else {
                break;
            };
            warn!(
                path = %self.path.display(),
                offset = *offset,
                limit = *limit,
                "oversized history line; rereading past it"
            );
            result = self.counted_read(&mut reader);
        }
        Some(result)
    }

    fn counted_read(&self, reader: &mut LogReader) -> Result<Vec<Record>, ReadError> {
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        let result = reader.read_new();
        if result.is_err() {
            self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

async fn run_delivery_worker(
    delivery: Delivery,
    mut triggers: mpsc::Receiver<()>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            trigger = triggers.recv() => {
                if trigger.is_none() || *stop_rx.borrow() {
                    break;
                }
                let cycle = delivery.clone();
                if let Err(err) = tokio::task::spawn_blocking(move || cycle.read_and_deliver()).await {
                    warn!(path = %delivery.path.display(), error = %err, "history delivery cycle failed");
                }
            }
        }
    }
}

/// Runs on notify's thread.  Dropping an event when the channel is full is
/// harmless: the queued events already guarantee a later read.
fn forward_event(tx: &mpsc::Sender<notify::Result<Event>>, res: notify::Result<Event>) {
    match tx.try_send(res) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => debug!("history watcher channel full; dropping fs event"),
        Err(TrySendError::Closed(_)) => {}
    }
}

/// True for a data write, create, or rename-into-place of the log file.
fn is_log_write(event: &Event, file_name: &OsStr) -> bool {
    let qualifies = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
    );
    qualifies
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name))
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Recover from poisoning: a panicking callback must not wedge the watcher.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::fs::{self, OpenOptions};
    use std::io::Write;

    use histsync_config::TelemetryConfig;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};
    use tempfile::TempDir;
    use tokio::time::timeout;

    use super::*;
    use crate::telemetry;

    const DEBOUNCE: Duration = Duration::from_millis(100);
    const SETTLE: Duration = Duration::from_millis(400);
    const WAIT: Duration = Duration::from_secs(5);

    fn watcher_for(dir: &TempDir) -> (ChangeWatcher, PathBuf) {
        telemetry::init_tracing(&TelemetryConfig {
            log_level: "debug".to_string(),
        });
        let path = dir.path().join("history.jsonl");
        let config = HistoryConfig::default().with_debounce(DEBOUNCE);
        (ChangeWatcher::with_config(&path, config), path)
    }

    fn append(path: &Path, lines: &[&str]) {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
    }

    /// Start with a callback that forwards each batch's ids to a channel.
    fn start_collecting(watcher: &ChangeWatcher) -> mpsc::UnboundedReceiver<Vec<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        watcher
            .start(move |records| {
                let ids = records.iter().map(|r| r.id().to_string()).collect();
                let _ = tx.send(ids);
            })
            .unwrap();
        rx
    }

    async fn next_batch(rx: &mut mpsc::UnboundedReceiver<Vec<String>>) -> Vec<String> {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for a batch")
            .expect("callback channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Vec<String>>) {
        tokio::time::sleep(SETTLE).await;
        assert!(rx.try_recv().is_err(), "unexpected callback");
    }

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn event_filter_matches_writes_and_creates_of_log_only() {
        let name = OsStr::new("history.jsonl");
        assert!(is_log_write(
            &event(EventKind::Create(CreateKind::File), "/d/history.jsonl"),
            name
        ));
        assert!(is_log_write(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/d/history.jsonl"
            ),
            name
        ));
        assert!(!is_log_write(
            &event(
                EventKind::Modify(ModifyKind::Data(DataChange::Content)),
                "/d/other.jsonl"
            ),
            name
        ));
        assert!(!is_log_write(
            &event(
                EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
                "/d/history.jsonl"
            ),
            name
        ));
        assert!(!is_log_write(
            &event(EventKind::Remove(RemoveKind::File), "/d/history.jsonl"),
            name
        ));
    }

    #[test]
    fn watch_dir_defaults_to_current_directory() {
        assert_eq!(watch_dir(Path::new("history.jsonl")), PathBuf::from("."));
        assert_eq!(watch_dir(Path::new("/a/b.jsonl")), PathBuf::from("/a"));
    }

    #[test]
    fn start_outside_runtime_fails() {
        let dir = TempDir::new().unwrap();
        let (watcher, _) = watcher_for(&dir);
        assert!(matches!(watcher.start(|_| {}), Err(WatchError::NoRuntime)));
        assert!(!watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_before_start_is_noop() {
        let dir = TempDir::new().unwrap();
        let (watcher, _) = watcher_for(&dir);
        watcher.stop().await.unwrap();
        watcher.stop().await.unwrap();
        assert!(!watcher.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pre_existing_content_is_delivered_once() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        append(&path, &[r#"{"id":"a"}"#, r#"{"id":"b"}"#]);

        let mut rx = start_collecting(&watcher);
        assert_eq!(next_batch(&mut rx).await, ["a", "b"]);
        assert_quiet(&mut rx).await;
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_created_after_start_is_picked_up() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let mut rx = start_collecting(&watcher);
        tokio::time::sleep(SETTLE).await;

        append(&path, &[r#"{"id":"first"}"#]);
        assert_eq!(next_batch(&mut rx).await, ["first"]);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn burst_of_appends_coalesces_into_one_callback() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        append(&path, &[]);
        let mut rx = start_collecting(&watcher);
        tokio::time::sleep(SETTLE).await;

        for i in 0..5 {
            append(&path, &[&format!(r#"{{"id":"burst-{i}"}}"#)]);
        }
        assert_eq!(
            next_batch(&mut rx).await,
            ["burst-0", "burst-1", "burst-2", "burst-3", "burst-4"]
        );
        assert_quiet(&mut rx).await;
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn marked_local_record_is_not_delivered() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let mut rx = start_collecting(&watcher);
        tokio::time::sleep(SETTLE).await;

        watcher.mark_known("local-1");
        append(&path, &[r#"{"id":"local-1"}"#, r#"{"id":"remote-1"}"#]);
        assert_eq!(next_batch(&mut rx).await, ["remote-1"]);
        assert!(watcher.known_ids().contains("local-1"));
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn replicated_duplicate_is_delivered_once() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let mut rx = start_collecting(&watcher);
        tokio::time::sleep(SETTLE).await;

        append(&path, &[r#"{"id":"race"}"#]);
        assert_eq!(next_batch(&mut rx).await, ["race"]);
        append(&path, &[r#"{"id":"race","text":"from the other device"}"#]);
        assert_quiet(&mut rx).await;
        assert_eq!(watcher.offset(), fs::metadata(&path).unwrap().len());
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn other_files_in_directory_do_not_trigger_reads() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        append(&path, &[r#"{"id":"seed"}"#]);
        let mut rx = start_collecting(&watcher);
        assert_eq!(next_batch(&mut rx).await, ["seed"]);
        tokio::time::sleep(SETTLE).await;
        let before = watcher.stats();

        append(&dir.path().join("notes.jsonl"), &[r#"{"id":"elsewhere"}"#]);
        assert_quiet(&mut rx).await;
        assert_eq!(watcher.stats().reads, before.reads);
        assert_eq!(watcher.offset(), fs::metadata(&path).unwrap().len());
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn oversized_line_does_not_hold_back_neighbours() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("history.jsonl");
        let config = HistoryConfig {
            max_line_bytes: 64,
            ..HistoryConfig::default().with_debounce(DEBOUNCE)
        };
        let watcher = ChangeWatcher::with_config(&path, config);
        let mut rx = start_collecting(&watcher);
        tokio::time::sleep(SETTLE).await;

        let long = format!(r#"{{"id":"big","text":"{}"}}"#, "x".repeat(200));
        append(&path, &[r#"{"id":"before"}"#, &long, r#"{"id":"after"}"#]);

        // No further writes: the same cycle must get past the long line.
        assert_eq!(next_batch(&mut rx).await, ["before", "after"]);
        assert_eq!(watcher.stats().failed_reads, 1);
        assert_eq!(watcher.offset(), fs::metadata(&path).unwrap().len());
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_callback_keeps_batches_serial_and_ordered() {
        use std::sync::atomic::AtomicUsize;

        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<String>>();

        {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            watcher
                .start(move |records| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    let _ = started_tx.send(());
                    std::thread::sleep(Duration::from_millis(300));
                    let _ = tx.send(records.iter().map(|r| r.id().to_string()).collect());
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        tokio::time::sleep(SETTLE).await;

        append(&path, &[r#"{"id":"a"}"#]);
        timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();
        // Written while the first callback is still sleeping.
        append(&path, &[r#"{"id":"b"}"#]);
        tokio::time::sleep(DEBOUNCE * 2).await;
        append(&path, &[r#"{"id":"c"}"#]);

        let mut delivered = Vec::new();
        while delivered.len() < 3 {
            delivered.extend(next_batch(&mut rx).await);
        }
        assert_eq!(delivered, ["a", "b", "c"]);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_read_does_not_end_the_watch() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let mut rx = start_collecting(&watcher);
        tokio::time::sleep(SETTLE).await;

        // A directory at the log path opens but cannot be read, even as root.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("inner"), "x").unwrap();
        timeout(WAIT, async {
            while watcher.stats().failed_reads == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("read of the directory never failed");
        assert!(watcher.is_running());

        fs::remove_dir_all(&path).unwrap();
        append(&path, &[r#"{"id":"recovered"}"#]);
        assert_eq!(next_batch(&mut rx).await, ["recovered"]);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn no_read_starts_after_stop_returns() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        append(&path, &[r#"{"id":"first"}"#]);

        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        watcher
            .start(move |_| {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(300));
            })
            .unwrap();
        timeout(WAIT, started_rx.recv()).await.unwrap().unwrap();

        // Queue a read behind the running callback, then stop.
        append(&path, &[r#"{"id":"queued"}"#]);
        tokio::time::sleep(DEBOUNCE * 2).await;
        watcher.stop().await.unwrap();
        let at_stop = watcher.stats();

        tokio::time::sleep(SETTLE).await;
        assert_eq!(watcher.stats().reads, at_stop.reads);
        assert_eq!(watcher.stats().batches, 1);
        assert!(!watcher.known_ids().contains("queued"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn truncated_log_delivers_only_new_records() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        append(&path, &[r#"{"id":"old-1"}"#, r#"{"id":"old-2"}"#]);
        let mut rx = start_collecting(&watcher);
        assert_eq!(next_batch(&mut rx).await, ["old-1", "old-2"]);

        fs::write(&path, "{\"id\":\"old-1\"}\n{\"id\":\"new\"}\n").unwrap();
        assert_eq!(next_batch(&mut rx).await, ["new"]);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn double_start_fails_and_keeps_first_session() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let mut rx = start_collecting(&watcher);
        assert!(matches!(
            watcher.start(|_| panic!("second callback must never run")),
            Err(WatchError::AlreadyRunning)
        ));
        assert!(watcher.is_running());

        tokio::time::sleep(SETTLE).await;
        append(&path, &[r#"{"id":"once"}"#]);
        assert_eq!(next_batch(&mut rx).await, ["once"]);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn restart_after_stop_resumes_from_offset() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        append(&path, &[r#"{"id":"a"}"#]);
        let mut rx = start_collecting(&watcher);
        assert_eq!(next_batch(&mut rx).await, ["a"]);
        watcher.stop().await.unwrap();
        assert!(!watcher.is_running());

        append(&path, &[r#"{"id":"while-stopped"}"#]);
        assert_quiet(&mut rx).await;

        let mut rx = start_collecting(&watcher);
        assert_eq!(next_batch(&mut rx).await, ["while-stopped"]);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_directory_fails_start_and_can_retry() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("later");
        let path = nested.join("history.jsonl");
        let watcher = ChangeWatcher::with_config(&path, HistoryConfig::default().with_debounce(DEBOUNCE));

        assert!(matches!(
            watcher.start(|_| {}),
            Err(WatchError::Watch { .. })
        ));
        assert!(!watcher.is_running());

        fs::create_dir(&nested).unwrap();
        append(&path, &[r#"{"id":"x"}"#]);
        let mut rx = start_collecting(&watcher);
        assert_eq!(next_batch(&mut rx).await, ["x"]);
        watcher.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_may_mark_known_without_deadlock() {
        let dir = TempDir::new().unwrap();
        let (watcher, path) = watcher_for(&dir);
        let watcher = Arc::new(watcher);
        append(&path, &[r#"{"id":"seed"}"#]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let inner = Arc::downgrade(&watcher);
        watcher
            .start(move |records| {
                if let Some(watcher) = inner.upgrade() {
                    watcher.mark_known("echo");
                }
                let _ = tx.send(records.len());
            })
            .unwrap();

        assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(1));
        assert!(watcher.known_ids().contains("echo"));
        watcher.stop().await.unwrap();
    }
}
