//! Recursive filesystem change detection.
//!
//! Wraps the platform watcher from `notify` and turns its raw events into
//! [`WatchEvent`]s that are safe to act on:
//!
//! - directory events are dropped unless requested,
//! - each event is fingerprinted as `(kind, size, mtime)` and a repeat of the
//!   previous fingerprint for the same path is suppressed,
//! - modifications are debounced per path and reported once the file has been
//!   quiet for the debounce window, and only if it still exists then,
//! - paths may be ignored for a while (the store's own writes), and all events
//!   for files modified after a given moment can be ignored during bulk work.
//!
//! Raw events are forwarded from the notify thread into a tokio task, so the
//! handlers run inside the runtime that started the watcher. [`FsWatcher::stop`]
//! (or dropping the watcher) releases the OS handles.

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};

/// Default quiet period before a modification is reported.
pub const DEFAULT_MODIFIED_DEBOUNCE: Duration = Duration::from_millis(2000);

/// Bookkeeping for a path is dropped after this much inactivity.
const PATH_INFO_TTL: Duration = Duration::from_secs(5);

/// Number of tracked paths above which expired entries are pruned.
const PRUNE_THRESHOLD: usize = 1024;

/// Type of change that occurred to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Path appeared.
    Created,
    /// Path content changed and has been quiet since.
    Modified,
    /// Path was removed.
    Deleted,
    /// The OS dropped events; the tree should be rescanned.
    Overflow,
}

/// A change detected on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Absolute path that changed.
    pub path: PathBuf,
    /// Type of change.
    pub kind: ChangeKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Receives detected changes.
pub type WatchHandler = Arc<dyn Fn(WatchEvent) + Send + Sync>;

/// Receives watcher failures.
pub type ErrorHandler = Arc<dyn Fn(StoreError) + Send + Sync>;

/// Watcher options.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Quiet period before a modification is reported.
    pub modified_debounce: Duration,
    /// Report file events only (default).
    pub only_files: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            modified_debounce: DEFAULT_MODIFIED_DEBOUNCE,
            only_files: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    kind: RawKind,
    size: u64,
    modified: Option<SystemTime>,
}

impl Fingerprint {
    fn of(path: &Path, kind: RawKind) -> Self {
        let meta = std::fs::metadata(path).ok();
        Self {
            kind,
            size: meta.as_ref().map(|m| m.len()).unwrap_or(0),
            modified: meta.and_then(|m| m.modified().ok()),
        }
    }
}

struct PathInfo {
    last_seen: Instant,
    ignore_until: Option<Instant>,
    fingerprint: Option<Fingerprint>,
    deleted: bool,
}

impl PathInfo {
    fn new() -> Self {
        Self {
            last_seen: Instant::now(),
            ignore_until: None,
            fingerprint: None,
            deleted: false,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.ignore_until.map_or(true, |until| until < now)
            && now.duration_since(self.last_seen) > PATH_INFO_TTL
    }
}

struct WatchState {
    paths: Mutex<HashMap<PathBuf, PathInfo>>,
    pending_modified: Mutex<HashMap<PathBuf, u64>>,
    ignore_all_since: Mutex<Option<SystemTime>>,
    only_files: AtomicBool,
    modified_debounce: Duration,
    handler: WatchHandler,
    error_handler: ErrorHandler,
    runtime: tokio::runtime::Handle,
}

impl WatchState {
    fn process(self: &Arc<Self>, event: Event) {
        if event.need_rescan() {
            for path in &event.paths {
                self.emit(path, ChangeKind::Overflow);
            }
            return;
        }
        for (path, raw) in classify(&event) {
            self.process_raw(path, raw);
        }
    }

    fn process_raw(self: &Arc<Self>, path: PathBuf, raw: RawKind) {
        if self.ignored_by_flag(&path)
            || (self.only_files.load(Ordering::Relaxed) && path.is_dir())
            || self.is_ignored(&path, raw)
            || !self.fingerprint_changed(&path, raw)
        {
            return;
        }
        match raw {
            RawKind::Create => self.emit(&path, ChangeKind::Created),
            RawKind::Delete => self.emit(&path, ChangeKind::Deleted),
            RawKind::Modify if path.is_dir() => self.emit(&path, ChangeKind::Modified),
            RawKind::Modify => self.debounce_modified(path),
        }
    }

    fn ignored_by_flag(&self, path: &Path) -> bool {
        let Some(since) = *self.ignore_all_since.lock() else {
            return false;
        };
        std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map(|modified| modified >= since)
            .unwrap_or(false)
    }

    fn is_ignored(&self, path: &Path, raw: RawKind) -> bool {
        let mut paths = self.paths.lock();
        let Some(info) = paths.get_mut(path) else {
            return false;
        };
        let now = Instant::now();
        info.last_seen = now;
        (raw == RawKind::Create && !info.deleted) || info.ignore_until.is_some_and(|until| until > now)
    }

    fn fingerprint_changed(&self, path: &Path, raw: RawKind) -> bool {
        let fingerprint = Fingerprint::of(path, raw);
        let mut paths = self.paths.lock();
        if paths.len() > PRUNE_THRESHOLD {
            let now = Instant::now();
            paths.retain(|_, info| !info.expired(now));
        }
        let info = paths.entry(path.to_path_buf()).or_insert_with(PathInfo::new);
        info.last_seen = Instant::now();
        info.deleted = raw == RawKind::Delete;
        if info.fingerprint == Some(fingerprint) {
            return false;
        }
        info.fingerprint = Some(fingerprint);
        true
    }

    fn debounce_modified(self: &Arc<Self>, path: PathBuf) {
        let generation = {
            let mut pending = self.pending_modified.lock();
            let generation = pending.entry(path.clone()).or_insert(0);
            *generation += 1;
            *generation
        };
        let state = Arc::clone(self);
        self.runtime.spawn(async move {
            tokio::time::sleep(state.modified_debounce).await;
            let current = {
                let mut pending = state.pending_modified.lock();
                if pending.get(&path) == Some(&generation) {
                    pending.remove(&path);
                    true
                } else {
                    false
                }
            };
            if current && path.exists() {
                state.emit(&path, ChangeKind::Modified);
            }
        });
    }

    fn emit(&self, path: &Path, kind: ChangeKind) {
        debug!("Detected {:?} on {:?}", kind, path);
        let handler = &self.handler;
        let event = WatchEvent::new(path, kind);
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            (self.error_handler)(StoreError::Unavailable(format!(
                "watch handler panicked on {}",
                path.display()
            )));
        }
    }
}

fn classify(event: &Event) -> Vec<(PathBuf, RawKind)> {
    let each = |raw: RawKind| event.paths.iter().map(|p| (p.clone(), raw)).collect();
    match event.kind {
        EventKind::Create(_) => each(RawKind::Create),
        EventKind::Remove(_) => each(RawKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(RawKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(RawKind::Create),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => vec![
            (event.paths[0].clone(), RawKind::Delete),
            (event.paths[1].clone(), RawKind::Create),
        ],
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let raw = if p.exists() { RawKind::Create } else { RawKind::Delete };
                (p.clone(), raw)
            })
            .collect(),
        EventKind::Modify(_) => each(RawKind::Modify),
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => each(RawKind::Modify),
        _ => Vec::new(),
    }
}

/// A running recursive watcher over one or more directories.
pub struct FsWatcher {
    watcher: Mutex<Option<RecommendedWatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
    state: Arc<WatchState>,
    dirs: Vec<PathBuf>,
}

impl FsWatcher {
    /// Start watching `dirs` recursively. Must be called within a tokio
    /// runtime.
    pub fn start(
        dirs: &[PathBuf],
        handler: WatchHandler,
        error_handler: ErrorHandler,
        options: WatchOptions,
    ) -> Result<Self> {
        if dirs.is_empty() {
            return Err(StoreError::config("no directories to watch"));
        }
        if let Some(missing) = dirs.iter().find(|d| !d.exists()) {
            return Err(StoreError::InvalidPath(format!(
                "cannot watch non-existing directory {}",
                missing.display()
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Unavailable(format!("watcher needs a tokio runtime: {e}")))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            Config::default(),
        )?;
        for dir in dirs {
            watcher.watch(dir, RecursiveMode::Recursive)?;
        }
        info!("Watching {:?} for changes", dirs);

        let state = Arc::new(WatchState {
            paths: Mutex::new(HashMap::new()),
            pending_modified: Mutex::new(HashMap::new()),
            ignore_all_since: Mutex::new(None),
            only_files: AtomicBool::new(options.only_files),
            modified_debounce: options.modified_debounce,
            handler,
            error_handler,
            runtime: runtime.clone(),
        });

        let task_state = Arc::clone(&state);
        let task = runtime.spawn(async move {
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => task_state.process(event),
                    Err(e) => {
                        warn!("Watcher error: {}", e);
                        (task_state.error_handler)(StoreError::Watcher(e));
                    }
                }
            }
            debug!("Watcher event loop ended");
        });

        Ok(Self {
            watcher: Mutex::new(Some(watcher)),
            task: Mutex::new(Some(task)),
            state,
            dirs: dirs.to_vec(),
        })
    }

    /// Report directory events as well as file events.
    pub fn set_only_files(&self, only_files: bool) {
        self.state.only_files.store(only_files, Ordering::Relaxed);
    }

    /// While set, events for files modified at or after the moment of
    /// setting are ignored.
    pub fn set_ignore_all(&self, ignore: bool) {
        *self.state.ignore_all_since.lock() = ignore.then(SystemTime::now);
    }

    /// Suppress events for `path` for the given duration.
    pub fn ignore_path(&self, path: &Path, duration: Duration) {
        let now = Instant::now();
        let until = now + duration;
        let mut paths = self.state.paths.lock();
        let info = paths.entry(path.to_path_buf()).or_insert_with(PathInfo::new);
        info.ignore_until = Some(info.ignore_until.map_or(until, |current| current.max(until)));
        paths.retain(|_, info| !info.expired(now));
    }

    /// Number of paths currently tracked.
    pub fn tracked_paths(&self) -> usize {
        self.state.paths.lock().len()
    }

    /// Directories being watched.
    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Stop watching and release the OS handles. Calling it again is a no-op.
    pub fn stop(&self) {
        self.set_ignore_all(true);
        if self.watcher.lock().take().is_some() {
            info!("Stopped watching {:?}", self.dirs);
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    /// True once [`FsWatcher::stop`] was called.
    pub fn is_stopped(&self) -> bool {
        self.watcher.lock().is_none()
    }
}

impl Drop for FsWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    type Events = Arc<Mutex<Vec<WatchEvent>>>;

    fn start(dir: &TempDir, debounce: Duration) -> (FsWatcher, Events) {
        let events: Events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let watcher = FsWatcher::start(
            &[dir.path().canonicalize().unwrap()],
            Arc::new(move |event| sink.lock().push(event)),
            Arc::new(|e| panic!("watcher failed: {e}")),
            WatchOptions {
                modified_debounce: debounce,
                only_files: true,
            },
        )
        .unwrap();
        (watcher, events)
    }

    fn kinds_for(events: &Events, path: &Path) -> Vec<ChangeKind> {
        events
            .lock()
            .iter()
            .filter(|e| e.path == path)
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn test_change_kind_serialize() {
        let json = serde_json::to_string(&ChangeKind::Created).unwrap();
        assert_eq!(json, "\"Created\"");
    }

    #[test]
    fn test_classify_rename_both() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/a"))
            .add_path(PathBuf::from("/b"));
        assert_eq!(
            classify(&event),
            vec![
                (PathBuf::from("/a"), RawKind::Delete),
                (PathBuf::from("/b"), RawKind::Create)
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_dir_rejected() {
        let result = FsWatcher::start(
            &[PathBuf::from("/definitely/not/here")],
            Arc::new(|_| {}),
            Arc::new(|_| {}),
            WatchOptions::default(),
        );
        assert!(matches!(result, Err(StoreError::InvalidPath(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_file_created_then_modified_once() {
        let dir = TempDir::new().unwrap();
        let (watcher, events) = start(&dir, Duration::from_millis(300));
        let file = dir.path().canonicalize().unwrap().join("empty.txt");

        std::fs::write(&file, b"").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&file, b"one").unwrap();
        std::fs::write(&file, b"two").unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let kinds = kinds_for(&events, &file);
        assert_eq!(kinds.first(), Some(&ChangeKind::Created));
        assert_eq!(kinds.iter().filter(|k| **k == ChangeKind::Modified).count(), 1);
        watcher.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_no_modified_after_fast_delete() {
        let dir = TempDir::new().unwrap();
        let (watcher, events) = start(&dir, Duration::from_millis(300));
        let file = dir.path().canonicalize().unwrap().join("short-lived.txt");

        std::fs::write(&file, b"data").unwrap();
        std::fs::remove_file(&file).unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let kinds = kinds_for(&events, &file);
        assert!(kinds.contains(&ChangeKind::Deleted));
        let deleted_at = kinds.iter().position(|k| *k == ChangeKind::Deleted).unwrap();
        assert!(!kinds[deleted_at..].contains(&ChangeKind::Modified));
        watcher.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ignored_path_is_silent() {
        let dir = TempDir::new().unwrap();
        let (watcher, events) = start(&dir, Duration::from_millis(100));
        let file = dir.path().canonicalize().unwrap().join("mine.txt");

        watcher.ignore_path(&file, Duration::from_secs(10));
        std::fs::write(&file, b"self write").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(kinds_for(&events, &file).is_empty());
        watcher.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ignore_all_suppresses_new_writes() {
        let dir = TempDir::new().unwrap();
        let (watcher, events) = start(&dir, Duration::from_millis(100));
        let file = dir.path().canonicalize().unwrap().join("bulk.txt");

        watcher.set_ignore_all(true);
        // Coarse filesystem clocks may stamp a write slightly in the past.
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(&file, b"bulk").unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(kinds_for(&events, &file).is_empty());
        watcher.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (watcher, _events) = start(&dir, Duration::from_millis(100));
        assert!(!watcher.is_stopped());
        watcher.stop();
        watcher.stop();
        assert!(watcher.is_stopped());
    }
}
