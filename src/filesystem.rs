//! Local filesystem data store implementation.
//!
//! Maps virtual paths onto a directory tree below a root. Every path segment
//! is escaped with [`crate::escape`] so names that are illegal on the host
//! filesystem round-trip exactly.
//!
//! Writes go to a temporary sibling and are renamed into place, so readers
//! see either the old or the new content. Changes made by other processes are
//! picked up by an [`FsWatcher`] on the root; the store's own writes are put
//! on the watcher's ignore list so they are reported once, directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use crate::changes::{ChangeListener, ChangeNotifier, CloseListener, Subscription, DEFAULT_CHANGE_DEBOUNCE};
use crate::error::{Result, StoreError};
use crate::escape;
use crate::path;
use crate::store::{collapse_listing, truncate_to_millis, ByteStream, DataStore, Item, Progress};
use crate::watch::{ChangeKind, FsWatcher, WatchEvent, WatchOptions, DEFAULT_MODIFIED_DEBOUNCE};

/// Marker in temporary file names. Escaped names never contain it because an
/// escaped `%` is always followed by two hex digits.
const TEMP_MARKER: &str = ".%tmp";

/// How long the watcher ignores a path after the store wrote it.
const SELF_WRITE_IGNORE: Duration = Duration::from_secs(3);

/// Delay before a mismatching copy is checked again.
pub(crate) const COPY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Options for [`FileSystemStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct FileSystemOptions {
    /// Debounce window of the change notifier.
    pub change_debounce: Duration,
    /// Quiet period before an external modification is reported.
    pub modified_debounce: Duration,
    /// Watch the root for changes made by other processes.
    pub watch: bool,
}

impl Default for FileSystemOptions {
    fn default() -> Self {
        Self {
            change_debounce: DEFAULT_CHANGE_DEBOUNCE,
            modified_debounce: DEFAULT_MODIFIED_DEBOUNCE,
            watch: true,
        }
    }
}

/// Filesystem implementation of [`DataStore`].
pub struct FileSystemStore {
    root: PathBuf,
    notifier: ChangeNotifier,
    watcher: Mutex<Option<FsWatcher>>,
    temp_counter: AtomicU64,
    closed: AtomicBool,
}

impl FileSystemStore {
    /// Open a store on the first existing root, creating the first root when
    /// none exists.
    pub async fn open(roots: &[PathBuf]) -> Result<Self> {
        Self::open_with(roots, FileSystemOptions::default()).await
    }

    /// Open a store with explicit options.
    pub async fn open_with(roots: &[PathBuf], options: FileSystemOptions) -> Result<Self> {
        let root = Self::select_root(roots).await?;
        info!("Opening filesystem store at {:?}", root);

        let metadata = fs::metadata(&root).await?;
        if !metadata.is_dir() {
            error!("Provided root is not a directory: {:?}", root);
            return Err(StoreError::config(format!(
                "root is not a directory: {}",
                root.display()
            )));
        }
        let root = fs::canonicalize(&root).await?;
        let notifier = ChangeNotifier::with_debounce(options.change_debounce);

        let watcher = if options.watch {
            let handler_root = root.clone();
            let handler_notifier = notifier.clone();
            let watcher = FsWatcher::start(
                &[root.clone()],
                Arc::new(move |event: WatchEvent| {
                    if let Some(virtual_path) = Self::virtual_path(&handler_root, &event.path) {
                        if event.kind == ChangeKind::Overflow {
                            warn!("Watcher overflow below {:?}", handler_root);
                        }
                        handler_notifier.changed([virtual_path]);
                    }
                }),
                Arc::new(|e: StoreError| error!("Filesystem watcher failed: {}", e)),
                WatchOptions {
                    modified_debounce: options.modified_debounce,
                    only_files: true,
                },
            )?;
            Some(watcher)
        } else {
            None
        };

        Ok(Self {
            root,
            notifier,
            watcher: Mutex::new(watcher),
            temp_counter: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    async fn select_root(roots: &[PathBuf]) -> Result<PathBuf> {
        for root in roots {
            if fs::try_exists(root).await.unwrap_or(false) {
                return Ok(root.clone());
            }
        }
        let first = roots
            .first()
            .ok_or_else(|| StoreError::config("no roots provided for filesystem store"))?;
        fs::create_dir_all(first).await?;
        Ok(first.clone())
    }

    /// The directory this store lives in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(format!("filesystem store at {}", self.root.display())));
        }
        Ok(())
    }

    /// Map a virtual path onto the host filesystem.
    fn resolve(&self, virtual_path: &str) -> Result<PathBuf> {
        let normalized = path::normalize(virtual_path);
        let encoded = escape::encode_path(normalized.trim_matches('/'));
        let resolved = if encoded.is_empty() {
            self.root.clone()
        } else {
            self.root.join(encoded)
        };
        let escapes = resolved
            .components()
            .any(|c| matches!(c, Component::ParentDir));
        if escapes || !resolved.starts_with(&self.root) {
            return Err(StoreError::InvalidPath(format!(
                "path tries to escape root: {virtual_path}"
            )));
        }
        Ok(resolved)
    }

    /// Map a host path below `root` back to a normalized virtual path.
    fn virtual_path(root: &Path, os_path: &Path) -> Option<String> {
        let relative = os_path.strip_prefix(root).ok()?;
        let mut segments = Vec::new();
        for component in relative.components() {
            let name = component.as_os_str().to_string_lossy();
            if name.contains(TEMP_MARKER) {
                return None;
            }
            segments.push(escape::decode(&name));
        }
        Some(path::normalize(&segments.join("/")))
    }

    fn ignore_self_write(&self, os_path: &Path) {
        if let Some(watcher) = self.watcher.lock().as_ref() {
            watcher.ignore_path(os_path, SELF_WRITE_IGNORE);
        }
    }

    fn temp_sibling(&self, target: &Path) -> PathBuf {
        let n = self.temp_counter.fetch_add(1, Ordering::Relaxed);
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!("{name}{TEMP_MARKER}{}-{n}", std::process::id()))
    }

    /// Every file below `dir` as `(relative virtual path, host path, metadata)`.
    async fn walk(dir: &Path) -> io::Result<Vec<(String, PathBuf, std::fs::Metadata)>> {
        let mut files = Vec::new();
        let mut stack = vec![(dir.to_path_buf(), String::new())];
        while let Some((current, prefix)) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if is_absent(&e) => continue,
                Err(e) => return Err(e),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.contains(TEMP_MARKER) {
                    continue;
                }
                let relative = format!("{prefix}{}", escape::decode(&name));
                let metadata = match entry.metadata().await {
                    Ok(metadata) => metadata,
                    Err(e) if is_absent(&e) => continue,
                    Err(e) => return Err(e),
                };
                if metadata.is_dir() {
                    stack.push((entry.path(), format!("{relative}/")));
                } else if metadata.is_file() {
                    files.push((relative, entry.path(), metadata));
                }
            }
        }
        Ok(files)
    }

    async fn is_dir(os_path: &Path) -> bool {
        fs::metadata(os_path).await.map(|m| m.is_dir()).unwrap_or(false)
    }

    /// Remove directories left empty below the root, walking up from `os_path`.
    async fn prune_empty_parents(&self, os_path: &Path) {
        let mut current = os_path.parent().map(Path::to_path_buf);
        while let Some(dir) = current {
            if dir == self.root || !dir.starts_with(&self.root) {
                break;
            }
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            current = dir.parent().map(Path::to_path_buf);
        }
    }

    /// Write through a temporary sibling, set the time and rename into place.
    async fn write_atomic(
        &self,
        target: &Path,
        mut source: ByteStream,
        time: SystemTime,
        progress: Option<&Progress>,
    ) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let temp = self.temp_sibling(target);
        let written = async {
            let mut file = fs::File::create(&temp).await?;
            let mut buffer = vec![0u8; 8192];
            let mut total = 0u64;
            loop {
                let read = source.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                file.write_all(&buffer[..read]).await?;
                total += read as u64;
                if let Some(progress) = progress {
                    progress(total);
                }
            }
            file.flush().await?;
            let file = file.into_std().await;
            tokio::task::spawn_blocking(move || {
                file.set_modified(time)?;
                file.sync_all()
            })
            .await
            .map_err(|e| io::Error::other(format!("join error: {e}")))??;
            Ok::<(), io::Error>(())
        }
        .await;
        drop(source);

        if let Err(e) = written {
            let _ = fs::remove_file(&temp).await;
            error!("Unable to write to {:?}: {}", target, e);
            return Err(e.into());
        }
        self.ignore_self_write(target);
        if let Err(e) = fs::rename(&temp, target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        self.ignore_self_write(target);
        Ok(())
    }

    async fn set_modified(os_path: &Path, time: SystemTime) -> io::Result<()> {
        let os_path = os_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&os_path)?
                .set_modified(time)
        })
        .await
        .map_err(|e| io::Error::other(format!("join error: {e}")))?
    }

    /// Relocate one file, falling back to a verified copy when renaming is
    /// not possible (e.g. across devices).
    async fn relocate(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).await?;
        }
        self.ignore_self_write(from);
        self.ignore_self_write(to);
        match fs::rename(from, to).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Rename {:?} -> {:?} failed ({}), copying instead", from, to, e);
                copy_verified(from, to).await?;
                fs::remove_file(from).await?;
                Ok(())
            }
        }
    }
}

/// Whether an error only says the path is not there. A file in the middle
/// of the path counts as absence too.
fn is_absent(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::NotFound | io::ErrorKind::NotADirectory)
}

/// Copy a local file and check the destination size, retrying once after a
/// short delay before giving up with [`StoreError::PartialCopy`].
pub(crate) async fn copy_verified(from: &Path, to: &Path) -> Result<()> {
    let expected = fs::metadata(from).await?.len();
    let mut found = 0;
    for attempt in 0..2 {
        if attempt > 0 {
            warn!("Copy of {:?} is incomplete ({} of {} bytes), retrying", to, found, expected);
            tokio::time::sleep(COPY_RETRY_DELAY).await;
        }
        fs::copy(from, to).await?;
        found = fs::metadata(to).await?.len();
        if found == expected {
            return Ok(());
        }
    }
    Err(StoreError::PartialCopy {
        path: to.display().to_string(),
        expected,
        found,
    })
}

#[async_trait]
impl DataStore for FileSystemStore {
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Item>> {
        self.check_open()?;
        let os_dir = self.resolve(dir)?;
        let files = Self::walk(&os_dir).await?;
        let items = files.into_iter().map(|(relative, _, metadata)| {
            let modified = metadata
                .modified()
                .map(truncate_to_millis)
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Item::file(relative, metadata.len(), modified)
        });
        Ok(collapse_listing(items, recursive))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        Ok(fs::try_exists(&os_path).await.unwrap_or(false))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        if Self::is_dir(&os_path).await {
            return Ok(None);
        }
        match fs::read(&os_path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        if Self::is_dir(&os_path).await {
            return Ok(None);
        }
        match fs::File::open(&os_path).await {
            Ok(file) => Ok(Some(Box::pin(file))),
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool> {
        self.write_stream(path, crate::store::stream_from_bytes(data.to_vec()), Some(time), None)
            .await
    }

    async fn write_stream(
        &self,
        path: &str,
        source: ByteStream,
        time: Option<SystemTime>,
        progress: Option<Progress>,
    ) -> Result<bool> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        let time = truncate_to_millis(time.unwrap_or_else(SystemTime::now));
        self.write_atomic(&os_path, source, time, progress.as_ref()).await?;
        debug!("Wrote {:?}", os_path);
        self.notifier.changed([path::normalize(path)]);
        Ok(true)
    }

    async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        match fs::metadata(&os_path).await {
            Ok(metadata) if metadata.is_file() => {
                self.ignore_self_write(&os_path);
                Self::set_modified(&os_path, truncate_to_millis(time)).await?;
                self.notifier.changed([path::normalize(path)]);
                Ok(true)
            }
            _ => self.write_at(path, &[], time).await,
        }
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        let metadata = match fs::metadata(&os_path).await {
            Ok(metadata) => metadata,
            Err(e) if is_absent(&e) => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let removed = if metadata.is_dir() {
            let base = path::dir_form(path);
            let files = Self::walk(&os_path).await?;
            for (_, file, _) in &files {
                self.ignore_self_write(file);
            }
            if os_path == self.root {
                for (_, file, _) in &files {
                    fs::remove_file(file).await?;
                }
                let mut entries = fs::read_dir(&self.root).await?;
                while let Some(entry) = entries.next_entry().await? {
                    if entry.file_type().await?.is_dir() {
                        fs::remove_dir_all(entry.path()).await?;
                    }
                }
            } else {
                fs::remove_dir_all(&os_path).await?;
            }
            files
                .into_iter()
                .map(|(relative, _, _)| format!("{base}{relative}"))
                .collect()
        } else {
            self.ignore_self_write(&os_path);
            fs::remove_file(&os_path).await?;
            vec![path::file_form(path)]
        };
        self.prune_empty_parents(&os_path).await;
        self.notifier.changed(removed);
        Ok(true)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<bool> {
        self.check_open()?;
        let from_os = self.resolve(from)?;
        let metadata = match fs::metadata(&from_os).await {
            Ok(metadata) => metadata,
            Err(e) if is_absent(&e) => return Ok(true),
            Err(e) => return Err(e.into()),
        };

        let mut changed = Vec::new();
        if metadata.is_dir() {
            let from_dir = path::dir_form(from);
            let to_dir = path::dir_form(to);
            if from_dir == path::ROOT || to_dir.starts_with(&from_dir) {
                return Err(StoreError::InvalidPath(format!(
                    "cannot move {from_dir} into itself ({to_dir})"
                )));
            }
            self.remove(&to_dir).await?;
            let to_os = self.resolve(&to_dir)?;
            for (relative, file, _) in Self::walk(&from_os).await? {
                let target = to_os.join(escape::encode_path(&relative));
                self.relocate(&file, &target).await?;
                changed.push(format!("{from_dir}{relative}"));
                changed.push(format!("{to_dir}{relative}"));
            }
            if let Err(e) = fs::remove_dir_all(&from_os).await {
                if !is_absent(&e) {
                    warn!("Failed to remove {:?} after moving its files: {}", from_os, e);
                }
            }
        } else {
            let to_file = path::file_form(to);
            let from_file = path::file_form(from);
            if to_file == from_file {
                return Ok(true);
            }
            self.remove(&to_file).await?;
            let to_os = self.resolve(&to_file)?;
            self.relocate(&from_os, &to_os).await?;
            changed.push(from_file);
            changed.push(to_file);
        }
        self.prune_empty_parents(&from_os).await;
        self.notifier.changed(changed);
        Ok(true)
    }

    async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>> {
        self.check_open()?;
        let os_path = self.resolve(path)?;
        match fs::metadata(&os_path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(truncate_to_millis(metadata.modified()?))),
            Ok(_) => Ok(None),
            Err(e) if is_absent(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_changed_names_since(&self, window: Duration) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self.notifier.changed_since(window))
    }

    fn on_change_under(&self, base: &str, listener: ChangeListener) -> Subscription {
        self.notifier.subscribe(base, listener)
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.notifier.subscribe_close(listener)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.stop();
        }
        self.notifier.close();
        info!("Closed filesystem store at {:?}", self.root);
        Ok(())
    }
}

impl Drop for FileSystemStore {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.stop();
        }
    }
}
