//! In-memory data store implementation.
//!
//! Holds every file in an ordered map keyed by normalized path. Directories
//! are implicit, derived from key prefixes. Data is lost when the store is
//! dropped or closed.
//!
//! Optional read and write delays simulate a slow backend, which makes
//! concurrency behaviour (and the cache decorator) testable.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;

use crate::changes::{ChangeListener, ChangeNotifier, CloseListener, Subscription};
use crate::error::{Result, StoreError};
use crate::path;
use crate::store::{
    collapse_listing, read_all, stream_from_bytes, truncate_to_millis, ByteStream, DataStore, Item,
    Progress,
};

#[derive(Debug, Clone)]
struct MemEntry {
    data: Arc<Vec<u8>>,
    modified: SystemTime,
}

/// In-memory implementation of [`DataStore`].
///
/// Uses a BTreeMap so prefix scans (directories) are range queries.
pub struct MemoryStore {
    data: Arc<RwLock<BTreeMap<String, MemEntry>>>,
    notifier: ChangeNotifier,
    read_delay: Duration,
    write_delay: Duration,
    closed: AtomicBool,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            notifier: ChangeNotifier::new(),
            read_delay: Duration::ZERO,
            write_delay: Duration::ZERO,
            closed: AtomicBool::new(false),
        }
    }

    /// Delay every read and every write by the given durations.
    pub fn with_delays(mut self, read_delay: Duration, write_delay: Duration) -> Self {
        self.read_delay = read_delay;
        self.write_delay = write_delay;
        self
    }

    /// Use the given change debounce window instead of the default.
    pub fn with_change_debounce(mut self, debounce: Duration) -> Self {
        self.notifier = ChangeNotifier::with_debounce(debounce);
        self
    }

    /// Get the number of files in the store.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Remove every file without reporting changes.
    pub fn clear(&self) {
        self.data.write().clear();
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed("memory store".to_string()));
        }
        Ok(())
    }

    async fn read_pause(&self) {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
    }

    async fn write_pause(&self) {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
    }

    /// Full paths of every file below `dir` (which ends in `/`).
    fn files_under(data: &BTreeMap<String, MemEntry>, dir: &str) -> Vec<String> {
        data.range(dir.to_string()..)
            .take_while(|(key, _)| key.starts_with(dir))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Directory form of `path` when it names a directory rather than a file.
    fn as_dir(data: &BTreeMap<String, MemEntry>, path: &str) -> Option<String> {
        if path::is_dir(path) {
            return Some(path.to_string());
        }
        if data.contains_key(path) {
            return None;
        }
        let dir = path::dir_form(path);
        data.range(dir.clone()..)
            .next()
            .filter(|(key, _)| key.starts_with(&dir))
            .map(|_| dir)
    }

    fn put(&self, target: String, data: Vec<u8>, time: SystemTime) {
        let entry = MemEntry {
            data: Arc::new(data),
            modified: truncate_to_millis(time),
        };
        self.data.write().insert(target.clone(), entry);
        debug!("Stored {} in memory", target);
        self.notifier.changed([target]);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Item>> {
        self.check_open()?;
        let dir = path::dir_form(dir);
        let files: Vec<Item> = {
            let data = self.data.read();
            data.range(dir.clone()..)
                .take_while(|(key, _)| key.starts_with(&dir))
                .map(|(key, entry)| {
                    Item::file(&key[dir.len()..], entry.data.len() as u64, entry.modified)
                })
                .collect()
        };
        Ok(collapse_listing(files, recursive))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let file = path::file_form(path);
        let dir = path::dir_form(path);
        let data = self.data.read();
        Ok(data.contains_key(&file)
            || data
                .range(dir.clone()..)
                .next()
                .is_some_and(|(key, _)| key.starts_with(&dir)))
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        self.read_pause().await;
        let key = path::normalize(path);
        Ok(self.data.read().get(&key).map(|e| e.data.as_ref().clone()))
    }

    async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>> {
        Ok(self.read(path).await?.map(stream_from_bytes))
    }

    async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool> {
        self.check_open()?;
        self.write_pause().await;
        self.put(path::normalize(path), data.to_vec(), time);
        Ok(true)
    }

    async fn write_stream(
        &self,
        path: &str,
        source: ByteStream,
        time: Option<SystemTime>,
        progress: Option<Progress>,
    ) -> Result<bool> {
        self.check_open()?;
        let data = read_all(source, progress.as_ref()).await?;
        self.write_pause().await;
        self.put(path::normalize(path), data, time.unwrap_or_else(SystemTime::now));
        Ok(true)
    }

    async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool> {
        self.check_open()?;
        let key = path::normalize(path);
        let touched = {
            let mut data = self.data.write();
            match data.get_mut(&key) {
                Some(entry) => {
                    entry.modified = truncate_to_millis(time);
                    true
                }
                None => false,
            }
        };
        if touched {
            self.notifier.changed([key]);
            Ok(true)
        } else {
            self.write_at(&key, &[], time).await
        }
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        self.write_pause().await;
        let target = path::normalize(path);
        let removed: Vec<String> = {
            let mut data = self.data.write();
            let keys = match Self::as_dir(&data, &target) {
                Some(dir) => Self::files_under(&data, &dir),
                None => vec![target],
            };
            keys.into_iter()
                .filter(|key| data.remove(key).is_some())
                .collect()
        };
        self.notifier.changed(removed);
        Ok(true)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<bool> {
        self.check_open()?;
        self.write_pause().await;
        let from = path::normalize(from);
        let mut changed = Vec::new();
        {
            let mut data = self.data.write();
            let moves: Vec<(String, String)> = match Self::as_dir(&data, &from) {
                Some(from_dir) => {
                    let to_dir = path::dir_form(to);
                    if to_dir.starts_with(&from_dir) {
                        return Err(StoreError::InvalidPath(format!(
                            "cannot move {from_dir} into itself ({to_dir})"
                        )));
                    }
                    for key in Self::files_under(&data, &to_dir) {
                        data.remove(&key);
                        changed.push(key);
                    }
                    Self::files_under(&data, &from_dir)
                        .into_iter()
                        .map(|old| {
                            let new = format!("{}{}", to_dir, &old[from_dir.len()..]);
                            (old, new)
                        })
                        .collect()
                }
                None if data.contains_key(&from) => vec![(from.clone(), path::file_form(to))],
                None => Vec::new(),
            };
            for (old, new) in moves {
                if old == new {
                    continue;
                }
                if let Some(entry) = data.remove(&old) {
                    data.insert(new.clone(), entry);
                    changed.push(old);
                    changed.push(new);
                }
            }
        }
        self.notifier.changed(changed);
        Ok(true)
    }

    async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>> {
        self.check_open()?;
        let key = path::normalize(path);
        Ok(self.data.read().get(&key).map(|e| e.modified))
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
        self.data.write().clear();
        self.notifier.close();
        debug!("Closed memory store");
        Ok(())
    }
}
