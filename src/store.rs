//! DataStore trait - the contract every backend implements.
//!
//! Paths are virtual, `/`-separated and normalized by the backend (see
//! [`crate::path`]). A path ending in `/` is a directory. Directories are
//! implicit: they exist as long as some file below them exists.
//!
//! Absence is never an error. Reading a missing path yields `None`, listing a
//! missing directory yields an empty list and removing a missing path
//! succeeds.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::changes::{ChangeListener, CloseListener, Subscription};
use crate::error::{Result, StoreError};
use crate::path;

/// Readable byte stream handed out by `read_stream` and accepted by
/// `write_stream`. Dropping it closes the underlying resource.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// Progress callback for streamed writes, called with the number of bytes
/// transferred so far.
pub type Progress = Arc<dyn Fn(u64) + Send + Sync>;

/// One entry of a listing.
///
/// `path` is relative to the listed directory. Directory entries end in `/`
/// and aggregate the `size` and `count` of every file below them; their
/// `last_modified` is the newest time found below them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Path relative to the listed directory.
    pub path: String,
    /// Size in bytes (sum of descendant files for directories).
    pub size: u64,
    /// Number of files this entry represents.
    pub count: u32,
    /// Last modification time.
    pub last_modified: SystemTime,
}

impl Item {
    /// A single file entry.
    pub fn file(path: impl Into<String>, size: u64, last_modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            size,
            count: 1,
            last_modified,
        }
    }

    /// Merge two entries with the same path into one aggregate.
    pub fn join(self, other: Item) -> Item {
        Item {
            path: self.path,
            size: self.size + other.size,
            count: self.count + other.count,
            last_modified: self.last_modified.max(other.last_modified),
        }
    }

    /// True for directory entries.
    pub fn is_dir(&self) -> bool {
        path::is_dir(&self.path)
    }

    /// Last segment of the path.
    pub fn file_name(&self) -> &str {
        path::file_name(&self.path)
    }
}

/// Sort items the way every backend returns them.
pub fn sort_items(items: &mut [Item]) {
    items.sort_by(|a, b| path::compare_paths(&a.path, &b.path));
}

/// Reduce a flat list of files (paths relative to the listed directory) to a
/// listing: recursive listings keep every file, flat listings fold deeper
/// files into their first-level directory entry.
pub fn collapse_listing(files: impl IntoIterator<Item = Item>, recursive: bool) -> Vec<Item> {
    let mut by_path: std::collections::BTreeMap<String, Item> = std::collections::BTreeMap::new();
    for mut item in files {
        if item.path.is_empty() {
            continue;
        }
        if !recursive {
            if let Some(slash) = item.path.find('/') {
                item.path.truncate(slash + 1);
            }
        }
        match by_path.remove(&item.path) {
            Some(existing) => {
                let joined = existing.join(item);
                by_path.insert(joined.path.clone(), joined);
            }
            None => {
                by_path.insert(item.path.clone(), item);
            }
        }
    }
    let mut items: Vec<Item> = by_path.into_values().collect();
    sort_items(&mut items);
    items
}

/// The path-addressed storage contract.
///
/// All backends (memory, filesystem, SQLite) and the cache decorator implement
/// this trait. Code should depend on `Arc<dyn DataStore>`, not on a specific
/// implementation. Implementations must be safe to share between tasks.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// List the direct children of `path`, or every file below it when
    /// `recursive`. A missing directory yields an empty list.
    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Item>>;

    /// True if `path` exists as a file or as a directory.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Read the full content of a file.
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Open a file for streamed reading.
    async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>>;

    /// Read a file as UTF-8 text.
    async fn read_string(&self, path: &str) -> Result<Option<String>> {
        match self.read(path).await? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Serialization(e.to_string())),
            None => Ok(None),
        }
    }

    /// Write `data` to `path` with the given modification time, creating
    /// parent directories and overwriting any existing file.
    async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool>;

    /// Write `data` to `path` with the current time.
    async fn write(&self, path: &str, data: &[u8]) -> Result<bool> {
        self.write_at(path, data, SystemTime::now()).await
    }

    /// Write UTF-8 text to `path` with the current time.
    async fn write_str(&self, path: &str, data: &str) -> Result<bool> {
        self.write(path, data.as_bytes()).await
    }

    /// Write everything `source` yields to `path`.
    ///
    /// The source is consumed and dropped before this returns, also on
    /// failure. `time` defaults to now.
    async fn write_stream(
        &self,
        path: &str,
        source: ByteStream,
        time: Option<SystemTime>,
        progress: Option<Progress>,
    ) -> Result<bool>;

    /// Set the modification time of `path`, creating an empty file if absent.
    async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool>;

    /// Touch `path` with the current time.
    async fn touch(&self, path: &str) -> Result<bool> {
        self.touch_at(path, SystemTime::now()).await
    }

    /// Remove a file, or a directory and everything below it.
    async fn remove(&self, path: &str) -> Result<bool>;

    /// Move a file, or a directory and everything below it.
    async fn move_path(&self, from: &str, to: &str) -> Result<bool>;

    /// Modification time of a file.
    async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>>;

    /// Paths changed within the trailing `window`, most recent first.
    async fn list_changed_names_since(&self, window: Duration) -> Result<Vec<String>>;

    /// Register a listener for every change in the store.
    fn on_change(&self, listener: ChangeListener) -> Subscription {
        self.on_change_under(path::ROOT, listener)
    }

    /// Register a listener for changes below `base`.
    fn on_change_under(&self, base: &str, listener: ChangeListener) -> Subscription;

    /// Register a listener called once when the store closes.
    fn on_close(&self, listener: CloseListener) -> Subscription;

    /// Sorted item paths of a listing.
    async fn list_names(&self, path: &str, recursive: bool) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .list(path, recursive)
            .await?
            .into_iter()
            .map(|item| item.path)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Release watchers, pools and timers. Calling it again is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Typed convenience operations available on every store.
#[async_trait]
pub trait DataStoreExt: DataStore {
    /// Read a file and deserialize it as JSON.
    async fn read_json<T: DeserializeOwned + Send>(&self, path: &str) -> Result<Option<T>> {
        match self.read(path).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize `value` as JSON and write it to `path`.
    async fn write_json<T: Serialize + Send + Sync>(&self, path: &str, value: &T) -> Result<bool> {
        let bytes = serde_json::to_vec(value)?;
        self.write(path, &bytes).await
    }
}

impl<S: DataStore + ?Sized> DataStoreExt for S {}

/// Drain `source` into memory, reporting progress along the way.
pub(crate) async fn read_all(mut source: ByteStream, progress: Option<&Progress>) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut buffer = vec![0u8; 8192];
    loop {
        let read = source.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buffer[..read]);
        if let Some(progress) = progress {
            progress(data.len() as u64);
        }
    }
    Ok(data)
}

/// Wrap owned bytes as a [`ByteStream`].
pub fn stream_from_bytes(data: Vec<u8>) -> ByteStream {
    Box::pin(std::io::Cursor::new(data))
}

/// Milliseconds since the Unix epoch (negative before it).
pub(crate) fn to_millis(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(after) => after.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

pub(crate) fn from_millis(millis: i64) -> SystemTime {
    if millis >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_millis(millis as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_millis(millis.unsigned_abs())
    }
}

/// Stores keep modification times with millisecond precision.
pub(crate) fn truncate_to_millis(time: SystemTime) -> SystemTime {
    from_millis(to_millis(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn test_item_join() {
        let a = Item::file("dir/", 10, at(5));
        let b = Item::file("dir/", 7, at(9));
        let joined = a.join(b);
        assert_eq!(joined.size, 17);
        assert_eq!(joined.count, 2);
        assert_eq!(joined.last_modified, at(9));
    }

    #[test]
    fn test_item_file_name() {
        assert_eq!(Item::file("1/2/deep.txt", 1, at(0)).file_name(), "deep.txt");
        assert!(Item::file("1/", 1, at(0)).is_dir());
    }

    #[test]
    fn test_collapse_flat_listing() {
        let files = vec![
            Item::file("1/1/a.txt", 12, at(1)),
            Item::file("1/b.txt", 10, at(3)),
            Item::file("root.txt", 16, at(2)),
            Item::file("2/1/c.txt", 12, at(1)),
        ];
        let items = collapse_listing(files, false);
        let summary: Vec<(String, u64, u32)> = items
            .iter()
            .map(|i| (i.path.clone(), i.size, i.count))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("1/".to_string(), 22, 2),
                ("2/".to_string(), 12, 1),
                ("root.txt".to_string(), 16, 1),
            ]
        );
        assert_eq!(items[0].last_modified, at(3));
    }

    #[test]
    fn test_collapse_recursive_listing() {
        let files = vec![
            Item::file("b/x", 1, at(1)),
            Item::file("a/y", 1, at(1)),
            Item::file("", 1, at(1)),
        ];
        let names: Vec<String> = collapse_listing(files, true)
            .into_iter()
            .map(|i| i.path)
            .collect();
        assert_eq!(names, vec!["a/y", "b/x"]);
    }

    #[tokio::test]
    async fn test_read_all_reports_progress() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let progress: Progress = Arc::new(move |n| sink.lock().push(n));
        let data = read_all(stream_from_bytes(b"abcdef".to_vec()), Some(&progress))
            .await
            .unwrap();
        assert_eq!(data, b"abcdef");
        assert_eq!(seen.lock().last().copied(), Some(6));
    }

    #[test]
    fn test_millis_conversion() {
        let time = SystemTime::UNIX_EPOCH + Duration::from_nanos(1_234_567_891);
        assert_eq!(to_millis(time), 1234);
        assert_eq!(truncate_to_millis(time), at(1) + Duration::from_millis(234));
        assert_eq!(from_millis(-1500), SystemTime::UNIX_EPOCH - Duration::from_millis(1500));
    }
}
