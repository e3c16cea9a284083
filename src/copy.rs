//! Copying between stores and the local filesystem.

use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::filesystem::COPY_RETRY_DELAY;
use crate::path;
use crate::store::{DataStore, Progress};

/// Progress of a tree copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyProgress {
    pub count_done: u64,
    pub count: u64,
    pub size_done: u64,
    pub size: u64,
}

/// Receives [`CopyProgress`] updates.
pub type CopyProgressListener = Arc<dyn Fn(&CopyProgress) + Send + Sync>;

/// Copy a file, or every file below a directory, from one store to another.
///
/// A directory source lands below `target_path`. A file source is written to
/// `target_path`, or into it when `target_path` ends in `/`. Modification
/// times are preserved. Returns the final progress.
pub async fn copy_tree(
    source: &dyn DataStore,
    source_path: &str,
    target: &dyn DataStore,
    target_path: &str,
    progress: Option<CopyProgressListener>,
) -> Result<CopyProgress> {
    let source_dir = path::dir_form(source_path);
    let files = source.list(&source_dir, true).await?;

    let plan: Vec<(String, String, u64)> = if !files.is_empty() {
        let target_dir = path::dir_form(target_path);
        files
            .iter()
            .map(|item| {
                (
                    path::normalize_all([source_dir.as_str(), item.path.as_str()]),
                    path::normalize_all([target_dir.as_str(), item.path.as_str()]),
                    item.size,
                )
            })
            .collect()
    } else {
        let file = path::file_form(source_path);
        if !source.exists(&file).await? {
            return Ok(CopyProgress::default());
        }
        let destination = if path::is_dir(target_path) {
            path::normalize_all([target_path, path::file_name(&file)])
        } else {
            path::normalize(target_path)
        };
        let size = source
            .list(&path::parent_of(&file), false)
            .await?
            .into_iter()
            .find(|item| item.path == path::file_name(&file))
            .map_or(0, |item| item.size);
        vec![(file, destination, size)]
    };

    let mut state = CopyProgress {
        count: plan.len() as u64,
        size: plan.iter().map(|(_, _, size)| size).sum(),
        ..CopyProgress::default()
    };
    let report = |state: &CopyProgress| {
        if let Some(listener) = &progress {
            listener(state);
        }
    };
    report(&state);

    for (from, to, size) in plan {
        let Some(stream) = source.read_stream(&from).await? else {
            debug!("{} vanished while copying", from);
            state.count_done += 1;
            state.size_done += size;
            report(&state);
            continue;
        };
        let time = source.get_last_modified(&from).await?;
        let byte_progress: Option<Progress> = progress.clone().map(|listener| {
            let base = state;
            Arc::new(move |done: u64| {
                listener(&CopyProgress {
                    size_done: base.size_done + done,
                    ..base
                })
            }) as Progress
        });
        target.write_stream(&to, stream, time, byte_progress).await?;
        state.count_done += 1;
        state.size_done += size;
        report(&state);
    }
    Ok(state)
}

/// Copy a local file into a store, keeping its modification time.
pub async fn copy_file_into_store(os_path: &Path, store: &dyn DataStore, path: &str) -> Result<bool> {
    let modified = fs::metadata(os_path).await?.modified().ok();
    let file = fs::File::open(os_path).await?;
    store.write_stream(path, Box::pin(file), modified, None).await
}

/// Copy a file from a store to a local file.
///
/// Returns `false` when the store has no such file, or when the local file
/// exists and `overwrite` is not set. The local size is verified after the
/// copy; a mismatch is retried once after a short delay and then fails with
/// [`StoreError::PartialCopy`].
pub async fn copy_from_store_to_file(
    store: &dyn DataStore,
    path: &str,
    os_path: &Path,
    overwrite: bool,
) -> Result<bool> {
    if !overwrite && fs::try_exists(os_path).await? {
        return Ok(false);
    }
    if let Some(parent) = os_path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut expected = 0;
    let mut found = 0;
    for attempt in 0..2 {
        if attempt > 0 {
            warn!("Copy to {:?} is incomplete ({} of {} bytes), retrying", os_path, found, expected);
            tokio::time::sleep(COPY_RETRY_DELAY).await;
        }
        let Some(mut stream) = store.read_stream(path).await? else {
            return Ok(false);
        };
        let mut file = fs::File::create(os_path).await?;
        expected = tokio::io::copy(&mut stream, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        found = fs::metadata(os_path).await?.len();
        if found == expected {
            if let Some(time) = store.get_last_modified(path).await? {
                let target = os_path.to_path_buf();
                tokio::task::spawn_blocking(move || {
                    std::fs::File::options().write(true).open(&target)?.set_modified(time)
                })
                .await
                .map_err(|e| std::io::Error::other(format!("join error: {e}")))??;
            }
            return Ok(true);
        }
    }
    Err(StoreError::PartialCopy {
        path: os_path.display().to_string(),
        expected,
        found,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use parking_lot::Mutex;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn store() -> MemoryStore {
        MemoryStore::new().with_change_debounce(Duration::ZERO)
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[tokio::test]
    async fn test_copy_directory_tree() {
        let source = store();
        let target = store();
        source.write_at("/src/a.txt", b"aaa", at(1000)).await.unwrap();
        source.write_at("/src/sub/b.txt", b"bb", at(2000)).await.unwrap();
        source.write_at("/other.txt", b"x", at(3000)).await.unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let listener: CopyProgressListener = Arc::new(move |p: &CopyProgress| sink.lock().push(*p));

        let done = copy_tree(&source, "/src", &target, "/dst/", Some(listener)).await.unwrap();
        assert_eq!(
            done,
            CopyProgress {
                count_done: 2,
                count: 2,
                size_done: 5,
                size: 5
            }
        );
        assert_eq!(target.read("/dst/a.txt").await.unwrap(), Some(b"aaa".to_vec()));
        assert_eq!(target.read("/dst/sub/b.txt").await.unwrap(), Some(b"bb".to_vec()));
        assert!(!target.exists("/dst/other.txt").await.unwrap());
        assert_eq!(target.get_last_modified("/dst/sub/b.txt").await.unwrap(), Some(at(2000)));

        let updates = updates.lock();
        assert_eq!(updates.first().map(|p| p.count_done), Some(0));
        assert_eq!(updates.last(), Some(&done));
    }

    #[tokio::test]
    async fn test_copy_single_file_into_dir() {
        let source = store();
        let target = store();
        source.write_str("/a/file.txt", "content").await.unwrap();

        let done = copy_tree(&source, "/a/file.txt", &target, "/b/", None).await.unwrap();
        assert_eq!(done.count_done, 1);
        assert_eq!(done.size, 7);
        assert_eq!(target.read_string("/b/file.txt").await.unwrap().as_deref(), Some("content"));

        copy_tree(&source, "/a/file.txt", &target, "/renamed.txt", None).await.unwrap();
        assert!(target.exists("/renamed.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_missing_source_is_empty() {
        let done = copy_tree(&store(), "/nothing", &store(), "/", None).await.unwrap();
        assert_eq!(done, CopyProgress::default());
    }

    #[tokio::test]
    async fn test_local_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store();
        store.write_at("/data.bin", &[7u8; 3000], at(5000)).await.unwrap();

        let local = dir.path().join("nested").join("data.bin");
        assert!(copy_from_store_to_file(&store, "/data.bin", &local, false).await.unwrap());
        assert_eq!(std::fs::read(&local).unwrap(), vec![7u8; 3000]);
        assert_eq!(std::fs::metadata(&local).unwrap().modified().unwrap(), at(5000));

        store.write_str("/data.bin", "changed").await.unwrap();
        assert!(!copy_from_store_to_file(&store, "/data.bin", &local, false).await.unwrap());
        assert!(copy_from_store_to_file(&store, "/data.bin", &local, true).await.unwrap());
        assert_eq!(std::fs::read_to_string(&local).unwrap(), "changed");

        assert!(copy_file_into_store(&local, &store, "/copied.txt").await.unwrap());
        assert_eq!(store.read_string("/copied.txt").await.unwrap().as_deref(), Some("changed"));
    }

    #[tokio::test]
    async fn test_copy_missing_store_file() {
        let dir = TempDir::new().unwrap();
        let local = dir.path().join("x");
        assert!(!copy_from_store_to_file(&store(), "/x", &local, true).await.unwrap());
    }
}
