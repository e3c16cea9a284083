//! Caching decorator for any [`DataStore`].
//!
//! File content is kept in a byte-budgeted LRU cache. Every mutation through
//! the decorator invalidates the affected entries before and after it is
//! delegated; changes reported by the wrapped store invalidate as well.
//!
//! When `read_only_on_store_fail` is set, the last good answer of `list`,
//! `exists` and `get_last_modified` is remembered and served when the wrapped
//! store fails, so a flaky backend degrades to read-only instead of failing.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::changes::{ChangeListener, CloseListener, Subscription};
use crate::error::{Result, StoreError};
use crate::path;
use crate::store::{stream_from_bytes, ByteStream, DataStore, Item, Progress};

/// Default maximum share of the budget a single item may take.
pub const DEFAULT_MAX_MEM_ITEM_FRACTION: f64 = 0.5;

/// Number of remembered answers used when the wrapped store fails.
const FALLBACK_ANSWERS: usize = 1000;

/// Cache decorator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Byte budget for cached content.
    pub max_mem_size: u64,
    /// Largest fraction of the budget a single item may take, in `(0, 1]`.
    pub max_mem_item_fraction: f64,
    /// Serve remembered answers when the wrapped store fails.
    pub read_only_on_store_fail: bool,
}

impl CacheConfig {
    pub fn new(max_mem_size: u64) -> Self {
        Self {
            max_mem_size,
            max_mem_item_fraction: DEFAULT_MAX_MEM_ITEM_FRACTION,
            read_only_on_store_fail: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_mem_size == 0 {
            return Err(StoreError::config("cache maxMemSize must be positive"));
        }
        if !(self.max_mem_item_fraction > 0.0 && self.max_mem_item_fraction <= 1.0) {
            return Err(StoreError::config(format!(
                "cache maxMemItemFraction must be in (0,1], got {}",
                self.max_mem_item_fraction
            )));
        }
        Ok(())
    }

    /// Items larger than this are never cached.
    pub fn max_item_size(&self) -> u64 {
        (self.max_mem_size as f64 * self.max_mem_item_fraction) as u64
    }
}

struct ByteCache {
    entries: LruCache<String, Arc<Vec<u8>>>,
    used: u64,
}

impl ByteCache {
    fn remove(&mut self, key: &str) {
        if let Some(data) = self.entries.pop(key) {
            self.used -= data.len() as u64;
        }
    }

    fn invalidate(&mut self, target: &str) {
        let file = path::file_form(target);
        let dir = path::dir_form(target);
        let doomed: Vec<String> = self
            .entries
            .iter()
            .map(|(key, _)| key)
            .filter(|key| **key == file || key.starts_with(&dir))
            .cloned()
            .collect();
        for key in doomed {
            self.remove(&key);
        }
    }
}

#[derive(Clone)]
enum Answer {
    Listing(Vec<Item>),
    Exists(bool),
    Modified(Option<SystemTime>),
}

struct CacheState {
    config: CacheConfig,
    bytes: Mutex<ByteCache>,
    answers: Option<Mutex<LruCache<String, Answer>>>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    generation: AtomicU64,
}

impl CacheState {
    fn cached(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.bytes.lock().entries.get(key).cloned()
    }

    fn invalidate(&self, target: &str) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.bytes.lock().invalidate(target);
    }

    /// Insert unless an invalidation happened since `generation` was taken.
    fn populate(&self, key: &str, data: Arc<Vec<u8>>, generation: u64) {
        let size = data.len() as u64;
        if size > self.config.max_item_size() {
            debug!("Not caching {} ({} bytes exceeds item limit)", key, size);
            return;
        }
        let mut bytes = self.bytes.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        bytes.remove(key);
        while bytes.used + size > self.config.max_mem_size {
            match bytes.entries.pop_lru() {
                Some((_, evicted)) => bytes.used -= evicted.len() as u64,
                None => break,
            }
        }
        bytes.used += size;
        bytes.entries.put(key.to_string(), data);
    }

    fn remember(&self, key: String, answer: Answer) {
        if let Some(answers) = &self.answers {
            answers.lock().put(key, answer);
        }
    }

    fn recall(&self, key: &str) -> Option<Answer> {
        self.answers.as_ref()?.lock().get(key).cloned()
    }
}

/// A [`DataStore`] wrapper that caches content in memory.
pub struct CachedStore {
    inner: Arc<dyn DataStore>,
    state: Arc<CacheState>,
    invalidation: Mutex<Option<Subscription>>,
}

impl CachedStore {
    /// Wrap `inner`. Fails with [`StoreError::Config`] for invalid settings.
    pub fn new(inner: Arc<dyn DataStore>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let answers = config.read_only_on_store_fail.then(|| {
            Mutex::new(LruCache::new(
                NonZeroUsize::new(FALLBACK_ANSWERS).unwrap_or(NonZeroUsize::MIN),
            ))
        });
        let state = Arc::new(CacheState {
            config,
            bytes: Mutex::new(ByteCache {
                entries: LruCache::unbounded(),
                used: 0,
            }),
            answers,
            in_flight: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        });

        let weak: Weak<CacheState> = Arc::downgrade(&state);
        let invalidation = inner.on_change(Arc::new(move |paths: &[String]| {
            if let Some(state) = weak.upgrade() {
                for path in paths {
                    state.invalidate(path);
                }
            }
        }));

        Ok(Self {
            inner,
            state,
            invalidation: Mutex::new(Some(invalidation)),
        })
    }

    /// True if the content of `path` is in the cache.
    pub fn is_cached(&self, path: &str) -> bool {
        self.state.bytes.lock().entries.contains(&path::normalize(path))
    }

    /// Bytes currently held by the cache.
    pub fn cached_size(&self) -> u64 {
        self.state.bytes.lock().used
    }

    /// Number of cached files.
    pub fn cached_count(&self) -> usize {
        self.state.bytes.lock().entries.len()
    }

    /// Drop all cached content.
    pub fn clear(&self) {
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        let mut bytes = self.state.bytes.lock();
        bytes.entries.clear();
        bytes.used = 0;
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn DataStore> {
        &self.inner
    }

    async fn load(&self, key: &str) -> Result<Option<Arc<Vec<u8>>>> {
        if let Some(hit) = self.state.cached(key) {
            return Ok(Some(hit));
        }
        let gate = self
            .state
            .in_flight
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _turn = gate.lock().await;
            match self.state.cached(key) {
                Some(hit) => Ok(Some(hit)),
                None => {
                    let generation = self.state.generation.load(Ordering::Acquire);
                    match self.inner.read(key).await {
                        Ok(Some(data)) => {
                            let data = Arc::new(data);
                            self.state.populate(key, data.clone(), generation);
                            Ok(Some(data))
                        }
                        Ok(None) => Ok(None),
                        Err(e) => Err(e),
                    }
                }
            }
        };
        {
            let mut in_flight = self.state.in_flight.lock();
            if in_flight.get(key).is_some_and(|g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) <= 2) {
                in_flight.remove(key);
            }
        }
        result
    }

    /// Run a backend query, remembering the answer and falling back to the
    /// remembered one when the backend fails.
    fn answer_or_fallback(&self, key: String, outcome: Result<Answer>) -> Result<Answer> {
        match outcome {
            Ok(answer) => {
                self.state.remember(key, answer.clone());
                Ok(answer)
            }
            Err(e) => match self.state.recall(&key) {
                Some(answer) => {
                    warn!("Store failed ({}), serving cached answer for {}", e, key);
                    Ok(answer)
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl DataStore for CachedStore {
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Item>> {
        let key = format!("list;{};{}", path::dir_form(dir), if recursive { "deep" } else { "flat" });
        let outcome = self.inner.list(dir, recursive).await.map(Answer::Listing);
        match self.answer_or_fallback(key, outcome)? {
            Answer::Listing(items) => Ok(items),
            _ => Err(StoreError::Unavailable("cached answer has the wrong shape".to_string())),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = format!("exists;{}", path::normalize(path));
        let outcome = self.inner.exists(path).await.map(Answer::Exists);
        match self.answer_or_fallback(key, outcome)? {
            Answer::Exists(exists) => Ok(exists),
            _ => Err(StoreError::Unavailable("cached answer has the wrong shape".to_string())),
        }
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let key = path::normalize(path);
        Ok(self.load(&key).await?.map(|data| data.as_ref().clone()))
    }

    async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>> {
        Ok(self.read(path).await?.map(stream_from_bytes))
    }

    async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool> {
        self.state.invalidate(path);
        let result = self.inner.write_at(path, data, time).await;
        self.state.invalidate(path);
        result
    }

    async fn write_stream(
        &self,
        path: &str,
        source: ByteStream,
        time: Option<SystemTime>,
        progress: Option<Progress>,
    ) -> Result<bool> {
        self.state.invalidate(path);
        let result = self.inner.write_stream(path, source, time, progress).await;
        self.state.invalidate(path);
        result
    }

    async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool> {
        self.state.invalidate(path);
        let result = self.inner.touch_at(path, time).await;
        self.state.invalidate(path);
        result
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        self.state.invalidate(path);
        let result = self.inner.remove(path).await;
        self.state.invalidate(path);
        result
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<bool> {
        self.state.invalidate(from);
        self.state.invalidate(to);
        let result = self.inner.move_path(from, to).await;
        self.state.invalidate(from);
        self.state.invalidate(to);
        result
    }

    async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>> {
        let key = format!("lastModified;{}", path::normalize(path));
        let outcome = self.inner.get_last_modified(path).await.map(Answer::Modified);
        match self.answer_or_fallback(key, outcome)? {
            Answer::Modified(time) => Ok(time),
            _ => Err(StoreError::Unavailable("cached answer has the wrong shape".to_string())),
        }
    }

    async fn list_changed_names_since(&self, window: Duration) -> Result<Vec<String>> {
        self.inner.list_changed_names_since(window).await
    }

    fn on_change_under(&self, base: &str, listener: ChangeListener) -> Subscription {
        self.inner.on_change_under(base, listener)
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.inner.on_close(listener)
    }

    async fn close(&self) -> Result<()> {
        let invalidation = self.invalidation.lock().take();
        if let Some(subscription) = invalidation {
            subscription.unsubscribe();
        }
        self.clear();
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;

    /// Store wrapper whose calls can be made to fail on demand.
    struct Flaky {
        inner: MemoryStore,
        failing: AtomicBool,
        reads: AtomicUsize,
    }

    impl Flaky {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryStore::new()
                    .with_change_debounce(Duration::ZERO)
                    .with_delays(Duration::from_millis(20), Duration::ZERO),
                failing: AtomicBool::new(false),
                reads: AtomicUsize::new(0),
            })
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        fn check(&self) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("failing for test".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl DataStore for Flaky {
        async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Item>> {
            self.check()?;
            self.inner.list(path, recursive).await
        }
        async fn exists(&self, path: &str) -> Result<bool> {
            self.check()?;
            self.inner.exists(path).await
        }
        async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
            self.check()?;
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(path).await
        }
        async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>> {
            self.check()?;
            self.inner.read_stream(path).await
        }
        async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool> {
            self.check()?;
            self.inner.write_at(path, data, time).await
        }
        async fn write_stream(
            &self,
            path: &str,
            source: ByteStream,
            time: Option<SystemTime>,
            progress: Option<Progress>,
        ) -> Result<bool> {
            self.check()?;
            self.inner.write_stream(path, source, time, progress).await
        }
        async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool> {
            self.check()?;
            self.inner.touch_at(path, time).await
        }
        async fn remove(&self, path: &str) -> Result<bool> {
            self.check()?;
            self.inner.remove(path).await
        }
        async fn move_path(&self, from: &str, to: &str) -> Result<bool> {
            self.check()?;
            self.inner.move_path(from, to).await
        }
        async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>> {
            self.check()?;
            self.inner.get_last_modified(path).await
        }
        async fn list_changed_names_since(&self, window: Duration) -> Result<Vec<String>> {
            self.check()?;
            self.inner.list_changed_names_since(window).await
        }
        fn on_change_under(&self, base: &str, listener: ChangeListener) -> Subscription {
            self.inner.on_change_under(base, listener)
        }
        fn on_close(&self, listener: CloseListener) -> Subscription {
            self.inner.on_close(listener)
        }
        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn cached(flaky: &Arc<Flaky>, config: CacheConfig) -> CachedStore {
        CachedStore::new(flaky.clone(), config).unwrap()
    }

    #[test]
    fn test_config_validation() {
        assert!(CacheConfig::new(1024).validate().is_ok());
        assert!(CacheConfig::new(0).validate().is_err());
        let mut config = CacheConfig::new(1024);
        config.max_mem_item_fraction = 2.0;
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));
        config.max_mem_item_fraction = 0.0;
        assert!(config.validate().is_err());
        config.max_mem_item_fraction = 1.0;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_read_populates_and_write_invalidates() {
        let flaky = Flaky::new();
        let store = cached(&flaky, CacheConfig::new(100 * 1024));
        store.write_str("/a.txt", "one").await.unwrap();
        assert!(!store.is_cached("/a.txt"));

        assert_eq!(store.read_string("/a.txt").await.unwrap().as_deref(), Some("one"));
        assert!(store.is_cached("/a.txt"));

        store.write_str("/a.txt", "two").await.unwrap();
        assert!(!store.is_cached("/a.txt"));
        assert_eq!(store.read_string("/a.txt").await.unwrap().as_deref(), Some("two"));

        store
            .write_stream("/a.txt", stream_from_bytes(b"three".to_vec()), None, None)
            .await
            .unwrap();
        assert!(!store.is_cached("/a.txt"));
        store.read("/a.txt").await.unwrap();
        store.touch("/a.txt").await.unwrap();
        assert!(!store.is_cached("/a.txt"));
    }

    #[tokio::test]
    async fn test_remove_dir_invalidates_prefix() {
        let flaky = Flaky::new();
        let store = cached(&flaky, CacheConfig::new(100 * 1024));
        store.write("/d/a", b"1").await.unwrap();
        store.write("/d/e/b", b"2").await.unwrap();
        store.write("/other", b"3").await.unwrap();
        for p in ["/d/a", "/d/e/b", "/other"] {
            store.read(p).await.unwrap();
        }
        store.remove("/d").await.unwrap();
        assert!(!store.is_cached("/d/a"));
        assert!(!store.is_cached("/d/e/b"));
        assert!(store.is_cached("/other"));
    }

    #[tokio::test]
    async fn test_external_change_invalidates() {
        let flaky = Flaky::new();
        let store = cached(&flaky, CacheConfig::new(100 * 1024));
        store.write("/x", b"old").await.unwrap();
        store.read("/x").await.unwrap();
        flaky.inner.write("/x", b"new").await.unwrap();
        assert!(!store.is_cached("/x"));
        assert_eq!(store.read("/x").await.unwrap(), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn test_budget_and_item_limit() {
        let flaky = Flaky::new();
        let store = cached(&flaky, CacheConfig::new(100));
        flaky.inner.write("/big", &[0u8; 60]).await.unwrap();
        flaky.inner.write("/a", &[0u8; 40]).await.unwrap();
        flaky.inner.write("/b", &[0u8; 40]).await.unwrap();
        flaky.inner.write("/c", &[0u8; 40]).await.unwrap();

        store.read("/big").await.unwrap();
        assert!(!store.is_cached("/big"));

        store.read("/a").await.unwrap();
        store.read("/b").await.unwrap();
        store.read("/a").await.unwrap();
        store.read("/c").await.unwrap();
        assert!(store.is_cached("/a"));
        assert!(!store.is_cached("/b"));
        assert!(store.is_cached("/c"));
        assert!(store.cached_size() <= 100);
    }

    #[tokio::test]
    async fn test_concurrent_misses_read_once() {
        let flaky = Flaky::new();
        let store = Arc::new(cached(&flaky, CacheConfig::new(100 * 1024)));
        flaky.inner.write("/shared", b"data").await.unwrap();

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.read("/shared").await.unwrap() })
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), Some(b"data".to_vec()));
        }
        assert_eq!(flaky.reads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fail_open_serves_last_good_answers() {
        let flaky = Flaky::new();
        let store = cached(&flaky, CacheConfig::new(100 * 1024));
        store.write_str("/1/a.txt", "a").await.unwrap();
        store.write_str("/1/b.txt", "b").await.unwrap();

        let listing = store.list("/1/", false).await.unwrap();
        assert!(store.exists("/1/a.txt").await.unwrap());
        store.read_string("/1/a.txt").await.unwrap();

        flaky.set_failing(true);
        assert_eq!(store.list("/1/", false).await.unwrap(), listing);
        assert!(store.exists("/1/a.txt").await.unwrap());
        assert_eq!(store.read_string("/1/a.txt").await.unwrap().as_deref(), Some("a"));

        assert!(store.list("/2/", false).await.is_err());
        assert!(store.read("/1/b.txt").await.is_err());
        assert!(store.write("/1/c.txt", b"c").await.is_err());
    }

    #[tokio::test]
    async fn test_failure_propagates_without_fail_open() {
        let flaky = Flaky::new();
        let mut config = CacheConfig::new(100 * 1024);
        config.read_only_on_store_fail = false;
        let store = cached(&flaky, config);
        store.write_str("/a", "a").await.unwrap();
        store.list("/", false).await.unwrap();

        flaky.set_failing(true);
        assert!(matches!(store.list("/", false).await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_close_closes_inner() {
        let flaky = Flaky::new();
        let store = cached(&flaky, CacheConfig::new(1024));
        store.write("/a", b"1").await.unwrap();
        store.read("/a").await.unwrap();
        store.close().await.unwrap();
        assert_eq!(store.cached_count(), 0);
        assert!(matches!(flaky.inner.read("/a").await, Err(StoreError::Closed(_))));
    }
}
