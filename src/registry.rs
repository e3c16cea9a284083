//! Named, reconfigurable stores.
//!
//! The registry builds stores from [`StoreConfig`]s and hands out
//! [`StoreRef`]s: stable handles whose target is swapped atomically when the
//! configuration of that name changes. Change and close listeners added to a
//! `StoreRef` survive rebuilds.
//!
//! A name that is unknown, failed to configure or was closed resolves to a
//! [`FailingStore`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

use crate::cache::CachedStore;
use crate::changes::{ChangeListener, ChangeNotifier, CloseListener, Subscription};
use crate::config::{BackendConfig, StoreConfig};
use crate::error::{Result, StoreError};
use crate::filesystem::FileSystemStore;
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::{ByteStream, DataStore, Item, Progress};

/// Builds a store for one backend `type`.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn DataStore>>;
}

struct MemoryFactory;

#[async_trait]
impl StoreFactory for MemoryFactory {
    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn DataStore>> {
        let BackendConfig::Memory(memory) = config else {
            return Err(StoreError::config(format!("memory factory got {} config", config.kind())));
        };
        Ok(Arc::new(
            MemoryStore::new()
                .with_change_debounce(memory.change_debounce)
                .with_delays(memory.read_delay, memory.write_delay),
        ))
    }
}

struct FileSystemFactory;

#[async_trait]
impl StoreFactory for FileSystemFactory {
    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn DataStore>> {
        let BackendConfig::FileSystem(fs) = config else {
            return Err(StoreError::config(format!("filesystem factory got {} config", config.kind())));
        };
        Ok(Arc::new(FileSystemStore::open_with(&fs.roots, fs.options.clone()).await?))
    }
}

struct DatabaseFactory;

#[async_trait]
impl StoreFactory for DatabaseFactory {
    async fn create(&self, config: &BackendConfig) -> Result<Arc<dyn DataStore>> {
        let BackendConfig::Database(options) = config else {
            return Err(StoreError::config(format!("database factory got {} config", config.kind())));
        };
        Ok(Arc::new(SqliteStore::connect(options.clone()).await?))
    }
}

/// A store that fails every operation with [`StoreError::Unavailable`].
///
/// Stands in for stores that are missing or misconfigured.
pub struct FailingStore {
    reason: String,
}

impl FailingStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    fn fail<T>(&self) -> Result<T> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}

#[async_trait]
impl DataStore for FailingStore {
    async fn list(&self, _path: &str, _recursive: bool) -> Result<Vec<Item>> {
        self.fail()
    }

    async fn exists(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn read(&self, _path: &str) -> Result<Option<Vec<u8>>> {
        self.fail()
    }

    async fn read_stream(&self, _path: &str) -> Result<Option<ByteStream>> {
        self.fail()
    }

    async fn write_at(&self, _path: &str, _data: &[u8], _time: SystemTime) -> Result<bool> {
        self.fail()
    }

    async fn write_stream(
        &self,
        _path: &str,
        _source: ByteStream,
        _time: Option<SystemTime>,
        _progress: Option<Progress>,
    ) -> Result<bool> {
        self.fail()
    }

    async fn touch_at(&self, _path: &str, _time: SystemTime) -> Result<bool> {
        self.fail()
    }

    async fn remove(&self, _path: &str) -> Result<bool> {
        self.fail()
    }

    async fn move_path(&self, _from: &str, _to: &str) -> Result<bool> {
        self.fail()
    }

    async fn get_last_modified(&self, _path: &str) -> Result<Option<SystemTime>> {
        self.fail()
    }

    async fn list_changed_names_since(&self, _window: Duration) -> Result<Vec<String>> {
        self.fail()
    }

    fn on_change_under(&self, _base: &str, _listener: ChangeListener) -> Subscription {
        Subscription::noop()
    }

    fn on_close(&self, _listener: CloseListener) -> Subscription {
        Subscription::noop()
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct RefInner {
    name: String,
    current: RwLock<Arc<dyn DataStore>>,
    forwarding: Mutex<Option<Subscription>>,
    notifier: ChangeNotifier,
}

/// Stable handle to a named store.
///
/// Every call goes to the store currently configured under the name.
#[derive(Clone)]
pub struct StoreRef {
    inner: Arc<RefInner>,
}

impl StoreRef {
    fn new(name: &str, store: Arc<dyn DataStore>) -> Self {
        let store_ref = Self {
            inner: Arc::new(RefInner {
                name: name.to_string(),
                current: RwLock::new(Arc::new(FailingStore::new(format!("store {name} is not configured")))),
                forwarding: Mutex::new(None),
                notifier: ChangeNotifier::with_debounce(Duration::ZERO),
            }),
        };
        store_ref.swap(store);
        store_ref
    }

    /// Name this handle was registered under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The store currently behind this handle.
    pub fn current(&self) -> Arc<dyn DataStore> {
        self.inner.current.read().clone()
    }

    /// Point the handle at `store`, returning the previous one.
    fn swap(&self, store: Arc<dyn DataStore>) -> Arc<dyn DataStore> {
        let notifier = self.inner.notifier.clone();
        let forwarding = store.on_change(Arc::new(move |paths: &[String]| {
            notifier.changed(paths.iter().cloned());
        }));
        let previous = std::mem::replace(&mut *self.inner.current.write(), store);
        if let Some(old) = self.inner.forwarding.lock().replace(forwarding) {
            old.unsubscribe();
        }
        previous
    }

    /// Detach from the current store and fire the close listeners.
    fn retire(&self, reason: String) -> Arc<dyn DataStore> {
        let previous = self.swap(Arc::new(FailingStore::new(reason)));
        self.inner.notifier.close();
        previous
    }

    fn is_retired(&self) -> bool {
        self.inner.notifier.is_closed()
    }
}

#[async_trait]
impl DataStore for StoreRef {
    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<Item>> {
        self.current().list(path, recursive).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.current().exists(path).await
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.current().read(path).await
    }

    async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>> {
        self.current().read_stream(path).await
    }

    async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool> {
        self.current().write_at(path, data, time).await
    }

    async fn write_stream(
        &self,
        path: &str,
        source: ByteStream,
        time: Option<SystemTime>,
        progress: Option<Progress>,
    ) -> Result<bool> {
        self.current().write_stream(path, source, time, progress).await
    }

    async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool> {
        self.current().touch_at(path, time).await
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        self.current().remove(path).await
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<bool> {
        self.current().move_path(from, to).await
    }

    async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>> {
        self.current().get_last_modified(path).await
    }

    async fn list_changed_names_since(&self, window: Duration) -> Result<Vec<String>> {
        self.current().list_changed_names_since(window).await
    }

    fn on_change_under(&self, base: &str, listener: ChangeListener) -> Subscription {
        self.inner.notifier.subscribe(base, listener)
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.inner.notifier.subscribe_close(listener)
    }

    async fn close(&self) -> Result<()> {
        let previous = self.retire(format!("store {} is closed", self.inner.name));
        previous.close().await
    }
}

/// Called with the handle after its store was rebuilt.
pub type RebuiltListener = Arc<dyn Fn(&StoreRef) + Send + Sync>;

struct Entry {
    config: Option<StoreConfig>,
    store_ref: StoreRef,
    rebuilt: Vec<RebuiltListener>,
}

/// Builds and owns named stores.
pub struct StoreRegistry {
    factories: RwLock<HashMap<String, Arc<dyn StoreFactory>>>,
    entries: Mutex<HashMap<String, Entry>>,
    configuring: tokio::sync::Mutex<()>,
}

impl StoreRegistry {
    /// Create a registry with the `memory`, `filesystem` and `database` types.
    pub fn new() -> Self {
        let registry = Self {
            factories: RwLock::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            configuring: tokio::sync::Mutex::new(()),
        };
        registry.register_factory("memory", Arc::new(MemoryFactory));
        registry.register_factory("filesystem", Arc::new(FileSystemFactory));
        registry.register_factory("database", Arc::new(DatabaseFactory));
        registry
    }

    /// Register (or replace) the factory for a store type.
    pub fn register_factory(&self, kind: &str, factory: Arc<dyn StoreFactory>) {
        self.factories.write().insert(kind.to_string(), factory);
    }

    /// Handle for `name`. Until the name is configured it resolves to a
    /// [`FailingStore`].
    pub fn get(&self, name: &str) -> StoreRef {
        self.entries
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Self::unconfigured(name))
            .store_ref
            .clone()
    }

    fn unconfigured(name: &str) -> Entry {
        Entry {
            config: None,
            store_ref: StoreRef::new(
                name,
                Arc::new(FailingStore::new(format!("store {name} is not configured"))),
            ),
            rebuilt: Vec::new(),
        }
    }

    /// Names with a store or a handed out handle.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Build the store for `name` from `config`.
    ///
    /// Nothing happens when `name` already runs with an equal configuration.
    /// Otherwise the new store replaces the old one behind the same
    /// [`StoreRef`], the old store is closed and the rebuilt listeners run.
    /// When building fails the previous store stays in place.
    pub async fn configure(&self, name: &str, config: StoreConfig) -> Result<StoreRef> {
        let _configuring = self.configuring.lock().await;

        {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(name) {
                if entry.config.as_ref() == Some(&config) && !entry.store_ref.is_retired() {
                    debug!("Store {} unchanged", name);
                    return Ok(entry.store_ref.clone());
                }
            }
        }

        let kind = config.backend.kind().to_string();
        let factory = self
            .factories
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| StoreError::config(format!("unknown store type {kind:?} for {name}")))?;

        info!("Building {} store {}", kind, name);
        let store = factory.create(&config.backend).await.map_err(|e| {
            error!("Failed to build store {}: {}", name, e);
            e
        })?;
        let store: Arc<dyn DataStore> = match &config.cache {
            Some(cache) => match CachedStore::new(store.clone(), cache.clone()) {
                Ok(cached) => Arc::new(cached),
                Err(e) => {
                    let _ = store.close().await;
                    return Err(e);
                }
            },
            None => store,
        };

        let (store_ref, previous, listeners) = {
            let mut entries = self.entries.lock();
            let stale = entries.get(name).is_some_and(|e| e.store_ref.is_retired());
            if stale {
                entries.remove(name);
            }
            let entry = entries
                .entry(name.to_string())
                .or_insert_with(|| Self::unconfigured(name));
            let previous = entry.store_ref.swap(store);
            let had_config = entry.config.replace(config).is_some();
            let listeners = if had_config { entry.rebuilt.clone() } else { Vec::new() };
            (entry.store_ref.clone(), previous, listeners)
        };

        if let Err(e) = previous.close().await {
            warn!("Failed to close previous store {}: {}", name, e);
        }
        for listener in listeners {
            listener(&store_ref);
        }
        Ok(store_ref)
    }

    /// Call `listener` every time the store of `name` is rebuilt.
    pub fn on_rebuilt(&self, name: &str, listener: RebuiltListener) {
        self.entries
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Self::unconfigured(name))
            .rebuilt
            .push(listener);
    }

    /// Close the store of `name`. Handles keep resolving to a
    /// [`FailingStore`].
    pub async fn close(&self, name: &str) -> Result<()> {
        let _configuring = self.configuring.lock().await;
        let entry = self.entries.lock().remove(name);
        match entry {
            Some(entry) => {
                info!("Closing store {}", name);
                let previous = entry.store_ref.retire(format!("store {name} is closed"));
                previous.close().await
            }
            None => Ok(()),
        }
    }

    /// Close every store. Returns the first error after trying all.
    pub async fn close_all(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.names() {
            if let Err(e) = self.close(&name).await {
                warn!("Failed to close store {}: {}", name, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::config::MemoryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn memory_config(read_delay_ms: u64) -> StoreConfig {
        StoreConfig::from_backend(BackendConfig::Memory(MemoryConfig {
            read_delay: Duration::from_millis(read_delay_ms),
            write_delay: Duration::ZERO,
            change_debounce: Duration::ZERO,
        }))
    }

    #[tokio::test]
    async fn test_unknown_name_fails() {
        let registry = StoreRegistry::new();
        let store = registry.get("nope");
        assert!(matches!(store.read("/a").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(store.list("/", false).await, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_configure_updates_existing_handle() {
        let registry = StoreRegistry::new();
        let early = registry.get("settings");
        let configured = registry.configure("settings", memory_config(0)).await.unwrap();
        configured.write_str("/a", "1").await.unwrap();
        assert_eq!(early.read_string("/a").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_same_config_keeps_store() {
        let registry = StoreRegistry::new();
        let store = registry.configure("s", memory_config(0)).await.unwrap();
        store.write_str("/a", "1").await.unwrap();
        registry.configure("s", memory_config(0)).await.unwrap();
        assert!(store.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_changed_config_rebuilds() {
        let registry = StoreRegistry::new();
        let rebuilt = Arc::new(AtomicUsize::new(0));
        let counter = rebuilt.clone();
        registry.on_rebuilt("s", Arc::new(move |_: &StoreRef| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let store = registry.configure("s", memory_config(0)).await.unwrap();
        let old = store.current();
        store.write_str("/a", "1").await.unwrap();
        assert_eq!(rebuilt.load(Ordering::SeqCst), 0);

        registry.configure("s", memory_config(1)).await.unwrap();
        assert_eq!(rebuilt.load(Ordering::SeqCst), 1);
        assert!(!store.exists("/a").await.unwrap());
        assert!(matches!(old.read("/a").await, Err(StoreError::Closed(_))));
    }

    #[tokio::test]
    async fn test_listeners_survive_rebuild() {
        let registry = StoreRegistry::new();
        let store = registry.configure("s", memory_config(0)).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        store.on_change(Arc::new(move |paths: &[String]| sink.lock().extend_from_slice(paths)));

        store.write_str("/before", "x").await.unwrap();
        registry.configure("s", memory_config(1)).await.unwrap();
        store.write_str("/after", "x").await.unwrap();
        assert_eq!(*seen.lock(), vec!["/before".to_string(), "/after".to_string()]);
    }

    #[tokio::test]
    async fn test_cache_block_wraps_store() {
        let registry = StoreRegistry::new();
        let config = memory_config(0).with_cache(CacheConfig::new(1024));
        let store = registry.configure("cached", config).await.unwrap();
        store.write_str("/a", "1").await.unwrap();
        store.read("/a").await.unwrap();
        assert!(store.current().exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_type_is_config_error() {
        let registry = StoreRegistry::new();
        let config = StoreConfig::from_json(r#"{"type":"s3"}"#).unwrap();
        let result = registry.configure("x", config).await;
        assert!(matches!(result, Err(StoreError::Config(_))));
        assert!(registry.get("x").read("/a").await.is_err());
    }

    #[tokio::test]
    async fn test_custom_factory() {
        struct Preloaded;

        #[async_trait]
        impl StoreFactory for Preloaded {
            async fn create(&self, _config: &BackendConfig) -> Result<Arc<dyn DataStore>> {
                let store = MemoryStore::new().with_change_debounce(Duration::ZERO);
                store.write_str("/hello", "world").await?;
                Ok(Arc::new(store))
            }
        }

        let registry = StoreRegistry::new();
        registry.register_factory("preloaded", Arc::new(Preloaded));
        let config = StoreConfig::from_json(r#"{"type":"preloaded"}"#).unwrap();
        let store = registry.configure("p", config).await.unwrap();
        assert_eq!(store.read_string("/hello").await.unwrap().as_deref(), Some("world"));
    }

    #[tokio::test]
    async fn test_close_fires_listeners_and_fails_afterwards() {
        let registry = StoreRegistry::new();
        let store = registry.configure("s", memory_config(0)).await.unwrap();
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        store.on_close(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.close_all().await.unwrap();
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(matches!(store.read("/a").await, Err(StoreError::Unavailable(_))));

        let fresh = registry.configure("s", memory_config(0)).await.unwrap();
        assert!(fresh.write_str("/a", "1").await.unwrap());
        assert!(store.read("/a").await.is_err());
    }
}
