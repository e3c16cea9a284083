//! # datastore
//!
//! Path-addressed object storage with interchangeable backends.
//!
//! Every backend implements the same [`DataStore`] contract:
//!
//! - **Paths**: `/`-separated virtual paths; a trailing `/` marks a directory
//! - **Listings**: directory items carry aggregated size, count and newest time
//! - **Change events**: debounced, de-duplicated batches of changed paths
//! - **Absence is not an error**: missing paths yield `None`, `false` or `[]`
//!
//! ## Backends
//!
//! - [`MemoryStore`]: in-memory map (tests, caches)
//! - [`FileSystemStore`]: directory tree with reversible filename escaping and
//!   a watcher for changes made by other processes
//! - [`SqliteStore`]: one table row per file, polled for external changes
//! - [`CachedStore`]: LRU caching decorator that serves the last good answers
//!   while the wrapped store fails
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use datastore::{DataStore, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> datastore::Result<()> {
//!     let store = MemoryStore::new();
//!
//!     store.write_str("/settings/app.yml", "port: 8080").await?;
//!
//!     for item in store.list("/settings/", false).await? {
//!         println!("{} ({} bytes)", item.path, item.size);
//!     }
//!
//!     if let Some(text) = store.read_string("/settings/app.yml").await? {
//!         println!("{}", text);
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Change Events
//!
//! ```rust,no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use datastore::{DataStore, FileSystemStore};
//!
//! #[tokio::main]
//! async fn main() -> datastore::Result<()> {
//!     let store = FileSystemStore::open(&[PathBuf::from("./data")]).await?;
//!
//!     let subscription = store.on_change_under(
//!         "/settings/",
//!         Arc::new(|paths: &[String]| println!("changed: {:?}", paths)),
//!     );
//!
//!     store.write_str("/settings/app.yml", "port: 8081").await?;
//!
//!     subscription.unsubscribe();
//!     store.close().await
//! }
//! ```
//!
//! ## Configured Stores
//!
//! ```rust,no_run
//! use datastore::{DataStore, StoreConfig, StoreRegistry};
//!
//! #[tokio::main]
//! async fn main() -> datastore::Result<()> {
//!     let registry = StoreRegistry::new();
//!     let config = StoreConfig::from_toml(
//!         r#"
//!         type = "database"
//!         url = "sqlite:artifacts.db"
//!         pollingTime = "30s"
//!
//!         [cache]
//!         maxMemSize = "10MB"
//!         "#,
//!     )?;
//!
//!     let artifacts = registry.configure("artifacts", config).await?;
//!     artifacts.write("/jars/service-1.0.jar", b"...").await?;
//!
//!     registry.close_all().await
//! }
//! ```

pub mod cache;
pub mod changes;
pub mod config;
pub mod copy;
pub mod error;
pub mod escape;
pub mod filesystem;
pub mod memory;
pub mod path;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod watch;

// Re-export main types
pub use cache::{CacheConfig, CachedStore};
pub use changes::{ChangeListener, ChangeNotifier, CloseListener, Subscription};
pub use config::{BackendConfig, StoreConfig};
pub use copy::{copy_from_store_to_file, copy_file_into_store, copy_tree, CopyProgress};
pub use error::{Result, StoreError};
pub use filesystem::{FileSystemOptions, FileSystemStore};
pub use memory::MemoryStore;
pub use registry::{FailingStore, StoreFactory, StoreRef, StoreRegistry};
pub use sqlite::{SqliteOptions, SqliteStore};
pub use store::{ByteStream, DataStore, DataStoreExt, Item, Progress};
pub use watch::{ChangeKind, FsWatcher, WatchEvent, WatchOptions};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::cache::{CacheConfig, CachedStore};
    pub use crate::error::{Result, StoreError};
    pub use crate::filesystem::FileSystemStore;
    pub use crate::memory::MemoryStore;
    pub use crate::registry::{StoreRef, StoreRegistry};
    pub use crate::sqlite::SqliteStore;
    pub use crate::store::{DataStore, DataStoreExt, Item};
}
