//! SQLite data store implementation.
//!
//! Every file is one row `(section, path, time, data, size)` of a single
//! table. The `section` column lets several stores share a table. Times are
//! stored as milliseconds since the Unix epoch.
//!
//! Features:
//! - WAL mode for concurrent readers
//! - Directory operations as single statements (`RETURNING` the paths hit)
//! - Changes written by other processes are found by polling for rows newer
//!   than the last known time and funneled into the same change notifier

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info};

use crate::changes::{ChangeListener, ChangeNotifier, CloseListener, Subscription, DEFAULT_CHANGE_DEBOUNCE};
use crate::error::{Result, StoreError};
use crate::path;
use crate::store::{
    collapse_listing, from_millis, read_all, stream_from_bytes, to_millis, ByteStream, DataStore,
    Item, Progress,
};

/// Default table name.
pub const DEFAULT_TABLE: &str = "files";

/// Default interval between polls for external changes.
pub const DEFAULT_POLLING_TIME: Duration = Duration::from_secs(10);

/// Default connection pool size.
pub const DEFAULT_POOL_SIZE: u32 = 10;

/// Options for [`SqliteStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct SqliteOptions {
    /// Connection URL, e.g. `sqlite:data.db` or `sqlite::memory:`.
    pub url: String,
    /// Table holding the files.
    pub table: String,
    /// Section of the table this store uses.
    pub section: String,
    /// Maximum number of pooled connections.
    pub pool_size: u32,
    /// Interval between polls for changes made by other processes.
    pub polling_time: Duration,
    /// Debounce window of the change notifier.
    pub change_debounce: Duration,
}

impl SqliteOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            table: DEFAULT_TABLE.to_string(),
            section: String::new(),
            pool_size: DEFAULT_POOL_SIZE,
            polling_time: DEFAULT_POLLING_TIME,
            change_debounce: DEFAULT_CHANGE_DEBOUNCE,
        }
    }

    fn is_in_memory(&self) -> bool {
        self.url.contains(":memory:") || self.url.contains("mode=memory")
    }
}

/// Escape `text` for use in a `LIKE ... ESCAPE '!'` pattern.
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '!' | '%' | '_' | '[') {
            escaped.push('!');
        }
        escaped.push(c);
    }
    escaped
}

fn validate_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::config(format!("invalid table name: {table:?}")))
    }
}

struct SqlInner {
    pool: SqlitePool,
    table: String,
    section: String,
    notifier: ChangeNotifier,
    /// Newest row time seen by a poll. Only polls move it.
    last_known: AtomicI64,
    /// Rows this store wrote that no poll has seen yet, by path.
    own_writes: Mutex<HashMap<String, i64>>,
}

impl SqlInner {
    /// `WHERE` fragment selecting every path below a directory prefix. LIKE
    /// narrows the scan, the substring comparison makes it case-sensitive.
    const PREFIX: &'static str = "path LIKE ? ESCAPE '!' AND substr(path, 1, ?) = ?";

    fn sql(&self, query: &str) -> String {
        query.replace("${table}", &self.table)
    }

    fn record_own_write(&self, file: &str, millis: i64) {
        if millis > self.last_known.load(Ordering::Acquire) {
            self.own_writes.lock().insert(file.to_string(), millis);
        }
    }

    async fn max_time(&self) -> Result<Option<i64>> {
        let row: (Option<i64>,) = sqlx::query_as(&self.sql("SELECT MAX(time) FROM ${table} WHERE section = ?"))
            .bind(&self.section)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }

    async fn poll_for_changes(&self) -> Result<()> {
        let since = self.last_known.load(Ordering::Acquire);
        let rows: Vec<(String, i64)> = sqlx::query_as(
            &self.sql("SELECT path, time FROM ${table} WHERE section = ? AND time > ? ORDER BY time"),
        )
        .bind(&self.section)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        let Some(newest) = rows.iter().map(|(_, time)| *time).max() else {
            return Ok(());
        };
        let newest = self.last_known.fetch_max(newest, Ordering::AcqRel).max(newest);

        let external: Vec<String> = {
            let mut own = self.own_writes.lock();
            let external = rows
                .into_iter()
                .filter(|(path, time)| {
                    if own.get(path).copied() == Some(*time) {
                        own.remove(path);
                        false
                    } else {
                        true
                    }
                })
                .map(|(path, _)| path)
                .collect();
            own.retain(|_, time| *time > newest);
            external
        };
        if !external.is_empty() {
            debug!("Poll found {} changed rows in {}", external.len(), self.table);
            self.notifier.changed(external);
        }
        Ok(())
    }
}

/// SQLite implementation of [`DataStore`].
///
/// Uses WAL mode for performance and durability.
pub struct SqliteStore {
    inner: Arc<SqlInner>,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SqliteStore {
    /// Open or create a SQLite store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Self::connect(SqliteOptions::new(format!("sqlite:{}", path.display()))).await
    }

    /// Create an in-memory SQLite store (for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::connect(SqliteOptions::new("sqlite::memory:")).await
    }

    /// Connect with explicit options.
    pub async fn connect(options: SqliteOptions) -> Result<Self> {
        validate_table_name(&options.table)?;
        if options.polling_time.is_zero() {
            return Err(StoreError::config("pollingTime must be positive"));
        }
        info!("Opening SQLite store at {:?}", options.url);

        let in_memory = options.is_in_memory();
        let mut connect = SqliteConnectOptions::from_str(&options.url)
            .map_err(|e| StoreError::config(format!("invalid database url {}: {e}", options.url)))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        if !in_memory {
            connect = connect
                .create_if_missing(true)
                .synchronous(SqliteSynchronous::Normal);
        }

        // An in-memory database lives as long as its single connection.
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(options.pool_size.max(1))
        };
        let pool = pool_options
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(connect)
            .await
            .map_err(|e| StoreError::Unavailable(format!("cannot connect to {}: {e}", options.url)))?;

        let inner = Arc::new(SqlInner {
            pool,
            table: options.table,
            section: options.section,
            notifier: ChangeNotifier::with_debounce(options.change_debounce),
            last_known: AtomicI64::new(0),
            own_writes: Mutex::new(HashMap::new()),
        });
        Self::init_schema(&inner).await?;
        let last_known = match inner.max_time().await? {
            Some(max) => max,
            None => to_millis(SystemTime::now()),
        };
        inner.last_known.store(last_known, Ordering::Release);

        let poller = Self::spawn_poller(Arc::downgrade(&inner), options.polling_time);
        Ok(Self {
            inner,
            poller: Mutex::new(Some(poller)),
            closed: AtomicBool::new(false),
        })
    }

    /// Initialize the database schema.
    async fn init_schema(inner: &SqlInner) -> Result<()> {
        sqlx::query(&inner.sql(
            r#"
            CREATE TABLE IF NOT EXISTS ${table} (
                section TEXT NOT NULL DEFAULT '',
                path TEXT NOT NULL,
                time INTEGER NOT NULL,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                PRIMARY KEY (section, path)
            );

            CREATE INDEX IF NOT EXISTS idx_${table}_time ON ${table}(time);
            "#,
        ))
        .execute(&inner.pool)
        .await?;

        debug!("SQLite schema initialized for table {}", inner.table);
        Ok(())
    }

    fn spawn_poller(inner: Weak<SqlInner>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks = IntervalStream::new(interval);
            // The first tick completes immediately.
            ticks.next().await;
            while ticks.next().await.is_some() {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                if inner.pool.is_closed() {
                    break;
                }
                if let Err(e) = inner.poll_for_changes().await {
                    error!("Polling {} for changes failed: {}", inner.table, e);
                }
            }
            debug!("SQLite poller stopped");
        })
    }

    /// Look for rows changed by other processes now instead of waiting for
    /// the next poll.
    pub async fn poll_now(&self) -> Result<()> {
        self.check_open()?;
        self.inner.poll_for_changes().await
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed(format!("SQLite table {}", self.inner.table)));
        }
        Ok(())
    }

    fn prefix_binds(dir: &str) -> (String, i64, String) {
        (
            format!("{}%", escape_like(dir)),
            dir.chars().count() as i64,
            dir.to_string(),
        )
    }

    async fn has_file(&self, file: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as(&self.inner.sql("SELECT 1 FROM ${table} WHERE section = ? AND path = ?"))
                .bind(&self.inner.section)
                .bind(file)
                .fetch_optional(&self.inner.pool)
                .await?;
        Ok(row.is_some())
    }

    async fn upsert(&self, file: &str, data: &[u8], time: SystemTime) -> Result<()> {
        let millis = to_millis(time);
        // Recorded before the row lands so a concurrent poll already skips it.
        self.inner.record_own_write(file, millis);
        sqlx::query(&self.inner.sql(
            r#"
            INSERT INTO ${table} (section, path, time, data, size)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(section, path) DO UPDATE SET
                time = excluded.time,
                data = excluded.data,
                size = excluded.size
            "#,
        ))
        .bind(&self.inner.section)
        .bind(file)
        .bind(millis)
        .bind(data)
        .bind(data.len() as i64)
        .execute(&self.inner.pool)
        .await?;
        self.inner.notifier.changed([file.to_string()]);
        Ok(())
    }
}

#[async_trait]
impl DataStore for SqliteStore {
    async fn list(&self, dir: &str, recursive: bool) -> Result<Vec<Item>> {
        self.check_open()?;
        let dir = path::dir_form(dir);
        let (like, len, prefix) = Self::prefix_binds(&dir);
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(&self.inner.sql(&format!(
            "SELECT path, size, time FROM ${{table}} WHERE section = ? AND {}",
            SqlInner::PREFIX
        )))
        .bind(&self.inner.section)
        .bind(like)
        .bind(len)
        .bind(prefix)
        .fetch_all(&self.inner.pool)
        .await?;

        let files = rows.into_iter().map(|(full, size, time)| {
            Item::file(&full[dir.len()..], size.max(0) as u64, from_millis(time))
        });
        Ok(collapse_listing(files, recursive))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let file = path::file_form(path);
        let dir = path::dir_form(path);
        let (like, len, prefix) = Self::prefix_binds(&dir);
        let row: Option<(i64,)> = sqlx::query_as(&self.inner.sql(&format!(
            "SELECT 1 FROM ${{table}} WHERE section = ? AND (path = ? OR ({})) LIMIT 1",
            SqlInner::PREFIX
        )))
        .bind(&self.inner.section)
        .bind(file)
        .bind(like)
        .bind(len)
        .bind(prefix)
        .fetch_optional(&self.inner.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.check_open()?;
        let row: Option<(Vec<u8>,)> =
            sqlx::query_as(&self.inner.sql("SELECT data FROM ${table} WHERE section = ? AND path = ?"))
                .bind(&self.inner.section)
                .bind(path::normalize(path))
                .fetch_optional(&self.inner.pool)
                .await?;
        Ok(row.map(|(data,)| data))
    }

    async fn read_stream(&self, path: &str) -> Result<Option<ByteStream>> {
        Ok(self.read(path).await?.map(stream_from_bytes))
    }

    async fn write_at(&self, path: &str, data: &[u8], time: SystemTime) -> Result<bool> {
        self.check_open()?;
        self.upsert(&path::normalize(path), data, time).await?;
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
        self.upsert(&path::normalize(path), &data, time.unwrap_or_else(SystemTime::now))
            .await?;
        Ok(true)
    }

    async fn touch_at(&self, path: &str, time: SystemTime) -> Result<bool> {
        self.check_open()?;
        let file = path::normalize(path);
        let millis = to_millis(time);
        self.inner.record_own_write(&file, millis);
        let updated = sqlx::query(&self.inner.sql("UPDATE ${table} SET time = ? WHERE section = ? AND path = ?"))
            .bind(millis)
            .bind(&self.inner.section)
            .bind(&file)
            .execute(&self.inner.pool)
            .await?;
        if updated.rows_affected() == 0 {
            self.upsert(&file, &[], time).await?;
        } else {
            self.inner.notifier.changed([file]);
        }
        Ok(true)
    }

    async fn remove(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let target = path::normalize(path);
        let removed: Vec<(String,)> = if !path::is_dir(&target) && self.has_file(&target).await? {
            sqlx::query_as(&self.inner.sql(
                "DELETE FROM ${table} WHERE section = ? AND path = ? RETURNING path",
            ))
            .bind(&self.inner.section)
            .bind(&target)
            .fetch_all(&self.inner.pool)
            .await?
        } else {
            let (like, len, prefix) = Self::prefix_binds(&path::dir_form(&target));
            sqlx::query_as(&self.inner.sql(&format!(
                "DELETE FROM ${{table}} WHERE section = ? AND {} RETURNING path",
                SqlInner::PREFIX
            )))
            .bind(&self.inner.section)
            .bind(like)
            .bind(len)
            .bind(prefix)
            .fetch_all(&self.inner.pool)
            .await?
        };
        debug!("Removed {} rows for {}", removed.len(), target);
        self.inner.notifier.changed(removed.into_iter().map(|(p,)| p));
        Ok(true)
    }

    async fn move_path(&self, from: &str, to: &str) -> Result<bool> {
        self.check_open()?;
        let from = path::normalize(from);
        let now = to_millis(SystemTime::now());
        let is_file = !path::is_dir(&from) && self.has_file(&from).await?;

        let mut tx = self.inner.pool.begin().await?;
        let mut changed = Vec::new();
        let mut arrived = Vec::new();
        if is_file {
            let to_file = path::file_form(to);
            if to_file == from {
                return Ok(true);
            }
            sqlx::query(&self.inner.sql("DELETE FROM ${table} WHERE section = ? AND path = ?"))
                .bind(&self.inner.section)
                .bind(&to_file)
                .execute(&mut *tx)
                .await?;
            sqlx::query(&self.inner.sql(
                "UPDATE ${table} SET path = ?, time = ? WHERE section = ? AND path = ?",
            ))
            .bind(&to_file)
            .bind(now)
            .bind(&self.inner.section)
            .bind(&from)
            .execute(&mut *tx)
            .await?;
            changed.push(from);
            arrived.push(to_file.clone());
            changed.push(to_file);
        } else {
            let from_dir = path::dir_form(&from);
            let to_dir = path::dir_form(to);
            if to_dir.starts_with(&from_dir) {
                return Err(StoreError::InvalidPath(format!(
                    "cannot move {from_dir} into itself ({to_dir})"
                )));
            }
            let (like, len, prefix) = Self::prefix_binds(&to_dir);
            let dropped: Vec<(String,)> = sqlx::query_as(&self.inner.sql(&format!(
                "DELETE FROM ${{table}} WHERE section = ? AND {} RETURNING path",
                SqlInner::PREFIX
            )))
            .bind(&self.inner.section)
            .bind(like)
            .bind(len)
            .bind(prefix)
            .fetch_all(&mut *tx)
            .await?;
            changed.extend(dropped.into_iter().map(|(p,)| p));

            let (like, len, prefix) = Self::prefix_binds(&from_dir);
            let moved: Vec<(String,)> = sqlx::query_as(&self.inner.sql(&format!(
                "UPDATE ${{table}} SET path = ? || substr(path, ?), time = ? \
                 WHERE section = ? AND {} RETURNING path",
                SqlInner::PREFIX
            )))
            .bind(&to_dir)
            .bind(len + 1)
            .bind(now)
            .bind(&self.inner.section)
            .bind(like)
            .bind(len)
            .bind(prefix)
            .fetch_all(&mut *tx)
            .await?;
            for (new_path,) in moved {
                let relative = &new_path[to_dir.len()..];
                changed.push(format!("{from_dir}{relative}"));
                arrived.push(new_path.clone());
                changed.push(new_path);
            }
        }
        for file in &arrived {
            self.inner.record_own_write(file, now);
        }
        tx.commit().await?;
        self.inner.notifier.changed(changed);
        Ok(true)
    }

    async fn get_last_modified(&self, path: &str) -> Result<Option<SystemTime>> {
        self.check_open()?;
        let row: Option<(i64,)> =
            sqlx::query_as(&self.inner.sql("SELECT time FROM ${table} WHERE section = ? AND path = ?"))
                .bind(&self.inner.section)
                .bind(path::normalize(path))
                .fetch_optional(&self.inner.pool)
                .await?;
        Ok(row.map(|(time,)| from_millis(time)))
    }

    async fn list_changed_names_since(&self, window: Duration) -> Result<Vec<String>> {
        self.check_open()?;
        let since = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let rows: Vec<(String, i64)> = sqlx::query_as(&self.inner.sql(
            "SELECT path, time FROM ${table} WHERE section = ? AND time >= ?",
        ))
        .bind(&self.inner.section)
        .bind(to_millis(since))
        .fetch_all(&self.inner.pool)
        .await?;

        // Deletions only show up in the local log.
        let mut latest: HashMap<String, SystemTime> = HashMap::new();
        let local = self.inner.notifier.recent_changes(window);
        for (path, time) in rows
            .into_iter()
            .map(|(path, time)| (path, from_millis(time)))
            .chain(local)
        {
            let entry = latest.entry(path).or_insert(time);
            *entry = (*entry).max(time);
        }
        let mut changed: Vec<(String, SystemTime)> = latest.into_iter().collect();
        changed.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Ok(changed.into_iter().map(|(path, _)| path).collect())
    }

    fn on_change_under(&self, base: &str, listener: ChangeListener) -> Subscription {
        self.inner.notifier.subscribe(base, listener)
    }

    fn on_close(&self, listener: CloseListener) -> Subscription {
        self.inner.notifier.subscribe_close(listener)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(poller) = self.poller.lock().take() {
            poller.abort();
        }
        self.inner.pool.close().await;
        self.inner.notifier.close();
        info!("Closed SQLite store for table {}", self.inner.table);
        Ok(())
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        if let Some(poller) = self.poller.get_mut().take() {
            poller.abort();
        }
    }
}
