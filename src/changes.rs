//! Change aggregation and debouncing shared by every backend.
//!
//! Backends report mutated paths through [`ChangeNotifier::changed`]. The
//! notifier collects them in a pending set and, once no new change arrived for
//! the debounce window, hands the de-duplicated set to every listener exactly
//! once. A listener that panics is logged and skipped; the others still run
//! and later flushes are unaffected.
//!
//! The notifier also keeps a bounded, time-stamped log of recent changes that
//! backs `list_changed_names_since`.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Consumer of change events: receives the changed paths of one flush.
pub type ChangeListener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Consumer of the close notification.
pub type CloseListener = Arc<dyn Fn() + Send + Sync>;

/// Default quiet period before pending changes are delivered.
pub const DEFAULT_CHANGE_DEBOUNCE: Duration = Duration::from_secs(1);

/// Pending changes are delivered at the latest after this long, even when
/// changes keep arriving.
pub const DEFAULT_MAX_CHANGE_DELAY: Duration = Duration::from_secs(5);

/// Maximum number of entries kept in the recent-change log.
pub const RECENT_CHANGES_MAX_COUNT: usize = 1000;

/// Handle returned when registering a listener.
///
/// Call [`Subscription::unsubscribe`] to deregister. Dropping the handle
/// leaves the listener registered.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription that has nothing to deregister.
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Deregister the listener.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

fn in_scope(base: &str, path: &str) -> bool {
    if crate::path::is_dir(base) {
        return path.starts_with(base);
    }
    path == base || (path.starts_with(base) && path[base.len()..].starts_with('/'))
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct Registered {
    base: String,
    listener: ChangeListener,
}

#[derive(Default)]
struct Pending {
    paths: BTreeSet<String>,
    first_change: Option<Instant>,
    last_change: Option<Instant>,
    flush_scheduled: bool,
}

struct Inner {
    debounce: Duration,
    max_delay: Duration,
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<u64, Registered>>,
    close_listeners: RwLock<BTreeMap<u64, CloseListener>>,
    pending: Mutex<Pending>,
    recent: Mutex<VecDeque<(String, SystemTime)>>,
    closed: AtomicBool,
}

/// Debounced, de-duplicating change aggregator.
///
/// Cheap to clone; clones share listeners and pending state.
#[derive(Clone)]
pub struct ChangeNotifier {
    inner: Arc<Inner>,
}

impl ChangeNotifier {
    /// Create a notifier with the default debounce window.
    pub fn new() -> Self {
        Self::with_debounce(DEFAULT_CHANGE_DEBOUNCE)
    }

    /// Create a notifier with the given debounce window.
    ///
    /// A zero window delivers each batch of changes immediately on the task
    /// that reported them, which keeps tests deterministic.
    pub fn with_debounce(debounce: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                debounce,
                max_delay: DEFAULT_MAX_CHANGE_DELAY.max(debounce),
                next_id: AtomicU64::new(1),
                listeners: RwLock::new(BTreeMap::new()),
                close_listeners: RwLock::new(BTreeMap::new()),
                pending: Mutex::new(Pending::default()),
                recent: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The debounce window of this notifier.
    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Register a listener for changes at or below `base`.
    ///
    /// A base without a trailing `/` also matches the file of that name, but
    /// never a sibling sharing its prefix.
    pub fn subscribe(&self, base: &str, listener: ChangeListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.write().insert(
            id,
            Registered {
                base: crate::path::normalize(base),
                listener,
            },
        );
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners.write().remove(&id);
            }
        })
    }

    /// Register a listener for the close notification.
    pub fn subscribe_close(&self, listener: CloseListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.close_listeners.write().insert(id, listener);
        let inner = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.close_listeners.write().remove(&id);
            }
        })
    }

    /// Number of registered change listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Report changed paths.
    pub fn changed<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let paths: Vec<String> = paths.into_iter().map(Into::into).collect();
        if paths.is_empty() {
            return;
        }
        self.record_recent(&paths);

        let now = Instant::now();
        let schedule = {
            let mut pending = self.inner.pending.lock();
            pending.paths.extend(paths);
            pending.first_change.get_or_insert(now);
            pending.last_change = Some(now);
            if pending.flush_scheduled {
                false
            } else {
                pending.flush_scheduled = true;
                true
            }
        };
        if !schedule {
            return;
        }

        if self.inner.debounce.is_zero() {
            self.flush();
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let notifier = self.clone();
                handle.spawn(async move { notifier.flush_after_quiet_period().await });
            }
            Err(_) => {
                debug!("No async runtime to debounce changes on; delivering immediately");
                self.flush();
            }
        }
    }

    async fn flush_after_quiet_period(self) {
        loop {
            let wait = {
                let pending = self.inner.pending.lock();
                let now = Instant::now();
                let quiet_until = pending.last_change.map(|t| t + self.inner.debounce);
                let latest = pending.first_change.map(|t| t + self.inner.max_delay);
                match (quiet_until, latest) {
                    (Some(quiet_until), Some(latest)) => quiet_until.min(latest).saturating_duration_since(now),
                    _ => Duration::ZERO,
                }
            };
            if wait.is_zero() {
                break;
            }
            tokio::time::sleep(wait).await;
        }
        self.flush();
    }

    /// Deliver all pending changes now.
    pub fn flush(&self) {
        let paths: Vec<String> = {
            let mut pending = self.inner.pending.lock();
            pending.flush_scheduled = false;
            pending.first_change = None;
            pending.last_change = None;
            std::mem::take(&mut pending.paths).into_iter().collect()
        };
        if paths.is_empty() || self.inner.closed.load(Ordering::Acquire) {
            return;
        }

        let targets: Vec<(String, ChangeListener)> = self
            .inner
            .listeners
            .read()
            .values()
            .map(|r| (r.base.clone(), r.listener.clone()))
            .collect();

        for (base, listener) in targets {
            let scoped: Vec<String> = if base == crate::path::ROOT {
                paths.clone()
            } else {
                paths.iter().filter(|p| in_scope(&base, p)).cloned().collect()
            };
            if scoped.is_empty() {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| listener(&scoped))).is_err() {
                warn!("Change listener for {} panicked; continuing with other listeners", base);
            }
        }
    }

    fn record_recent(&self, paths: &[String]) {
        let now = SystemTime::now();
        let mut recent = self.inner.recent.lock();
        for path in paths {
            recent.push_back((path.clone(), now));
            if recent.len() > RECENT_CHANGES_MAX_COUNT {
                recent.pop_front();
            }
        }
    }

    /// Paths reported within the trailing `window`, most recent first and
    /// without duplicates.
    pub fn changed_since(&self, window: Duration) -> Vec<String> {
        self.recent_changes(window)
            .into_iter()
            .map(|(path, _)| path)
            .collect()
    }

    /// Like [`ChangeNotifier::changed_since`], with the time of the latest
    /// report of each path.
    pub fn recent_changes(&self, window: Duration) -> Vec<(String, SystemTime)> {
        let since = SystemTime::now()
            .checked_sub(window)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let recent = self.inner.recent.lock();
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        for (path, at) in recent.iter().rev() {
            if *at < since {
                break;
            }
            if seen.insert(path.as_str()) {
                result.push((path.clone(), *at));
            }
        }
        result
    }

    /// Mark the notifier closed and call the close listeners once.
    ///
    /// Returns false if it was already closed.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let listeners: Vec<CloseListener> =
            self.inner.close_listeners.read().values().cloned().collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener())).is_err() {
                warn!("Close listener panicked");
            }
        }
        self.inner.listeners.write().clear();
        self.inner.close_listeners.write().clear();
        true
    }

    /// True once [`ChangeNotifier::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new()
    }
}
