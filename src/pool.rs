//! Handler pool: an LRU cache of live user handlers.
//!
//! The pool opens a user's database on first request, keeps the handler
//! warm for subsequent requests, and closes it again when the pool
//! outgrows its size bound or the handler sits idle past the TTL.  The
//! pool mutex guards only the map and LRU list; databases are opened
//! and handlers stopped outside it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::lru::LruList;
use crate::storage::{StorageError, SyncDb};
use crate::user::UserHandler;

/// Failures while creating a handler.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The uid is not a decimal string. Non-numeric uids could walk out
    /// of the datadir through the fan-out path.
    #[error("invalid uid: {uid}")]
    InvalidUid { uid: String },

    #[error("could not create datadir: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not open database: {0}")]
    Storage(#[from] StorageError),
}

/// Where user databases live.
enum BasePath {
    /// Every handler opens a fresh in-memory database (tests).
    Memory,
    /// File-backed databases fanned out under this directory.
    Dir(PathBuf),
}

struct Element {
    handler: Arc<UserHandler>,
    node: usize,
    last_used: Instant,
}

#[derive(Default)]
struct PoolInner {
    elements: HashMap<String, Element>,
    lru: LruList,
}

/// LRU cache of user handlers, bounded by `max_pool_size`.
pub struct Pool {
    base: BasePath,
    max_pool_size: usize,
    inner: Mutex<PoolInner>,
}

impl Pool {
    /// Create a pool rooted at `datadir` (or `":memory:"`).
    pub fn new(datadir: &str, max_pool_size: usize) -> Self {
        let base = if datadir == ":memory:" {
            BasePath::Memory
        } else {
            BasePath::Dir(PathBuf::from(datadir))
        };
        Self {
            base,
            max_pool_size,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        self.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("pool mutex poisoned")
    }

    /// Fetch the handler for `uid`, creating it if absent or stopped.
    ///
    /// Returns the handler and whether it was newly created.
    pub async fn acquire(&self, uid: &str) -> Result<(Arc<UserHandler>, bool), PoolError> {
        if let Some(handler) = self.touch_existing(uid) {
            return Ok((handler, false));
        }

        // Open the database outside the pool lock; opening can hit disk.
        let db_file = self.db_file(uid)?;
        let db = SyncDb::open(&db_file)?;
        let handler = Arc::new(UserHandler::new(uid, db));

        let over_capacity = {
            let mut guard = self.lock();
            let inner = &mut *guard;

            // Another worker may have created the handler while we were
            // opening the database; prefer the one already in the pool.
            if let Some(existing) = inner.elements.get_mut(uid) {
                if !existing.handler.is_stopped() {
                    existing.last_used = Instant::now();
                    let node = existing.node;
                    let handler = existing.handler.clone();
                    inner.lru.move_to_front(node);
                    return Ok((handler, false));
                }
                let node = existing.node;
                inner.lru.remove(node);
                inner.elements.remove(uid);
            }

            let node = inner.lru.push_front(uid.to_string());
            inner.elements.insert(
                uid.to_string(),
                Element {
                    handler: handler.clone(),
                    node,
                    last_used: Instant::now(),
                },
            );
            inner.elements.len() > self.max_pool_size
        };

        debug!(uid, file = %db_file, "opened user database");

        if over_capacity {
            self.cleanup(self.max_pool_size.div_ceil(10)).await;
        }

        Ok((handler, true))
    }

    fn touch_existing(&self, uid: &str) -> Option<Arc<UserHandler>> {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let element = inner.elements.get_mut(uid)?;

        if element.handler.is_stopped() {
            // Purge the corpse; the caller falls through to creation.
            let node = element.node;
            inner.lru.remove(node);
            inner.elements.remove(uid);
            return None;
        }

        element.last_used = Instant::now();
        let node = element.node;
        let handler = element.handler.clone();
        inner.lru.move_to_front(node);
        Some(handler)
    }

    /// Evict up to `max_clean` handlers from the LRU back.
    ///
    /// Victims are unlinked under the lock and stopped outside it so a
    /// slow drain never blocks unrelated acquires.
    pub async fn cleanup(&self, max_clean: usize) {
        let victims = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut victims = Vec::new();
            for _ in 0..max_clean {
                let Some(uid) = inner.lru.pop_back() else {
                    break;
                };
                if let Some(element) = inner.elements.remove(&uid) {
                    victims.push(element.handler);
                }
            }
            victims
        };

        for handler in victims {
            debug!(uid = handler.uid(), "evicting user handler");
            handler.stop().await;
        }
    }

    /// Evict every handler idle longer than `ttl`.
    pub async fn reap_idle(&self, ttl: Duration) {
        let victims = {
            let mut guard = self.lock();
            let inner = &mut *guard;
            let mut victims = Vec::new();
            loop {
                let Some(uid) = inner.lru.back().map(str::to_string) else {
                    break;
                };
                let idle = inner
                    .elements
                    .get(&uid)
                    .map(|e| e.last_used.elapsed())
                    .unwrap_or_default();
                if idle <= ttl {
                    break;
                }
                inner.lru.pop_back();
                if let Some(element) = inner.elements.remove(&uid) {
                    victims.push(element.handler);
                }
            }
            victims
        };

        for handler in victims {
            debug!(uid = handler.uid(), "reaping idle user handler");
            handler.stop().await;
        }
    }

    /// Stop every handler. Called on shutdown after the listener closes.
    pub async fn stop_all(&self) {
        let n = self.len();
        self.cleanup(n).await;
    }

    /// Spawn the background idle reaper. It wakes at half the TTL and
    /// exits when `shutdown` flips.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        ttl: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        let period = (ttl / 2).max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => pool.reap_idle(ttl).await,
                    _ = shutdown.changed() => {
                        debug!("idle reaper shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Check the structural invariants: the element map and the LRU
    /// list hold exactly the same uids, each at most once, and no
    /// resting element is stopped.
    #[cfg(test)]
    fn assert_invariants(&self) {
        let inner = self.lock();
        assert_eq!(inner.elements.len(), inner.lru.len());

        let mut seen = std::collections::HashSet::new();
        for uid in inner.lru.iter() {
            assert!(seen.insert(uid.to_string()), "uid {uid} twice in LRU");
            let element = inner.elements.get(uid).expect("LRU uid missing from map");
            assert!(!element.handler.is_stopped());
        }
    }

    /// Resolve the database file for `uid`, creating the fan-out
    /// directories as needed. The uid must be all decimal digits.
    fn db_file(&self, uid: &str) -> Result<String, PoolError> {
        if uid.is_empty() || !uid.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PoolError::InvalidUid {
                uid: uid.to_string(),
            });
        }

        match &self.base {
            BasePath::Memory => Ok(":memory:".to_string()),
            BasePath::Dir(root) => {
                let mut dir = root.clone();
                for level in two_level_path(uid) {
                    dir.push(level);
                }
                if let Err(err) = std::fs::create_dir_all(&dir) {
                    warn!(uid, dir = %dir.display(), "could not create datadir: {err}");
                    return Err(err.into());
                }
                dir.push(format!("{uid}.db"));
                Ok(dir.to_string_lossy().into_owned())
            }
        }
    }
}

/// Fan-out subdirectories for a uid: its lowest digits, reversed, in
/// pairs. e.g. uid `123456` maps to `65/43/123456.db` under the datadir.
/// Reversing uses the highest-entropy digits so directories fill evenly
/// regardless of the uid range in play.
pub fn two_level_path(uid: &str) -> Vec<String> {
    let b = uid.as_bytes();
    let l = b.len();
    let pair = |hi: usize, lo: usize| String::from_utf8_lossy(&[b[hi], b[lo]]).into_owned();

    match l {
        l if l >= 4 => vec![pair(l - 1, l - 2), pair(l - 3, l - 4)],
        l if l >= 2 => vec![pair(l - 1, l - 2)],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── two_level_path ──────────────────────────────────────────────

    #[test]
    fn test_two_level_path() {
        assert_eq!(two_level_path("12345678"), ["87", "65"]);
        assert_eq!(two_level_path("123456"), ["65", "43"]);
        assert_eq!(two_level_path("1234"), ["43", "21"]);
        assert_eq!(two_level_path("123"), ["32"]);
        assert_eq!(two_level_path("12"), ["21"]);
        assert_eq!(two_level_path("1"), Vec::<String>::new());
        assert_eq!(two_level_path(""), Vec::<String>::new());
    }

    // ── acquire ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_acquire_creates_then_caches() {
        let pool = Pool::new(":memory:", 16);

        let (first, created) = pool.acquire("42").await.unwrap();
        assert!(created);

        let (second, created) = pool.acquire("42").await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_acquire_replaces_stopped_handler() {
        let pool = Pool::new(":memory:", 16);

        let (first, _) = pool.acquire("42").await.unwrap();
        first.stop().await;

        let (second, created) = pool.acquire("42").await.unwrap();
        assert!(created);
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!second.is_stopped());
        assert_eq!(pool.len(), 1);
        pool.assert_invariants();
    }

    #[tokio::test]
    async fn test_pool_size_stays_bounded() {
        let pool = Pool::new(":memory:", 3);

        let (first, _) = pool.acquire("1").await.unwrap();
        for uid in ["2", "3", "4"] {
            pool.acquire(uid).await.unwrap();
        }

        // Exceeding the bound trims ~10% from the LRU back.
        assert!(pool.len() <= 3);
        assert!(first.is_stopped());
        pool.assert_invariants();
    }

    #[tokio::test]
    async fn test_eviction_preserves_data_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(dir.path().to_str().unwrap(), 2);

        let (handler, _) = pool.acquire("1234").await.unwrap();
        let modified = handler
            .put_bso(7, "aaa", Some("kept".into()), None, None)
            .await
            .unwrap();

        // Push two more users through to evict uid 1234.
        pool.acquire("5678").await.unwrap();
        pool.acquire("9999").await.unwrap();
        assert!(handler.is_stopped());

        // Reopening finds the previously written BSO.
        let (reopened, created) = pool.acquire("1234").await.unwrap();
        assert!(created);
        let bso = reopened.get_bso(7, "aaa").await.unwrap().unwrap();
        assert_eq!(bso.payload, "kept");
        assert_eq!(bso.modified, modified);
    }

    #[tokio::test]
    async fn test_acquire_rejects_non_numeric_uid() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(dir.path().to_str().unwrap(), 4);

        for uid in ["..", "a1", "12/34", ""] {
            assert!(
                matches!(pool.acquire(uid).await, Err(PoolError::InvalidUid { .. })),
                "uid {uid:?} should be rejected"
            );
        }
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_db_files_follow_two_level_path() {
        let dir = tempfile::tempdir().unwrap();
        let pool = Pool::new(dir.path().to_str().unwrap(), 4);

        pool.acquire("12345678").await.unwrap();
        assert!(dir.path().join("87/65/12345678.db").exists());
    }

    // ── reaping / shutdown ──────────────────────────────────────────

    #[tokio::test]
    async fn test_reap_idle_stops_cold_handlers() {
        let pool = Pool::new(":memory:", 16);
        let (handler, _) = pool.acquire("42").await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.reap_idle(Duration::from_millis(1)).await;

        assert_eq!(pool.len(), 0);
        assert!(handler.is_stopped());
    }

    #[tokio::test]
    async fn test_reap_idle_keeps_warm_handlers() {
        let pool = Pool::new(":memory:", 16);
        let (handler, _) = pool.acquire("42").await.unwrap();

        pool.reap_idle(Duration::from_secs(300)).await;

        assert_eq!(pool.len(), 1);
        assert!(!handler.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_all() {
        let pool = Pool::new(":memory:", 16);
        let mut handlers = Vec::new();
        for uid in ["1", "2", "3"] {
            handlers.push(pool.acquire(uid).await.unwrap().0);
        }

        pool.stop_all().await;

        assert!(pool.is_empty());
        assert!(handlers.iter().all(|h| h.is_stopped()));
    }
}
