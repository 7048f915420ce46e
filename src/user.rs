//! Per-user request handler.
//!
//! A [`UserHandler`] binds one uid to one open [`SyncDb`] and serialises
//! every operation behind a single mutex; reads and writes share the
//! lock since per-user traffic is low.  Because `rusqlite` calls block,
//! the connection lives in a `std::sync::Mutex` behind an `Arc` and
//! every database operation runs under `tokio::task::spawn_blocking`,
//! so a slow disk stalls only the blocking pool, never the async
//! workers.  Once stopped, a handler refuses all further work and the
//! pool replaces it on the next request for that uid.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::storage::{Bso, BsoInput, Page, PostResults, Sort, StorageError, SyncDb};

/// Failures from handler operations.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler was stopped (evicted or shut down) before or during
    /// the call.
    #[error("handler is stopped")]
    Stopped,

    /// The blocking storage task was cancelled or panicked.
    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// One user's live storage handle.
pub struct UserHandler {
    uid: String,
    stopped: AtomicBool,
    db: Arc<Mutex<Option<SyncDb>>>,
}

impl UserHandler {
    pub fn new(uid: impl Into<String>, db: SyncDb) -> Self {
        Self {
            uid: uid.into(),
            stopped: AtomicBool::new(false),
            db: Arc::new(Mutex::new(Some(db))),
        }
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    /// Whether this handler refuses new requests. Lock-free; the
    /// database lock remains the authority for in-flight work.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop servicing requests: mark stopped, drain the in-flight
    /// operation by taking the lock, and close the database.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let db = Arc::clone(&self.db);
        let uid = self.uid.clone();
        let _ = tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().expect("handler mutex poisoned");
            if guard.take().is_some() {
                debug!(uid = %uid, "user handler stopped");
            }
        })
        .await;
    }

    /// Run `op` against the database under the handler lock, on the
    /// blocking thread pool.
    async fn with_db<T>(
        &self,
        op: impl FnOnce(&mut SyncDb) -> Result<T, StorageError> + Send + 'static,
    ) -> Result<T, HandlerError>
    where
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().expect("handler mutex poisoned");
            let db = guard.as_mut().ok_or(HandlerError::Stopped)?;
            Ok(op(db)?)
        })
        .await?
    }

    // ── info ────────────────────────────────────────────────────────

    pub async fn info_collections(&self) -> Result<BTreeMap<String, u64>, HandlerError> {
        self.with_db(|db| db.info_collections()).await
    }

    pub async fn info_collection_counts(&self) -> Result<BTreeMap<String, u64>, HandlerError> {
        self.with_db(|db| db.info_collection_counts()).await
    }

    pub async fn info_collection_usage(&self) -> Result<BTreeMap<String, u64>, HandlerError> {
        self.with_db(|db| db.info_collection_usage()).await
    }

    // ── collections ─────────────────────────────────────────────────

    pub async fn get_collection_id(&self, name: &str) -> Result<Option<i64>, HandlerError> {
        let name = name.to_string();
        self.with_db(move |db| db.get_collection_id(&name)).await
    }

    pub async fn create_collection(&self, name: &str) -> Result<i64, HandlerError> {
        let name = name.to_string();
        self.with_db(move |db| db.create_collection(&name)).await
    }

    pub async fn delete_collection(&self, cid: i64) -> Result<(), HandlerError> {
        self.with_db(move |db| db.delete_collection(cid)).await
    }

    pub async fn delete_everything(&self) -> Result<(), HandlerError> {
        self.with_db(|db| db.delete_everything()).await
    }

    // ── BSOs ────────────────────────────────────────────────────────

    pub async fn get_bso(&self, cid: i64, bid: &str) -> Result<Option<Bso>, HandlerError> {
        let bid = bid.to_string();
        self.with_db(move |db| db.get_bso(cid, &bid)).await
    }

    pub async fn get_bsos(
        &self,
        cid: i64,
        ids: Vec<String>,
        newer: Option<u64>,
        sort: Sort,
        limit: usize,
        offset: usize,
    ) -> Result<Page, HandlerError> {
        self.with_db(move |db| db.get_bsos(cid, &ids, newer, sort, limit, offset))
            .await
    }

    pub async fn put_bso(
        &self,
        cid: i64,
        bid: &str,
        payload: Option<String>,
        sortindex: Option<i32>,
        ttl_ms: Option<u64>,
    ) -> Result<u64, HandlerError> {
        let bid = bid.to_string();
        self.with_db(move |db| db.put_bso(cid, &bid, payload.as_deref(), sortindex, ttl_ms))
            .await
    }

    pub async fn post_bsos(
        &self,
        cid: i64,
        items: Vec<BsoInput>,
    ) -> Result<PostResults, HandlerError> {
        self.with_db(move |db| db.post_bsos(cid, &items)).await
    }

    pub async fn delete_bso(&self, cid: i64, bid: &str) -> Result<u64, HandlerError> {
        let bid = bid.to_string();
        self.with_db(move |db| db.delete_bso(cid, &bid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> UserHandler {
        UserHandler::new("42", SyncDb::open(":memory:").unwrap())
    }

    #[tokio::test]
    async fn test_operations_flow_through() {
        let h = handler();
        let modified = h
            .put_bso(7, "aaa", Some("hi".into()), None, None)
            .await
            .unwrap();
        let bso = h.get_bso(7, "aaa").await.unwrap().unwrap();
        assert_eq!(bso.modified, modified);
        assert_eq!(h.info_collections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_rejects_further_operations() {
        let h = handler();
        assert!(!h.is_stopped());

        h.stop().await;
        assert!(h.is_stopped());
        assert!(matches!(
            h.get_bso(7, "aaa").await,
            Err(HandlerError::Stopped)
        ));
        assert!(matches!(
            h.put_bso(7, "aaa", None, None, None).await,
            Err(HandlerError::Stopped)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = handler();
        h.stop().await;
        h.stop().await;
        assert!(h.is_stopped());
    }
}
