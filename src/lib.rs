//! Syncstore library -- Firefox Sync 1.5 storage engine.
//!
//! This crate provides the components for running a Sync 1.5 storage
//! server: Hawk request authentication with rotating token secrets, a
//! bounded LRU pool of per-user SQLite handlers, and the collection /
//! BSO request surface.

use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod hawk;
pub mod lru;
pub mod pool;
pub mod serialization;
pub mod server;
pub mod storage;
pub mod token;
pub mod user;

use crate::config::Config;
use crate::pool::Pool;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Pre-shared token secrets, in rotation order.
    pub secrets: Vec<String>,
    /// The per-user handler pool.
    pub pool: Arc<Pool>,
    /// Skip Hawk verification and trust the URL uid (tests only).
    pub hawk_disabled: bool,
    /// Upper bound on the collection GET page size.
    pub max_bso_get_limit: usize,
}

impl AppState {
    /// Build the state for a configured server.
    pub fn new(config: &Config, pool: Arc<Pool>) -> Self {
        Self {
            secrets: config.secrets.clone(),
            pool,
            hawk_disabled: false,
            max_bso_get_limit: handlers::MAX_BSO_GET_LIMIT,
        }
    }
}
