//! Per-user storage engine: types and validation.
//!
//! Each user owns one SQLite database (see [`sqlite::SyncDb`]) holding
//! named collections of BSOs.  The types here are shared between the
//! database layer and the HTTP handlers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SyncDb;

/// Maximum size of a single BSO payload in bytes.
pub const MAX_BSO_PAYLOAD_SIZE: usize = 256 * 1024;

/// A Basic Storage Object as returned to clients.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Bso {
    pub id: String,
    /// Last-write time in milliseconds since epoch.
    pub modified: u64,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i32>,
}

/// A BSO as posted by clients; every field may be omitted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BsoInput {
    pub id: Option<String>,
    pub payload: Option<String>,
    pub sortindex: Option<i32>,
    /// Time-to-live in milliseconds (already converted from the wire's
    /// seconds by the handler layer).
    pub ttl: Option<u64>,
}

/// Sort order for collection listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sort {
    /// Descending `modified`.
    Newest,
    /// Ascending `modified`.
    Oldest,
    /// Descending `sortindex`, missing values last.
    Index,
}

/// One page of a collection listing.
#[derive(Debug, Clone)]
pub struct Page {
    pub bsos: Vec<Bso>,
    /// Rows matching the filter before pagination.
    pub total: usize,
    /// Whether rows remain past this page.
    pub more: bool,
    /// Offset to request for the next page; meaningful only when `more`.
    pub next_offset: usize,
}

/// Outcome of a bulk POST.
#[derive(Debug, Clone, Default)]
pub struct PostResults {
    /// Collection modified timestamp in ms.
    pub modified: u64,
    pub success: Vec<String>,
    pub failed: BTreeMap<String, Vec<String>>,
}

/// Storage-level failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The BSO or collection does not exist.
    #[error("not found")]
    NotFound,

    /// A payload exceeded [`MAX_BSO_PAYLOAD_SIZE`].
    #[error("payload too big")]
    PayloadTooBig,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

/// Validate a BSO id: 1–64 bytes of printable URL-safe ASCII.
pub fn bso_id_ok(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id.bytes().all(|b| b.is_ascii_graphic() && b != b'/')
}

/// Validate a collection name: `^[A-Za-z0-9_-]{1,32}$`.
pub fn collection_name_ok(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
