//! Sync 1.5 request handlers.
//!
//! Split by resource: `info` for the read-only summaries, `collection`
//! for collection-level listing and bulk writes, `bso` for single-item
//! operations.  Shared plumbing (pool acquisition, collection id
//! resolution, protocol limits) lives here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;

use crate::errors::ApiError;
use crate::serialization::JSON;
use crate::storage::collection_name_ok;
use crate::user::UserHandler;
use crate::AppState;

pub mod bso;
pub mod collection;
pub mod info;

/// Maximum number of BSOs accepted in one POST.
pub const MAX_BSOS_PER_POST: usize = 100;

/// Maximum number of ids accepted in a collection GET filter.
pub const MAX_IDS_PER_GET: usize = 100;

/// Hard ceiling on the collection GET page size.
pub const MAX_BSO_GET_LIMIT: usize = 2500;

/// Wall clock in milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Fetch the user's handler from the pool.
pub(crate) async fn acquire(
    state: &AppState,
    uid: &str,
) -> Result<Arc<UserHandler>, ApiError> {
    let (handler, _created) = state
        .pool
        .acquire(uid)
        .await
        .map_err(|e| ApiError::Internal(e.into()))?;
    Ok(handler)
}

/// Resolve a collection name to its id, optionally creating it.
///
/// Returns `NotFound` for a missing collection when `automake` is off;
/// callers decide whether that becomes a 404 or an empty listing.
pub(crate) async fn collection_id(
    handler: &UserHandler,
    name: &str,
    automake: bool,
) -> Result<i64, ApiError> {
    if !collection_name_ok(name) {
        return Err(ApiError::InvalidCollectionName);
    }

    match handler.get_collection_id(name).await? {
        Some(cid) => Ok(cid),
        None if automake => Ok(handler.create_collection(name).await?),
        None => Err(ApiError::NotFound),
    }
}

/// The raw Accept value for shaping responses on routes that do not
/// enforce Accept validation (writes); defaults to JSON.
pub(crate) fn accept_or_json(headers: &HeaderMap) -> &str {
    headers
        .get("accept")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(JSON)
}

/// Parse a raw query string into a map, percent-decoding both sides.
pub(crate) fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Some(raw) = raw else {
        return map;
    };
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = part.split_once('=').unwrap_or((part, ""));
        map.insert(percent_decode(k), percent_decode(v));
    }
    map
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}
