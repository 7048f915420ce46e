//! Collection-level handlers: listing, bulk upsert, deletion, and the
//! whole-account delete.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Extension, Path, RawQuery, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::auth::{negotiate_accept, AuthUid};
use crate::errors::ApiError;
use crate::serialization::{json_newline, modified_string, JSON};
use crate::storage::{bso_id_ok, BsoInput, Sort, MAX_BSO_PAYLOAD_SIZE};
use crate::AppState;

use super::{
    accept_or_json, acquire, collection_id, now_ms, parse_query, MAX_BSOS_PER_POST,
    MAX_BSO_GET_LIMIT, MAX_IDS_PER_GET,
};

fn invalid(message: &str) -> ApiError {
    ApiError::InvalidQuery {
        message: message.to_string(),
    }
}

// ── GET /1.5/{uid}/storage/{collection} ─────────────────────────────

/// List BSOs in a collection: ids by default, full objects with
/// `?full`. An unknown collection is an empty list, not a 404.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    Path((_uid, collection)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = negotiate_accept(&headers)?;
    let query = parse_query(raw_query.as_deref());

    let mut ids: Vec<String> = Vec::new();
    if let Some(raw) = query.get("ids").filter(|v| !v.is_empty()) {
        for id in raw.split(',') {
            let id = id.trim();
            if !bso_id_ok(id) {
                return Err(ApiError::InvalidBsoId { id: id.to_string() });
            }
            ids.push(id.to_string());
        }
        if ids.len() > MAX_IDS_PER_GET {
            return Err(ApiError::TooManyIds);
        }
    }

    // Clients send two-decimal-second timestamps; storage filters in ms.
    let mut newer = None;
    if let Some(raw) = query.get("newer").filter(|v| !v.is_empty()) {
        let seconds: f64 = raw
            .parse()
            .map_err(|_| invalid("Invalid newer param format"))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(invalid("Invalid newer value"));
        }
        newer = Some((seconds * 1000.0) as u64);
    }

    let full = query.contains_key("full");

    let max_limit = state.max_bso_get_limit.min(MAX_BSO_GET_LIMIT);
    let mut limit = max_limit;
    if let Some(raw) = query.get("limit").filter(|v| !v.is_empty()) {
        let parsed: usize = raw.parse().map_err(|_| invalid("Invalid limit value"))?;
        if parsed > 0 {
            limit = parsed.min(max_limit);
        }
    }

    let mut offset = 0;
    if let Some(raw) = query.get("offset").filter(|v| !v.is_empty()) {
        offset = raw.parse().map_err(|_| invalid("Invalid offset value"))?;
    }

    let sort = match query.get("sort").map(String::as_str) {
        None | Some("") | Some("newest") => Sort::Newest,
        Some("oldest") => Sort::Oldest,
        Some("index") => Sort::Index,
        Some(_) => return Err(invalid("Invalid sort value")),
    };

    let handler = acquire(&state, &uid).await?;
    let cid = match collection_id(&handler, &collection, false).await {
        Ok(cid) => cid,
        Err(ApiError::NotFound) => {
            return Ok(([("content-type", JSON)], "[]").into_response());
        }
        Err(err) => return Err(err),
    };

    let page = handler.get_bsos(cid, ids, newer, sort, limit, offset).await?;

    let mut resp = if full {
        json_newline(accept, &page.bsos)?
    } else {
        let ids: Vec<&str> = page.bsos.iter().map(|b| b.id.as_str()).collect();
        json_newline(accept, &ids)?
    };

    let headers = resp.headers_mut();
    headers.insert(
        "x-weave-records",
        HeaderValue::from_str(&page.total.to_string()).unwrap(),
    );
    if page.more {
        headers.insert(
            "x-weave-next-offset",
            HeaderValue::from_str(&page.next_offset.to_string()).unwrap(),
        );
    }

    Ok(resp)
}

// ── POST /1.5/{uid}/storage/{collection} ────────────────────────────

/// Wire shape of the bulk POST response.
#[derive(Debug, Serialize)]
struct PostResponse {
    modified: String,
    success: Vec<String>,
    failed: BTreeMap<String, Vec<String>>,
}

/// Bulk upsert. Items that fail validation or insertion are reported
/// under `failed`; the request itself only fails for malformed bodies
/// or protocol limits.
pub async fn post(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    Path((_uid, collection)): Path<(String, String)>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim().to_lowercase())
        .unwrap_or_default();

    let items = match content_type.as_str() {
        // text/plain is accepted for old clients that sent JSON under it.
        "application/json" | "text/plain" => {
            serde_json::from_slice::<Vec<BsoInput>>(&body).map_err(|_| ApiError::InvalidJson {
                message: "Invalid JSON posted".to_string(),
            })?
        }
        "application/newlines" => parse_newline_body(&body)?,
        _ => return Err(ApiError::UnsupportedMediaType),
    };

    if items.len() > MAX_BSOS_PER_POST {
        return Err(ApiError::TooManyBsos {
            max: MAX_BSOS_PER_POST,
        });
    }

    // Per-item validation: failures are reported, not fatal.
    let mut failed: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut valid = Vec::with_capacity(items.len());
    for mut item in items {
        let id = item.id.clone().unwrap_or_default();
        if !bso_id_ok(&id) {
            failed.entry(id).or_default().push("invalid id".to_string());
            continue;
        }
        if item.payload.as_ref().map_or(0, String::len) > MAX_BSO_PAYLOAD_SIZE {
            failed
                .entry(id)
                .or_default()
                .push(format!("payload greater than max of {MAX_BSO_PAYLOAD_SIZE} bytes"));
            continue;
        }
        // Clients send TTL seconds; storage wants ms.
        item.ttl = item.ttl.map(|seconds| seconds * 1000);
        valid.push(item);
    }

    let handler = acquire(&state, &uid).await?;
    let cid = collection_id(&handler, &collection, true).await?;

    let results = handler.post_bsos(cid, valid).await?;
    failed.extend(results.failed);

    let modified = modified_string(results.modified);
    let mut resp = json_newline(
        accept_or_json(&headers),
        &PostResponse {
            modified: modified.clone(),
            success: results.success,
            failed,
        },
    )?;
    resp.headers_mut().insert(
        "x-last-modified",
        HeaderValue::from_str(&modified).unwrap(),
    );
    Ok(resp)
}

/// Parse an `application/newlines` body: one BSO object per line,
/// blank lines skipped.
fn parse_newline_body(body: &[u8]) -> Result<Vec<BsoInput>, ApiError> {
    let mut items = Vec::new();
    for (i, line) in body.split(|b| *b == b'\n').enumerate() {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let item = serde_json::from_slice::<BsoInput>(line).map_err(|err| {
            ApiError::InvalidJson {
                message: format!("Invalid JSON posted for item: {i}, {err}"),
            }
        })?;
        items.push(item);
    }
    Ok(items)
}

// ── DELETE /1.5/{uid}/storage/{collection} ──────────────────────────

/// Delete a collection and its contents. Idempotent: deleting a
/// collection that does not exist is still a 200.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    Path((_uid, collection)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let handler = acquire(&state, &uid).await?;

    match collection_id(&handler, &collection, false).await {
        Ok(cid) => handler.delete_collection(cid).await?,
        Err(ApiError::NotFound) => {}
        Err(err) => return Err(err),
    }

    Ok((
        StatusCode::OK,
        [
            ("content-type", "text/plain; charset=utf-8".to_string()),
            ("x-last-modified", modified_string(now_ms())),
        ],
        "ok",
    )
        .into_response())
}

// ── DELETE /1.5/{uid} and /1.5/{uid}/storage ────────────────────────

/// Drop every collection and BSO the user owns.
pub async fn delete_everything(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
) -> Result<Response, ApiError> {
    let handler = acquire(&state, &uid).await?;
    handler.delete_everything().await?;

    let modified = modified_string(now_ms());
    Ok((
        StatusCode::OK,
        [
            ("content-type", "text/plain; charset=utf-8".to_string()),
            ("x-last-modified", modified.clone()),
        ],
        modified,
    )
        .into_response())
}
