//! Read-only per-user summaries: `/1.5/{uid}/info/*`.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

use crate::auth::{negotiate_accept, AuthUid};
use crate::errors::ApiError;
use crate::serialization::json_newline;
use crate::AppState;

use super::acquire;

/// `GET /1.5/{uid}/info/collections` -- collection name to last
/// modified ms.
pub async fn collections(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = negotiate_accept(&headers)?;
    let handler = acquire(&state, &uid).await?;
    let info = handler.info_collections().await?;
    json_newline(accept, &info)
}

/// `GET /1.5/{uid}/info/collection_counts` -- collection name to live
/// BSO count.
pub async fn collection_counts(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = negotiate_accept(&headers)?;
    let handler = acquire(&state, &uid).await?;
    let counts = handler.info_collection_counts().await?;
    json_newline(accept, &counts)
}

/// `GET /1.5/{uid}/info/collection_usage` -- collection name to
/// payload kilobytes, per the Sync 1.5 convention.
pub async fn collection_usage(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = negotiate_accept(&headers)?;
    let handler = acquire(&state, &uid).await?;

    let usage: BTreeMap<String, f64> = handler
        .info_collection_usage()
        .await?
        .into_iter()
        .map(|(name, bytes)| (name, bytes as f64 / 1024.0))
        .collect();
    json_newline(accept, &usage)
}

/// `GET /1.5/{uid}/info/quota` -- no quota policy exists yet.
pub async fn quota() -> ApiError {
    ApiError::NotImplemented
}

/// `GET /1.5/{uid}/echo-uid` -- echo the authenticated uid; a testing
/// aid for verifying uid extraction end to end.
pub async fn echo_uid(
    Extension(AuthUid(uid)): Extension<AuthUid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    negotiate_accept(&headers)?;
    Ok((
        [("content-type", "text/plain; charset=utf-8")],
        uid,
    )
        .into_response())
}
