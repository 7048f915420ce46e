//! Single-BSO handlers: `/1.5/{uid}/storage/{collection}/{bsoId}`.

use std::sync::Arc;

use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::auth::{negotiate_accept, AuthUid};
use crate::errors::ApiError;
use crate::serialization::{json_newline, modified_string};
use crate::storage::{bso_id_ok, BsoInput};
use crate::AppState;

use super::{acquire, collection_id};

fn check_bso_id(id: &str) -> Result<(), ApiError> {
    if bso_id_ok(id) {
        Ok(())
    } else {
        Err(ApiError::InvalidBsoId { id: id.to_string() })
    }
}

/// A 200 whose body is the modified timestamp, mirrored in
/// `X-Last-Modified`.
fn modified_response(modified: u64) -> Response {
    let m = modified_string(modified);
    (
        StatusCode::OK,
        [
            ("content-type", "text/plain; charset=utf-8".to_string()),
            ("x-last-modified", m.clone()),
        ],
        m,
    )
        .into_response()
}

/// `GET /1.5/{uid}/storage/{collection}/{bsoId}`.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    Path((_uid, collection, bso_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let accept = negotiate_accept(&headers)?;
    check_bso_id(&bso_id)?;

    let handler = acquire(&state, &uid).await?;
    let cid = collection_id(&handler, &collection, false).await?;
    let bso = handler.get_bso(cid, &bso_id).await?.ok_or(ApiError::NotFound)?;

    json_newline(accept, &bso)
}

/// `PUT /1.5/{uid}/storage/{collection}/{bsoId}` -- upsert one BSO.
///
/// The body is `{payload?, sortindex?, ttl?}` with TTL in seconds.
/// Responds with the new modified timestamp as plain text.
pub async fn put(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    Path((_uid, collection, bso_id)): Path<(String, String, String)>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    check_bso_id(&bso_id)?;

    let input: BsoInput = serde_json::from_slice(&body).map_err(|_| ApiError::InvalidJson {
        message: "Invalid JSON".to_string(),
    })?;

    let handler = acquire(&state, &uid).await?;
    let cid = collection_id(&handler, &collection, true).await?;

    let modified = handler
        .put_bso(
            cid,
            &bso_id,
            input.payload,
            input.sortindex,
            input.ttl.map(|seconds| seconds * 1000),
        )
        .await?;

    Ok(modified_response(modified))
}

/// `DELETE /1.5/{uid}/storage/{collection}/{bsoId}`.
pub async fn delete(
    State(state): State<Arc<AppState>>,
    Extension(AuthUid(uid)): Extension<AuthUid>,
    Path((_uid, collection, bso_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    check_bso_id(&bso_id)?;

    let handler = acquire(&state, &uid).await?;
    let cid = collection_id(&handler, &collection, false).await?;
    let modified = handler.delete_bso(cid, &bso_id).await?;

    Ok(modified_response(modified))
}
