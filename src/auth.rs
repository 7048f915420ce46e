//! Hawk authentication middleware.
//!
//! Runs before the Sync handlers. Parses the Hawk Authorization
//! header, validates the bearer token against every configured secret
//! (first success wins), verifies the request MAC with the
//! token-derived key, and checks the payload hash when one was signed.
//! The authenticated uid comes from the token, never from the URL --
//! except in test mode, where Hawk is disabled and the URL uid is
//! trusted.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::Response;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::hawk;
use crate::serialization::{JSON, NEWLINES};
use crate::token::Token;
use crate::AppState;

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/__heartbeat__"];

/// The authenticated uid, inserted into request extensions for the
/// handlers.
#[derive(Debug, Clone)]
pub struct AuthUid(pub String);

/// Hawk authentication middleware.
pub async fn hawk_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let path = req.uri().path().to_string();

    // Only the /1.5/ subtree is authenticated; the heartbeat and any
    // unrouted path fall through to the router.
    if AUTH_SKIP_PATHS.contains(&path.as_str()) || !path.starts_with("/1.5/") {
        return Ok(next.run(req).await);
    }

    // Test mode: no Hawk, trust the uid in the URL.
    if state.hawk_disabled {
        let uid = uid_from_path(&path).ok_or_else(|| ApiError::InvalidQuery {
            message: "do not have a uid to work with".to_string(),
        })?;
        debug!(uid, "hawk disabled, using url uid");
        req.extensions_mut().insert(AuthUid(uid.to_string()));
        return Ok(next.run(req).await);
    }

    // Step 1: parse the Hawk header. Field-level problems are the
    // client's fault (400); a missing or foreign scheme is a plain
    // authentication failure (401).
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::HawkUnauthorized {
            message: "missing Authorization header".to_string(),
        })?;

    let auth = hawk::HawkHeader::parse(header).map_err(|err| {
        if err.field == "scheme" {
            ApiError::HawkUnauthorized {
                message: err.to_string(),
            }
        } else {
            ApiError::MalformedHawk {
                field: err.field,
                message: err.message,
            }
        }
    })?;

    // Step 2: extract and verify the token, trying each secret in turn.
    let token = Token::parse_any(&state.secrets, &auth.id).map_err(|err| {
        debug!("token rejected: {err}");
        ApiError::InvalidToken {
            message: err.to_string(),
        }
    })?;

    // Step 3: verify the request MAC under the token-derived key.
    let (host, port) = req
        .headers()
        .get("host")
        .and_then(|v| v.to_str().ok())
        .map(hawk::split_host_port)
        .unwrap_or_else(|| ("localhost".to_string(), 80));

    let resource = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or(path);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    if !auth.verify(
        &token.derived_secret,
        req.method().as_str(),
        &resource,
        &host,
        port,
        now,
    ) {
        warn!(uid = token.uid, "hawk MAC invalid");
        return Err(ApiError::HawkUnauthorized {
            message: "Hawk MAC invalid".to_string(),
        });
    }

    // Step 4: validate the payload hash if the client signed one.
    if let Some(expected_hash) = auth.hash.as_deref() {
        let (parts, body) = req.into_parts();
        let body_bytes = axum::body::to_bytes(body, usize::MAX)
            .await
            .map_err(|e| ApiError::Internal(e.into()))?;

        if !body_bytes.is_empty() {
            let content_type = parts
                .headers
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::MissingContentType)?;

            let computed = hawk::payload_hash(content_type, &body_bytes);
            if computed != expected_hash {
                warn!(uid = token.uid, "hawk payload hash invalid");
                return Err(ApiError::HawkUnauthorized {
                    message: "Hawk error, payload hash invalid".to_string(),
                });
            }
        }

        // Hand the handlers a re-readable body.
        req = Request::from_parts(parts, axum::body::Body::from(body_bytes));
    }

    // Step 5: the token names the uid.
    req.extensions_mut()
        .insert(AuthUid(token.uid.to_string()));
    Ok(next.run(req).await)
}

/// Negotiate the response representation from the `Accept` header.
///
/// Absent defaults to JSON; anything else must name one of the two
/// supported media types exactly.
pub fn negotiate_accept(headers: &HeaderMap) -> Result<&'static str, ApiError> {
    match headers.get("accept").and_then(|v| v.to_str().ok()) {
        None | Some("") => Ok(JSON),
        Some(JSON) => Ok(JSON),
        Some(NEWLINES) => Ok(NEWLINES),
        Some(_) => Err(ApiError::NotAcceptable),
    }
}

/// Extract the `{uid}` segment from a `/1.5/{uid}/...` path.
///
/// The uid must be all decimal digits, the same grammar the routes
/// declare; anything else (including `..`) is rejected before it can
/// reach the pool's path fan-out.
fn uid_from_path(path: &str) -> Option<&str> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    match segments.next() {
        Some("1.5") => segments
            .next()
            .filter(|uid| !uid.is_empty() && uid.bytes().all(|b| b.is_ascii_digit())),
        _ => None,
    }
}
