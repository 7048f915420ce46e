//! Response shaping for the Sync 1.5 wire format.
//!
//! Clients choose between a single JSON document and newline-delimited
//! JSON via the `Accept` header; timestamps travel as two-decimal
//! seconds even though storage works in milliseconds.

use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

use crate::errors::ApiError;

/// Media type for newline-delimited JSON.
pub const NEWLINES: &str = "application/newlines";

/// Media type for plain JSON.
pub const JSON: &str = "application/json";

/// Render a millisecond timestamp as two-decimal seconds, the wire
/// format for `X-Last-Modified` and modification bodies.
pub fn modified_string(ms: u64) -> String {
    format!("{:.2}", ms as f64 / 1000.0)
}

/// Encode `value` per the negotiated `Accept` header.
///
/// `application/newlines` puts each element of an array value on its
/// own `\n`-terminated line; non-array values become one document plus
/// a trailing newline. Anything else gets a plain JSON document.
pub fn json_newline<T: Serialize>(accept: &str, value: &T) -> Result<Response, ApiError> {
    if accept == NEWLINES {
        newline(value)
    } else {
        json(value)
    }
}

/// One JSON document with `Content-Type: application/json`.
pub fn json<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let body = serde_json::to_string(value).map_err(|e| ApiError::Internal(e.into()))?;
    Ok(([(CONTENT_TYPE, JSON)], body).into_response())
}

/// Newline-delimited JSON with `Content-Type: application/newlines`.
pub fn newline<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let value = serde_json::to_value(value).map_err(|e| ApiError::Internal(e.into()))?;

    let mut body = String::new();
    match value {
        Value::Array(items) => {
            for item in items {
                body.push_str(&item.to_string());
                body.push('\n');
            }
        }
        other => {
            body.push_str(&other.to_string());
            body.push('\n');
        }
    }

    Ok(([(CONTENT_TYPE, NEWLINES)], body).into_response())
}
