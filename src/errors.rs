//! Request-level error types.
//!
//! Every variant maps to a Sync 1.5 HTTP status.  The enum implements
//! [`axum::response::IntoResponse`] so handlers can simply return
//! `Err(ApiError::NotFound)`.  Internal causes are logged and never
//! leak to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

/// Errors surfaced to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    /// A query parameter failed validation.
    #[error("{message}")]
    InvalidQuery { message: String },

    /// A BSO id failed validation.
    #[error("Invalid bso id {id}")]
    InvalidBsoId { id: String },

    /// A collection name failed validation.
    #[error("Invalid collection name")]
    InvalidCollectionName,

    /// The request body was not valid JSON.
    #[error("{message}")]
    InvalidJson { message: String },

    /// More than 100 ids were supplied on a collection GET.
    #[error("Too many ids provided")]
    TooManyIds,

    /// More than 100 BSOs were posted in one request.
    #[error("Exceeded {max} BSO per request")]
    TooManyBsos { max: usize },

    /// A BSO payload exceeded the maximum size.
    #[error("Request Entity Too Large")]
    PayloadTooBig,

    /// The Hawk Authorization header could not be parsed.
    #[error("Malformed hawk header, field: {field}, err: {message}")]
    MalformedHawk { field: String, message: String },

    /// Hawk authentication failed: bad MAC, bad payload hash, or stale
    /// timestamp. Carries `WWW-Authenticate: Hawk`.
    #[error("{message}")]
    HawkUnauthorized { message: String },

    /// The bearer token did not validate against any configured secret.
    #[error("Invalid token: {message}")]
    InvalidToken { message: String },

    /// A payload hash was declared but the Content-Type header is missing.
    #[error("Content-Type missing")]
    MissingContentType,

    /// The Accept header requested an unsupported representation.
    #[error("Not Acceptable")]
    NotAcceptable,

    /// The Content-Type of a POST body is unsupported.
    #[error("Not acceptable Content-Type")]
    UnsupportedMediaType,

    /// Unknown BSO or collection on a single-item route.
    #[error("Not Found")]
    NotFound,

    /// The endpoint exists in the protocol but has no implementation yet.
    #[error("Not implemented")]
    NotImplemented,

    /// Catch-all for storage and I/O failures.
    #[error("Internal Server Error")]
    Internal(#[from] anyhow::Error),
}

impl From<crate::user::HandlerError> for ApiError {
    fn from(err: crate::user::HandlerError) -> Self {
        use crate::storage::StorageError;
        use crate::user::HandlerError;

        match err {
            HandlerError::Storage(StorageError::NotFound) => ApiError::NotFound,
            HandlerError::Storage(StorageError::PayloadTooBig) => ApiError::PayloadTooBig,
            HandlerError::Storage(err @ StorageError::Db(_)) => {
                ApiError::Internal(anyhow::Error::new(err))
            }
            HandlerError::Stopped => {
                ApiError::Internal(anyhow::Error::new(HandlerError::Stopped))
            }
            HandlerError::Task(err) => ApiError::Internal(anyhow::Error::new(err)),
        }
    }
}

impl ApiError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidQuery { .. } => StatusCode::BAD_REQUEST,
            ApiError::InvalidBsoId { .. } => StatusCode::BAD_REQUEST,
            ApiError::InvalidCollectionName => StatusCode::BAD_REQUEST,
            ApiError::InvalidJson { .. } => StatusCode::BAD_REQUEST,
            ApiError::TooManyIds => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::TooManyBsos { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::PayloadTooBig => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::MalformedHawk { .. } => StatusCode::BAD_REQUEST,
            ApiError::HawkUnauthorized { .. } => StatusCode::UNAUTHORIZED,
            ApiError::InvalidToken { .. } => StatusCode::BAD_REQUEST,
            ApiError::MissingContentType => StatusCode::BAD_REQUEST,
            ApiError::NotAcceptable => StatusCode::NOT_ACCEPTABLE,
            ApiError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(ref cause) = self {
            error!("internal error: {cause:#}");
        }

        let status = self.status_code();
        let body = self.to_string();

        if matches!(self, ApiError::HawkUnauthorized { .. }) {
            return (
                status,
                [
                    ("content-type", "text/plain; charset=utf-8"),
                    ("www-authenticate", "Hawk"),
                ],
                body,
            )
                .into_response();
        }

        (
            status,
            [("content-type", "text/plain; charset=utf-8")],
            body,
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(ApiError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::PayloadTooBig.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ApiError::HawkUnauthorized {
                message: "bad mac".into()
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::NotImplemented.status_code(),
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[test]
    fn test_internal_error_hides_cause() {
        let err = ApiError::Internal(anyhow::anyhow!("sqlite disk I/O error"));
        // Client-visible text must never include the underlying cause.
        assert_eq!(err.to_string(), "Internal Server Error");
    }
}
