//! Axum router construction and Sync 1.5 route mapping.
//!
//! The [`app`] function wires the Sync 1.5 URL grammar to its handlers
//! and returns a ready-to-serve [`axum::Router`].  Authentication runs
//! as a middleware layer around every route except the heartbeat.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::Router;

use crate::auth;
use crate::handlers::{bso, collection, info};
use crate::AppState;

/// Build the axum [`Router`] with all Sync 1.5 routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // Liveness probe; the only unauthenticated route.
        .route("/__heartbeat__", get(heartbeat))
        // Whole-account delete, with and without the /storage suffix.
        .route("/1.5/:uid", delete(collection::delete_everything))
        .route("/1.5/:uid/storage", delete(collection::delete_everything))
        // Not part of the protocol; verifies uid extraction end to end.
        .route("/1.5/:uid/echo-uid", get(info::echo_uid))
        // Per-user summaries.
        .route("/1.5/:uid/info/collections", get(info::collections))
        .route("/1.5/:uid/info/collection_usage", get(info::collection_usage))
        .route(
            "/1.5/:uid/info/collection_counts",
            get(info::collection_counts),
        )
        .route("/1.5/:uid/info/quota", get(info::quota))
        // Collections and BSOs.
        .route(
            "/1.5/:uid/storage/:collection",
            get(collection::get)
                .post(collection::post)
                .delete(collection::delete),
        )
        .route(
            "/1.5/:uid/storage/:collection/:bso_id",
            get(bso::get).put(bso::put).delete(bso::delete),
        )
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, auth::hawk_middleware))
}

/// `GET /__heartbeat__` -- liveness probe, returns `OK`.
async fn heartbeat() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        "OK",
    )
}
