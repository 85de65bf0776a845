//! REST control plane.
//!
//! `/api/ping` and `/api/ext/config` are open; everything else needs the
//! bearer token.

pub mod auth;
pub mod error;
pub mod routes;

use crate::core::config::AppConfig;
use crate::core::security::TokenStore;
use crate::core::store::TaskStore;
use crate::core::worker::Worker;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: TaskStore,
    pub worker: Worker,
    pub tokens: TokenStore,
    pub config: Arc<AppConfig>,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/queue", post(routes::enqueue))
        .route("/api/status", get(routes::status))
        .route("/api/counters", get(routes::counters))
        .route("/api/control", post(routes::control))
        .route("/api/worker_state", get(routes::worker_state))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_token));

    Router::new()
        .route("/api/ping", get(routes::ping))
        .route("/api/ext/config", get(routes::ext_config))
        .merge(protected)
        .with_state(state)
}
