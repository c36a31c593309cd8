//! Machine-to-machine endpoints under `/internal`.

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use self::auth::internal_auth_middleware;
use self::handlers::*;
use crate::http::server::AppState;

pub fn internal_router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/internal/status", get(get_status))
        .route("/internal/circuits", get(get_circuits))
        .route("/internal/principals/{id}/revoke", post(revoke_principal))
        .route_layer(middleware::from_fn_with_state(state, internal_auth_middleware))
}
