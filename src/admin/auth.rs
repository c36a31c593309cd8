use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::http::server::AppState;
use crate::observability::metrics;
use crate::session::bearer_token;

/// Machine-to-machine authentication for `/internal/*`.
///
/// Only `Authorization: Bearer <internal secret>` is accepted, compared in constant
/// time. An empty configured secret rejects everything.
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let expected = state.config.internal.bearer_secret.as_bytes();
    let authorized = !expected.is_empty()
        && bearer_token(request.headers())
            .is_some_and(|presented| bool::from(presented.as_bytes().ct_eq(expected)));

    if authorized {
        return next.run(request).await;
    }

    tracing::warn!(path = %request.uri().path(), "Rejected internal request");
    metrics::record_auth_failure("internal");
    AppError::Unauthenticated.into_response()
}
