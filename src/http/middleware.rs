//! Request pipeline middleware: session enforcement, error normalization, request metrics.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::time::Instant;

use crate::error::{AppError, ProblemDetails};
use crate::http::cookies::append_set_cookie;
use crate::http::server::AppState;
use crate::observability::metrics;

/// Reject requests without a valid session; expose the session to handlers as an
/// `Extension<Authenticated>`.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    match state.sessions.authenticate(request.headers()).await {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(e) => {
            tracing::info!(
                path = %request.uri().path(),
                kind = e.kind(),
                "Rejected unauthenticated request"
            );
            metrics::record_auth_failure(e.kind());
            e.into_response()
        }
    }
}

/// Finish error responses: request path as `instance`, production detail hiding,
/// session cookie cleared on authentication failures.
pub async fn normalize_errors(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    let mut response = next.run(request).await;

    let Some(error) = response.extensions_mut().remove::<AppError>() else {
        return response;
    };

    let problem = ProblemDetails::from_error(
        &error,
        Some(&path),
        state.config.environment.is_production(),
    );
    match serde_json::to_vec(&problem) {
        Ok(body) => {
            response.headers_mut().remove(header::CONTENT_LENGTH);
            *response.body_mut() = Body::from(body);
        }
        Err(e) => tracing::error!(error = %e, "Failed to serialize problem details"),
    }

    if error.clears_session() {
        match state.sessions.clear_cookie() {
            Ok(clear) => append_set_cookie(response.headers_mut(), clear),
            Err(e) => tracing::error!(error = %e, "Failed to build session clearing cookie"),
        }
    }
    response
}

/// Count requests and record latency.
pub async fn track_requests(request: Request<Body>, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().clone();
    let response = next.run(request).await;
    metrics::record_request(method.as_str(), response.status().as_u16(), started.elapsed());
    response
}
