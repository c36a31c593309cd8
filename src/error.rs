//! Service error taxonomy and RFC 7807 problem details.
//!
//! Every subsystem error is converted into an [`AppError`] at the HTTP boundary.
//! Rendering is a pure translation: kind → `{type, title, status, detail, instance}`.
//! The `normalize_errors` middleware in `http::middleware` fills `instance` with the
//! request path and hides non-surfaceable detail in production.

use std::time::Duration;

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Prefix of every problem `type` URI.
const PROBLEM_TYPE_PREFIX: &str = "urn:listenstats:problem:";

/// Detail shown in production for errors that are not safe to surface.
pub const GENERIC_DETAIL: &str = "An unexpected error occurred. Please try again later.";

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("Authentication is required")]
    Unauthenticated,

    #[error("The session has expired")]
    TokenExpired,

    #[error("The session is no longer valid, please sign in again")]
    SessionInvalidated,

    #[error("The account for this session no longer exists")]
    UserNotFound,

    #[error("No usable upstream credential, please sign in again")]
    NoRefreshToken,

    #[error("A superseded credential was presented; all sessions were revoked")]
    ReuseDetected,

    #[error("CSRF token missing or mismatched")]
    CsrfValidationFailed,

    #[error("Too many requests, retry in {}s", .retry_after.as_secs().max(1))]
    TooManyRequests { retry_after: Duration },

    #[error("Upstream dependency '{dependency}' is temporarily unavailable")]
    CircuitOpen {
        dependency: String,
        retry_after: Option<Duration>,
    },

    #[error("The upstream provider rejected the stored credentials: {0}")]
    UpstreamAuthError(String),

    #[error("Upstream request failed: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream request timed out")]
    UpstreamTimeout,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Resource not found")]
    NotFound,

    #[error("Internal server error: {0}")]
    ServerError(String),
}

impl AppError {
    /// Stable machine-readable kind, used for client-side branching.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::TokenExpired => "token-expired",
            AppError::SessionInvalidated => "session-invalidated",
            AppError::UserNotFound => "user-not-found",
            AppError::NoRefreshToken => "no-refresh-token",
            AppError::ReuseDetected => "reuse-detected",
            AppError::CsrfValidationFailed => "csrf-validation-failed",
            AppError::TooManyRequests { .. } => "too-many-requests",
            AppError::CircuitOpen { .. } => "circuit-open",
            AppError::UpstreamAuthError(_) => "upstream-auth-error",
            AppError::UpstreamUnavailable(_) => "upstream-unavailable",
            AppError::UpstreamTimeout => "upstream-timeout",
            AppError::BadRequest(_) => "bad-request",
            AppError::NotFound => "not-found",
            AppError::ServerError(_) => "server-error",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "Unauthenticated",
            AppError::TokenExpired => "Token Expired",
            AppError::SessionInvalidated => "Session Invalidated",
            AppError::UserNotFound => "User Not Found",
            AppError::NoRefreshToken => "Re-authentication Required",
            AppError::ReuseDetected => "Credential Reuse Detected",
            AppError::CsrfValidationFailed => "CSRF Validation Failed",
            AppError::TooManyRequests { .. } => "Too Many Requests",
            AppError::CircuitOpen { .. } => "Service Unavailable",
            AppError::UpstreamAuthError(_) => "Upstream Authorization Failed",
            AppError::UpstreamUnavailable(_) => "Bad Gateway",
            AppError::UpstreamTimeout => "Gateway Timeout",
            AppError::BadRequest(_) => "Bad Request",
            AppError::NotFound => "Not Found",
            AppError::ServerError(_) => "Internal Server Error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated
            | AppError::TokenExpired
            | AppError::SessionInvalidated
            | AppError::UserNotFound
            | AppError::NoRefreshToken
            | AppError::ReuseDetected
            | AppError::UpstreamAuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::CsrfValidationFailed => StatusCode::FORBIDDEN,
            AppError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::ServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the detail text may be shown to clients in production.
    pub fn is_safe_to_surface(&self) -> bool {
        !matches!(
            self,
            AppError::ServerError(_)
                | AppError::UpstreamUnavailable(_)
                | AppError::UpstreamAuthError(_)
        )
    }

    /// Authentication failures end the browser session.
    pub fn clears_session(&self) -> bool {
        matches!(
            self,
            AppError::Unauthenticated
                | AppError::TokenExpired
                | AppError::SessionInvalidated
                | AppError::UserNotFound
                | AppError::NoRefreshToken
                | AppError::ReuseDetected
                | AppError::UpstreamAuthError(_)
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::TooManyRequests { retry_after } => Some(*retry_after),
            AppError::CircuitOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// RFC 7807 Problem Details structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDetails {
    /// URI identifying the problem type.
    #[serde(rename = "type")]
    pub problem_type: String,

    /// Short human-readable summary.
    pub title: String,

    /// HTTP status code.
    pub status: u16,

    /// Human-readable explanation.
    pub detail: String,

    /// Request path of this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    /// Translate an error into problem details.
    pub fn from_error(error: &AppError, instance: Option<&str>, production: bool) -> Self {
        let detail = if production && !error.is_safe_to_surface() {
            GENERIC_DETAIL.to_string()
        } else {
            error.to_string()
        };

        Self {
            problem_type: format!("{PROBLEM_TYPE_PREFIX}{}", error.kind()),
            title: error.title().to_string(),
            status: error.status().as_u16(),
            detail,
            instance: instance.map(str::to_string),
        }
    }

    /// The kind slug, recovered from `type`.
    pub fn kind(&self) -> &str {
        self.problem_type
            .strip_prefix(PROBLEM_TYPE_PREFIX)
            .unwrap_or(&self.problem_type)
    }

    pub fn into_response_with(self, error: &AppError) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::to_vec(&self).unwrap_or_default();

        let mut response = (status, body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
        );
        if let Some(retry_after) = error.retry_after() {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                headers.insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::ServerError(ref msg) = self {
            tracing::error!(error = %msg, "Internal server error");
        }

        let problem = ProblemDetails::from_error(&self, None, false);
        let mut response = problem.into_response_with(&self);
        // Picked up by the normalizer middleware, which knows the path and environment.
        response.extensions_mut().insert(self);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_detail_hidden_in_production() {
        let err = AppError::ServerError("db pool exhausted at 10.0.0.3".into());

        let prod = ProblemDetails::from_error(&err, Some("/api/me"), true);
        assert_eq!(prod.detail, GENERIC_DETAIL);
        assert_eq!(prod.status, 500);
        assert_eq!(prod.instance.as_deref(), Some("/api/me"));
        assert_eq!(prod.kind(), "server-error");

        let dev = ProblemDetails::from_error(&err, None, false);
        assert!(dev.detail.contains("db pool exhausted"));
    }

    #[test]
    fn safe_errors_keep_detail_in_production() {
        let err = AppError::SessionInvalidated;
        let problem = ProblemDetails::from_error(&err, None, true);
        assert_eq!(problem.detail, err.to_string());
        assert_eq!(problem.status, 401);
        assert_eq!(problem.problem_type, "urn:listenstats:problem:session-invalidated");
    }

    #[test]
    fn rate_limit_response_carries_retry_after() {
        let response = AppError::TooManyRequests {
            retry_after: Duration::from_secs(17),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "17");
        assert_eq!(response.headers()[header::CONTENT_TYPE], PROBLEM_CONTENT_TYPE);
        assert!(response.extensions().get::<AppError>().is_some());
    }

    #[test]
    fn auth_failures_clear_session_but_rate_limits_do_not() {
        assert!(AppError::ReuseDetected.clears_session());
        assert!(AppError::TokenExpired.clears_session());
        assert!(!AppError::CsrfValidationFailed.clears_session());
        assert!(!AppError::TooManyRequests {
            retry_after: Duration::from_secs(1)
        }
        .clears_session());
    }

    #[test]
    fn problem_serializes_type_field() {
        let problem = ProblemDetails::from_error(&AppError::NotFound, Some("/x"), false);
        let json = serde_json::to_value(&problem).unwrap();
        assert_eq!(json["type"], "urn:listenstats:problem:not-found");
        assert_eq!(json["instance"], "/x");
        assert_eq!(json["status"], 404);
    }
}
