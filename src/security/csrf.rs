//! Double-submit CSRF protection.
//!
//! The token lives in a cookie and is echoed by the client in a request header on
//! state-changing calls. Both values must be present and equal.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderName, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

use crate::config::CsrfConfig;
use crate::error::AppError;
use crate::http::cookies::{append_set_cookie, CookieSpec};
use crate::observability::metrics;

/// Random bytes per token.
const TOKEN_BYTES: usize = 32;

pub struct CsrfGuard {
    cookie: CookieSpec,
    header: HeaderName,
    exempt_prefixes: Vec<String>,
}

impl CsrfGuard {
    pub fn new(config: &CsrfConfig, secure_cookies: bool) -> Result<Self, AppError> {
        let header = HeaderName::from_bytes(config.header_name.as_bytes())
            .map_err(|e| AppError::ServerError(format!("invalid CSRF header name: {e}")))?;
        Ok(Self {
            cookie: CookieSpec::new(
                config.cookie_name.clone(),
                Duration::from_secs(config.max_age_secs),
                secure_cookies,
            ),
            header,
            exempt_prefixes: config.exempt_prefixes.clone(),
        })
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header
    }

    /// Reuse the request's token if well formed, otherwise mint one and set the cookie.
    /// The token is always exposed in the response header.
    pub fn issue_if_absent(
        &self,
        request_headers: &HeaderMap,
        response_headers: &mut HeaderMap,
    ) -> Result<String, AppError> {
        let token = match self.cookie.read(request_headers).filter(|t| is_well_formed(t)) {
            Some(existing) => existing,
            None => {
                let fresh = generate_token();
                append_set_cookie(response_headers, self.cookie.set(&fresh)?);
                fresh
            }
        };

        let value = HeaderValue::from_str(&token)
            .map_err(|e| AppError::ServerError(format!("invalid CSRF token header: {e}")))?;
        response_headers.insert(self.header.clone(), value);
        Ok(token)
    }

    /// Check a request. Safe methods and exempt paths always pass.
    pub fn validate(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
    ) -> Result<(), AppError> {
        if is_safe(method) || self.is_exempt(path) {
            return Ok(());
        }

        let cookie = self.cookie.read(headers);
        let header = headers
            .get(&self.header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        let matches = match (cookie, header) {
            (Some(cookie), Some(header)) => bool::from(cookie.as_bytes().ct_eq(header.as_bytes())),
            _ => false,
        };
        if matches {
            Ok(())
        } else {
            Err(AppError::CsrfValidationFailed)
        }
    }

    /// `Set-Cookie` value removing the CSRF cookie.
    pub fn clear_cookie(&self) -> Result<HeaderValue, AppError> {
        self.cookie.clear()
    }

    fn is_exempt(&self, path: &str) -> bool {
        self.exempt_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }
}

fn is_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn is_well_formed(token: &str) -> bool {
    URL_SAFE_NO_PAD
        .decode(token)
        .map(|b| b.len() == TOKEN_BYTES)
        .unwrap_or(false)
}

/// Reject state-changing requests without a matching token; expose a token on
/// every response whose handler did not already issue one.
pub async fn csrf_middleware(
    State(guard): State<Arc<CsrfGuard>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if let Err(e) = guard.validate(request.method(), request.uri().path(), request.headers()) {
        tracing::warn!(
            method = %request.method(),
            path = %request.uri().path(),
            "CSRF validation failed"
        );
        metrics::record_csrf_rejection();
        return e.into_response();
    }

    let request_headers = request.headers().clone();
    let mut response = next.run(request).await;
    if response.headers().contains_key(guard.header_name()) {
        return response;
    }
    if let Err(e) = guard.issue_if_absent(&request_headers, response.headers_mut()) {
        tracing::error!(error = %e, "Failed to issue CSRF token");
    }
    response
}
