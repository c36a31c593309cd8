//! Cookie parsing and `Set-Cookie` construction.
//!
//! All cookies issued by the service are `SameSite=Strict`, `Path=/`, and `Secure`
//! outside development.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderValue};

use crate::error::AppError;

/// Attributes of one named cookie.
#[derive(Debug, Clone)]
pub struct CookieSpec {
    pub name: String,
    pub max_age: Duration,
    pub secure: bool,
    pub http_only: bool,
}

impl CookieSpec {
    pub fn new(name: impl Into<String>, max_age: Duration, secure: bool) -> Self {
        Self {
            name: name.into(),
            max_age,
            secure,
            http_only: true,
        }
    }

    /// `Set-Cookie` value storing `value`.
    pub fn set(&self, value: &str) -> Result<HeaderValue, AppError> {
        self.render(value, self.max_age.as_secs())
    }

    /// `Set-Cookie` value that removes the cookie.
    pub fn clear(&self) -> Result<HeaderValue, AppError> {
        self.render("", 0)
    }

    /// Current value sent by the client, if any.
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        read_cookie(headers, &self.name)
    }

    fn render(&self, value: &str, max_age: u64) -> Result<HeaderValue, AppError> {
        let http_only = if self.http_only { "; HttpOnly" } else { "" };
        let secure = if self.secure { "; Secure" } else { "" };
        let cookie = format!(
            "{}={value}; Path=/; Max-Age={max_age}{http_only}{secure}; SameSite=Strict",
            self.name
        );
        HeaderValue::from_str(&cookie)
            .map_err(|e| AppError::ServerError(format!("invalid cookie {}: {e}", self.name)))
    }
}

/// Find a non-empty cookie by name across all `Cookie` headers.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, v)| *k == name && !v.is_empty())
        .map(|(_, v)| v.trim().to_string())
}

/// Append a `Set-Cookie` header without replacing ones already present.
pub fn append_set_cookie(headers: &mut HeaderMap, value: HeaderValue) {
    headers.append(header::SET_COOKIE, value);
}
