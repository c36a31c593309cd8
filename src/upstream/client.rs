//! HTTP client for the upstream provider.
//!
//! Every call goes through the resilience layer: one breaker per host
//! (`accounts`, `api`), retries for transient failures, a fixed per-attempt deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::{ResilienceConfig, UpstreamConfig};
use crate::error::AppError;
use crate::observability::metrics;
use crate::resilience::{execute, CallError, CircuitBreakerRegistry, RetryPolicy, Transient};
use crate::session::{CredentialRefresher, UpstreamGrant};

/// Breaker name for the accounts host (authorize, token exchange, refresh).
pub const ACCOUNTS: &str = "accounts";
/// Breaker name for the resource API host.
pub const API: &str = "api";

/// Longest upstream error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out")]
    Timeout,

    #[error("could not connect to upstream: {0}")]
    Connect(String),

    #[error("upstream transport error: {0}")]
    Transport(String),

    #[error("upstream returned {status}: {body}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
        body: String,
    },

    #[error("malformed upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else if e.is_connect() {
            UpstreamError::Connect(e.to_string())
        } else if e.is_decode() {
            UpstreamError::Decode(e.to_string())
        } else {
            UpstreamError::Transport(e.to_string())
        }
    }

    fn outcome(&self) -> &'static str {
        match self {
            UpstreamError::Timeout => "timeout",
            UpstreamError::Connect(_) | UpstreamError::Transport(_) => "transport",
            UpstreamError::Status { status, .. } if *status >= 500 => "server_error",
            UpstreamError::Status { status: 429, .. } => "throttled",
            UpstreamError::Status { .. } => "client_error",
            UpstreamError::Decode(_) => "decode",
        }
    }
}

impl Transient for UpstreamError {
    fn is_transient(&self) -> bool {
        match self {
            UpstreamError::Timeout
            | UpstreamError::Connect(_)
            | UpstreamError::Transport(_) => true,
            UpstreamError::Status { status, .. } => *status >= 500 || *status == 429,
            UpstreamError::Decode(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Profile of the signed-in upstream account.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamProfile {
    pub id: String,
    pub display_name: Option<String>,
}

#[derive(Clone)]
pub struct UpstreamClient {
    pub(crate) http: reqwest::Client,
    pub(crate) config: UpstreamConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    pub(crate) policy: RetryPolicy,
}

impl UpstreamClient {
    pub fn new(
        config: UpstreamConfig,
        resilience: &ResilienceConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .user_agent(concat!("listenstats/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::ServerError(format!("failed to build upstream client: {e}")))?;

        // Register both breakers up front so they show in status output before first use.
        breakers.get(ACCOUNTS);
        breakers.get(API);

        Ok(Self {
            http,
            config,
            breakers,
            policy: RetryPolicy::from(resilience),
        })
    }

    /// Profile of the account owning `access_token`.
    pub async fn current_profile(&self, access_token: &str) -> Result<UpstreamProfile, AppError> {
        self.get_json(access_token, "me", None).await
    }

    /// Read-only resource call on the API host. `path` is relative to the API base.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        access_token: &str,
        path: &str,
        query: Option<&str>,
    ) -> Result<T, AppError> {
        let path = sanitize_path(path)
            .ok_or_else(|| AppError::BadRequest("invalid upstream path".into()))?;
        let mut url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }

        self.send_json(API, &self.policy, || {
            self.http.get(&url).bearer_auth(access_token)
        })
        .await
    }

    /// Send a request built by `build` through the breaker for `dependency`.
    pub(crate) async fn send_json<T, B>(
        &self,
        dependency: &str,
        policy: &RetryPolicy,
        build: B,
    ) -> Result<T, AppError>
    where
        T: DeserializeOwned,
        B: Fn() -> reqwest::RequestBuilder,
    {
        let breaker = self.breakers.get(dependency);
        let result = execute(&breaker, policy, self.config.request_timeout(), || {
            let request = build();
            async move { read_json::<T>(request.send().await).await }
        })
        .await;

        match &result {
            Ok(_) => metrics::record_upstream_call(dependency, "success"),
            Err(CallError::CircuitOpen { .. }) => {
                metrics::record_upstream_call(dependency, "rejected")
            }
            Err(CallError::TimedOut(_)) => metrics::record_upstream_call(dependency, "timeout"),
            Err(CallError::Failed(e)) => metrics::record_upstream_call(dependency, e.outcome()),
        }

        result.map_err(|e| map_call_error(dependency, e))
    }
}

#[async_trait]
impl CredentialRefresher for UpstreamClient {
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamGrant, AppError> {
        self.refresh_grant(refresh_token).await
    }
}

async fn read_json<T: DeserializeOwned>(
    sent: Result<reqwest::Response, reqwest::Error>,
) -> Result<T, UpstreamError> {
    let response = sent.map_err(UpstreamError::from_reqwest)?;
    let status = response.status();

    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| UpstreamError::Decode(e.to_string()));
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }

    Err(UpstreamError::Status {
        status: status.as_u16(),
        retry_after,
        body,
    })
}

fn map_call_error(dependency: &str, error: CallError<UpstreamError>) -> AppError {
    match error {
        CallError::CircuitOpen {
            dependency,
            retry_after,
        } => AppError::CircuitOpen {
            dependency,
            retry_after,
        },
        CallError::TimedOut(_) | CallError::Failed(UpstreamError::Timeout) => {
            AppError::UpstreamTimeout
        }
        CallError::Failed(UpstreamError::Status { status, body, .. }) => {
            match StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY) {
                StatusCode::UNAUTHORIZED => AppError::UpstreamAuthError(body),
                StatusCode::BAD_REQUEST if dependency == ACCOUNTS => {
                    AppError::UpstreamAuthError(body)
                }
                StatusCode::NOT_FOUND => AppError::NotFound,
                StatusCode::BAD_REQUEST | StatusCode::FORBIDDEN => {
                    AppError::BadRequest(format!("upstream refused the request ({status})"))
                }
                _ => AppError::UpstreamUnavailable(format!("{dependency} returned {status}")),
            }
        }
        CallError::Failed(other) => AppError::UpstreamUnavailable(other.to_string()),
    }
}

/// Relative resource path with traversal and empty segments rejected.
fn sanitize_path(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let valid = trimmed.split('/').all(|segment| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':' | ','))
    });
    valid.then(|| trimmed.to_string())
}
