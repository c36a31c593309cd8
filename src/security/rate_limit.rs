//! Fixed-window rate limiting per route class.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::config::{PolicyConfig, RateLimitConfig};
use crate::error::AppError;
use crate::observability::metrics;
use crate::security::rate_store::RateLimitStore;
use crate::session::SessionManager;

pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const RESET_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Route classes with independent limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteClass {
    General,
    Auth,
    Api,
    BulkImport,
}

impl RouteClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteClass::General => "general",
            RouteClass::Auth => "auth",
            RouteClass::Api => "api",
            RouteClass::BulkImport => "bulk-import",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    pub window: Duration,
    pub max_requests: u32,
    pub per_user: bool,
}

impl From<&PolicyConfig> for RatePolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            window: Duration::from_secs(config.window_secs.max(1)),
            max_requests: config.max_requests,
            per_user: config.per_user,
        }
    }
}

/// The live policy set. Swapped whole on config reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatePolicies {
    pub enabled: bool,
    pub general: RatePolicy,
    pub auth: RatePolicy,
    pub api: RatePolicy,
    pub bulk_import: RatePolicy,
}

impl From<&RateLimitConfig> for RatePolicies {
    fn from(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            general: RatePolicy::from(&config.general),
            auth: RatePolicy::from(&config.auth),
            api: RatePolicy::from(&config.api),
            bulk_import: RatePolicy::from(&config.bulk_import),
        }
    }
}

impl RatePolicies {
    pub fn get(&self, class: RouteClass) -> RatePolicy {
        match class {
            RouteClass::General => self.general,
            RouteClass::Auth => self.auth,
            RouteClass::Api => self.api,
            RouteClass::BulkImport => self.bulk_import,
        }
    }
}

/// State of a key's window after a permitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

impl RateDecision {
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(REMAINING_HEADER, HeaderValue::from(self.remaining));
        headers.insert(RESET_HEADER, HeaderValue::from(reset_secs(self.reset_after)));
    }
}

/// A request over its class ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub decision: RateDecision,
}

impl IntoResponse for RateLimited {
    fn into_response(self) -> Response {
        let mut response = AppError::TooManyRequests {
            retry_after: Duration::from_secs(reset_secs(self.decision.reset_after)),
        }
        .into_response();
        self.decision.apply_headers(response.headers_mut());
        response
    }
}

fn reset_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    policies: ArcSwap<RatePolicies>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: &RateLimitConfig) -> Self {
        Self {
            store,
            policies: ArcSwap::from_pointee(RatePolicies::from(config)),
        }
    }

    pub fn store(&self) -> &Arc<dyn RateLimitStore> {
        &self.store
    }

    pub fn policies(&self) -> Arc<RatePolicies> {
        self.policies.load_full()
    }

    /// Replace the live policies. In-flight windows keep their counts.
    pub fn update_policies(&self, config: &RateLimitConfig) {
        let next = RatePolicies::from(config);
        if *self.policies.load_full() != next {
            tracing::info!(enabled = next.enabled, "Rate limit policies reloaded");
            self.policies.store(Arc::new(next));
        }
    }

    /// Record one request for `key` in `class`.
    ///
    /// Store failures let the request through.
    pub async fn check(&self, class: RouteClass, key: &str) -> Result<RateDecision, RateLimited> {
        let policy = self.policies.load().get(class);
        let store_key = format!("{}:{key}", class.as_str());

        let counted = match self.store.hit(&store_key, policy.window).await {
            Ok(counted) => counted,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    store = self.store.name(),
                    class = class.as_str(),
                    "Rate store unavailable, allowing request"
                );
                metrics::record_rate_store_error();
                return Ok(RateDecision {
                    limit: policy.max_requests,
                    remaining: policy.max_requests,
                    reset_after: policy.window,
                });
            }
        };

        let limit = u64::from(policy.max_requests);
        let decision = RateDecision {
            limit: policy.max_requests,
            remaining: limit.saturating_sub(counted.count) as u32,
            reset_after: counted.resets_in,
        };

        if counted.count > limit {
            return Err(RateLimited { decision });
        }
        Ok(decision)
    }

    fn enabled(&self) -> bool {
        self.policies.load().enabled
    }
}

/// Shared state for the rate-limit middleware.
#[derive(Clone)]
pub struct RateLimitContext {
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionManager>,
    pub trust_forwarded_for: bool,
}

/// Client address: left-most `X-Forwarded-For` entry when trusted, else the peer.
pub fn client_ip(request: &Request<Body>, trust_forwarded_for: bool) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|v| v.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Middleware enforcing the limits of one route class.
pub async fn rate_limit_middleware(
    State((ctx, class)): State<(RateLimitContext, RouteClass)>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !ctx.limiter.enabled() {
        return next.run(request).await;
    }

    let ip = client_ip(&request, ctx.trust_forwarded_for)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let policy = ctx.limiter.policies().get(class);
    let user = policy
        .per_user
        .then(|| ctx.sessions.subject_hint(request.headers()))
        .flatten();
    let key = match user {
        Some(user) => format!("{user}:{ip}"),
        None => ip,
    };

    match ctx.limiter.check(class, &key).await {
        Ok(decision) => {
            let mut response = next.run(request).await;
            decision.apply_headers(response.headers_mut());
            response
        }
        Err(limited) => {
            tracing::warn!(client = %key, class = class.as_str(), "Rate limit exceeded");
            metrics::record_rate_limited(class.as_str());
            limited.into_response()
        }
    }
}
