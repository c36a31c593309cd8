//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Own the shared components handlers need (`AppState`)
//! - Build the Axum router: route classes, guards, collaborator mounts
//! - Wire up middleware (tracing, request id, timeout, body limit, security headers)
//! - Serve plain TCP or TLS with graceful shutdown

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tower_http::{
    limit::RequestBodyLimitLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::admin::internal_router;
use crate::config::ServiceConfig;
use crate::crypto::{AesGcmCipher, CredentialCipher};
use crate::error::AppError;
use crate::http::handlers;
use crate::http::middleware::{normalize_errors, require_session, track_requests};
use crate::resilience::{BreakerSettings, CircuitBreakerRegistry};
use crate::security::csrf::csrf_middleware;
use crate::security::headers::{no_store, with_security_headers};
use crate::security::rate_limit::rate_limit_middleware;
use crate::security::{CsrfGuard, RateLimitContext, RateLimitStore, RateLimiter, RouteClass};
use crate::session::{PrincipalStore, SessionManager};
use crate::upstream::UpstreamClient;

/// Time in-flight requests get to finish after shutdown is requested (TLS listener).
const TLS_DRAIN_SECS: u64 = 10;

/// Application state injected into handlers and middleware.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub sessions: Arc<SessionManager>,
    pub csrf: Arc<CsrfGuard>,
    pub limiter: Arc<RateLimiter>,
    pub upstream: Arc<UpstreamClient>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub started_at: Instant,
}

impl AppState {
    /// Build every owned component from config plus the two injected stores.
    pub fn new(
        config: ServiceConfig,
        principals: Arc<dyn PrincipalStore>,
        rate_store: Arc<dyn RateLimitStore>,
    ) -> Result<Self, AppError> {
        let production = config.environment.is_production();

        let cipher: Arc<dyn CredentialCipher> =
            Arc::new(AesGcmCipher::from_hex_key(&config.encryption.key_hex)?);
        let sessions = Arc::new(SessionManager::new(
            &config.session,
            production,
            principals,
            cipher,
        ));
        let csrf = Arc::new(CsrfGuard::new(&config.csrf, production)?);
        let limiter = Arc::new(RateLimiter::new(rate_store, &config.rate_limit));
        let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings::from(
            &config.resilience,
        )));
        let upstream = Arc::new(UpstreamClient::new(
            config.upstream.clone(),
            &config.resilience,
            breakers.clone(),
        )?);

        Ok(Self {
            config: Arc::new(config),
            sessions,
            csrf,
            limiter,
            upstream,
            breakers,
            started_at: Instant::now(),
        })
    }
}

/// Routers contributed by collaborators, mounted behind session authentication.
#[derive(Default)]
pub struct ServiceRoutes {
    /// Mounted under `/api`, `api` rate class.
    pub api: Option<Router>,
    /// Mounted under `/import`, `bulk-import` rate class.
    pub import: Option<Router>,
}

/// HTTP server for the service.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    pub fn new(state: AppState, routes: ServiceRoutes) -> Self {
        let router = Self::build_router(state.clone(), routes);
        Self { router, state }
    }

    /// The fully layered router, for in-process serving.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(state: AppState, routes: ServiceRoutes) -> Router {
        let config = state.config.clone();
        let rate_ctx = RateLimitContext {
            limiter: state.limiter.clone(),
            sessions: state.sessions.clone(),
            trust_forwarded_for: config.rate_limit.trust_forwarded_for,
        };
        let guarded = |router: Router, class: RouteClass| {
            router
                .route_layer(middleware::from_fn_with_state(state.csrf.clone(), csrf_middleware))
                .route_layer(middleware::from_fn_with_state(
                    (rate_ctx.clone(), class),
                    rate_limit_middleware,
                ))
        };
        let session_layer = || middleware::from_fn_with_state(state.clone(), require_session);

        let auth = no_store(
            Router::new()
                .route("/auth/login", get(handlers::login))
                .route("/auth/callback", get(handlers::callback))
                .route("/auth/refresh", post(handlers::refresh))
                .route("/auth/logout", post(handlers::logout))
                .route("/auth/logout-all", post(handlers::logout_all))
                .route("/auth/session", get(handlers::session))
                .route("/auth/csrf", get(handlers::csrf_token))
                .with_state(state.clone()),
        );

        let mut api = Router::new()
            .route("/me", get(handlers::me))
            .route("/upstream/{*path}", get(handlers::upstream_proxy))
            .with_state(state.clone());
        if let Some(extra) = routes.api {
            api = api.merge(extra);
        }
        let api = Router::new().nest("/api", api.route_layer(session_layer()));

        let general = Router::new()
            .route("/health", get(handlers::health))
            .merge(internal_router(state.clone()))
            .with_state(state.clone());

        let mut router = Router::new()
            .merge(guarded(auth, RouteClass::Auth))
            .merge(guarded(api, RouteClass::Api))
            .merge(guarded(general, RouteClass::General));

        if let Some(import) = routes.import {
            let import = Router::new().nest("/import", import.route_layer(session_layer()));
            router = router.merge(guarded(import, RouteClass::BulkImport));
        }

        let router = router
            .fallback(handlers::not_found)
            .layer(middleware::from_fn_with_state(state.clone(), normalize_errors));

        with_security_headers(router)
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(TimeoutLayer::new(Duration::from_secs(config.listener.request_timeout_secs)))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(middleware::from_fn(track_requests))
    }

    /// Run the server on `listener` until `shutdown` resolves.
    pub async fn run<F>(self, listener: TcpListener, shutdown: F) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        self.log_start(addr, false);

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Run the server with TLS on `addr` until `shutdown` resolves.
    pub async fn run_tls<F>(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: F,
    ) -> Result<(), std::io::Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.log_start(addr, true);

        let handle = axum_server::Handle::new();
        let drain = handle.clone();
        tokio::spawn(async move {
            shutdown.await;
            drain.graceful_shutdown(Some(Duration::from_secs(TLS_DRAIN_SECS)));
        });

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(app)
            .await?;

        tracing::info!("HTTPS server stopped");
        Ok(())
    }

    fn log_start(&self, addr: SocketAddr, tls: bool) {
        tracing::info!(
            address = %addr,
            tls,
            environment = ?self.state.config.environment,
            rate_store = self.state.limiter.store().name(),
            "HTTP server starting"
        );
    }
}
