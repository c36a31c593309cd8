//! listenstats: session security and upstream resilience for the listening-statistics service.
//!
//! ```text
//!   browser ──▶ http::server ──▶ security (rate limit, CSRF) ──▶ session ──▶ handlers
//!                                                                              │
//!                                   upstream (OAuth + API) ◀── resilience ◀────┘
//!                                   (circuit breaker, retry, timeout)
//! ```
//!
//! Cross-cutting: `config` (TOML + env secrets, hot-reloaded limits), `crypto`
//! (credential encryption at rest), `error` (problem-details responses),
//! `observability` (tracing + Prometheus), `lifecycle` (startup, signals, shutdown),
//! `admin` (internal status and revocation endpoints).

pub mod admin;
pub mod config;
pub mod crypto;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod resilience;
pub mod security;
pub mod session;
pub mod upstream;

pub use config::ServiceConfig;
pub use error::{AppError, ProblemDetails};
pub use http::{AppState, HttpServer, ServiceRoutes};
pub use lifecycle::Shutdown;
