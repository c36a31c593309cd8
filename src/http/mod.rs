//! HTTP surface of the service.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (router, global layers: request id, trace, timeout, body limit)
//!     → security (rate limit per route class, CSRF)
//!     → middleware.rs (session enforcement for /api and /import)
//!     → handlers.rs (auth flow, session introspection, upstream reads)
//!     → middleware.rs (problem-details normalization on the way out)
//! ```

pub mod cookies;
pub mod handlers;
pub mod middleware;
pub mod server;
pub mod tls;

pub use server::{AppState, HttpServer, ServiceRoutes};
