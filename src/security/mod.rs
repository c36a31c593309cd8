//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming request:
//!     → rate_limit.rs (per route class, counters in rate_store.rs)
//!     → csrf.rs (double-submit check on state-changing methods)
//!     → session authentication (crate::session)
//!     → handler
//!     → headers.rs (security response headers)
//! ```
//!
//! # Design Decisions
//! - Every check runs before the handler touches upstream or the principal store
//! - Rate-limit store failures fail open; every other check fails closed
//! - No trust in client-supplied forwarding headers unless configured

pub mod csrf;
pub mod headers;
pub mod rate_limit;
pub mod rate_store;

pub use csrf::CsrfGuard;
pub use rate_limit::{RateDecision, RateLimitContext, RateLimited, RateLimiter, RouteClass};
pub use rate_store::{MemoryRateStore, RateLimitStore, RateStoreError, RedisRateStore};
