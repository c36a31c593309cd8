//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream call:
//!     → circuit_breaker.rs (fail fast while OPEN, single HALF_OPEN trial)
//!     → timeouts.rs (fixed deadline per attempt)
//!     → On transient failure: retries.rs (backoff.rs delay or Retry-After hint)
//! ```
//!
//! # Design Decisions
//! - Every upstream call has a deadline
//! - Only transient failures are retried or counted against the breaker
//! - Breakers are per dependency and per process

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use retries::{execute, CallError, RetryPolicy, Transient};
