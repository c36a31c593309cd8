//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → metrics.rs (counters and gauges via `metrics`)
//!
//! Consumers:
//!     → stdout (pretty in development, JSON in production)
//!     → Prometheus scrape endpoint (when enabled)
//! ```
//!
//! Secrets and credentials never appear in log fields; types that hold them
//! redact their `Debug` output.

pub mod logging;
pub mod metrics;
