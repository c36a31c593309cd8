//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + LISTENSTATS_* secrets from the environment
//!     → loader.rs (parse, deserialize, apply env overrides)
//!     → validation.rs (semantic checks)
//!     → ServiceConfig (validated, immutable)
//!     → shared via Arc to all subsystems
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → rate-limit policies swapped atomically (arc-swap)
//! ```
//!
//! # Design Decisions
//! - Only rate-limit policies are hot-reloadable; keys and secrets need a restart
//! - All fields have defaults to allow minimal configs
//! - Secrets have no usable defaults; validation refuses to start without them

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use schema::{
    CsrfConfig, Environment, ListenerConfig, PolicyConfig, RateLimitConfig, RateStoreKind,
    ResilienceConfig, ServiceConfig, SessionConfig, UpstreamConfig,
};
