//! Upstream provider integration.
//!
//! # Data Flow
//! ```text
//! Login:    authorize_url → provider → exchange_code → current_profile
//! Refresh:  refresh_grant (via CredentialRefresher) → SessionManager rotation
//! Reads:    get_json (bearer access credential)
//!
//! All of the above → resilience::execute (breaker, timeout, retries)
//! ```

pub mod client;
pub mod oauth;

pub use client::{UpstreamClient, UpstreamError, UpstreamProfile, ACCOUNTS, API};
