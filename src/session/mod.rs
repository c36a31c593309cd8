//! Session subsystem.
//!
//! # Data Flow
//! ```text
//! Login:     UpstreamGrant → SessionManager::complete_login → PrincipalStore → token.rs (sign)
//! Request:   cookie / bearer → token.rs (verify) → PrincipalStore (version, family check)
//! Refresh:   CredentialRefresher → rotate_upstream_credential (conditional swap) → reissue
//! Reuse:     superseded credential → revoke_family (token_version + 1, credential cleared)
//! ```
//!
//! Sessions are stateless signed tokens. Revocation works by comparing the token's
//! version and family snapshot with the principal record on every request.

pub mod manager;
pub mod principal;
pub mod store;
pub mod token;

pub use manager::{
    bearer_token, Authenticated, CredentialRefresher, IssuedSession, RotationOutcome,
    SessionManager, UpstreamGrant,
};
pub use principal::{Principal, UpstreamAccess};
pub use store::{CredentialSwap, InMemoryPrincipalStore, PrincipalStore, StoreError};
pub use token::{SessionClaims, SessionSigner, TokenError};
