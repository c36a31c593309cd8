//! Session token claims and HS256 signing.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::crypto::SealedSecret;

/// Claims carried by a session token. Nothing here is persisted server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Principal id.
    pub sub: Uuid,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: Uuid,
    /// Token version snapshot.
    pub ver: u64,
    /// Rotation family snapshot.
    pub fam: Uuid,
    /// Upstream access credential, sealed with the credential cipher.
    pub uat: SealedSecret,
    /// Upstream access credential expiry (unix seconds).
    pub uexp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,

    #[error("token outside the refresh window")]
    RefreshWindowElapsed,

    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Signs and verifies session tokens with the session secret.
#[derive(Clone)]
pub struct SessionSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    ttl: Duration,
    refresh_window: Duration,
    leeway: u64,
}

impl SessionSigner {
    pub fn new(config: &SessionConfig) -> Self {
        let secret = config.signing_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            issuer: config.issuer.clone(),
            ttl: config.ttl(),
            refresh_window: config.refresh_window(),
            leeway: config.leeway_secs,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn refresh_window(&self) -> Duration {
        self.refresh_window
    }

    /// Build claims for a principal, stamping issuer, issue time and expiry.
    pub fn claims(
        &self,
        sub: Uuid,
        ver: u64,
        fam: Uuid,
        uat: SealedSecret,
        uexp: i64,
    ) -> SessionClaims {
        let now = Utc::now().timestamp();
        SessionClaims {
            sub,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
            jti: Uuid::new_v4(),
            ver,
            fam,
            uat,
            uexp,
        }
    }

    pub fn sign(&self, claims: &SessionClaims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| TokenError::Invalid(format!("encoding failed: {e}")))
    }

    /// Verify signature, issuer and expiry.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        self.decode(token, true)
    }

    /// Verify signature and issuer, accepting an expired token issued within the
    /// refresh window.
    pub fn verify_for_refresh(&self, token: &str) -> Result<SessionClaims, TokenError> {
        let claims = self.decode(token, false)?;
        let oldest = Utc::now().timestamp() - self.refresh_window.as_secs() as i64;
        if claims.iat < oldest {
            return Err(TokenError::RefreshWindowElapsed);
        }
        Ok(claims)
    }

    fn decode(&self, token: &str, validate_exp: bool) -> Result<SessionClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.algorithms = vec![Algorithm::HS256];
        validation.leeway = self.leeway;
        validation.validate_exp = validate_exp;
        validation.validate_aud = false;
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);

        decode::<SessionClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid(e.to_string()),
            })
    }
}

impl std::fmt::Debug for SessionSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSigner")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
