//! Principal record and the upstream access credential carried in sessions.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::SealedSecret;

/// A user of the service, linked to one upstream account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: Uuid,
    pub upstream_account_id: String,
    pub display_name: Option<String>,

    /// Only ever increases. Bumping it invalidates every outstanding session.
    pub token_version: u64,

    /// Lineage of the long-lived upstream credential.
    pub rotation_family: Uuid,

    /// Encrypted long-lived upstream credential (refresh token).
    pub refresh_credential: Option<SealedSecret>,
    pub refresh_expires_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl Principal {
    pub fn new(upstream_account_id: impl Into<String>, display_name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            upstream_account_id: upstream_account_id.into(),
            display_name,
            token_version: 0,
            rotation_family: Uuid::new_v4(),
            refresh_credential: None,
            refresh_expires_at: None,
            created_at: Utc::now(),
        }
    }

    /// A stored credential exists and has not passed its expiry.
    pub fn has_live_credential(&self, now: DateTime<Utc>) -> bool {
        self.refresh_credential.is_some() && self.refresh_expires_at.map_or(true, |exp| exp > now)
    }
}

/// Short-lived upstream access credential.
#[derive(Clone, PartialEq, Eq)]
pub struct UpstreamAccess {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl UpstreamAccess {
    pub fn new(access_token: impl Into<String>, expires_in_secs: i64) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs),
        }
    }

    /// Expired, or expiring within `skew`.
    pub fn is_stale(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        self.expires_at <= now + skew
    }
}

impl std::fmt::Debug for UpstreamAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamAccess")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}
