//! Principal persistence.
//!
//! The schema of a durable store is owned by a collaborator; this module defines
//! the operations the session core needs and an in-process implementation.
//! Credential updates are conditional so concurrent rotations on one family are
//! linearized: only the caller that still sees the previous ciphertext wins.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::crypto::SealedSecret;
use crate::session::principal::Principal;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("principal {0} not found")]
    NotFound(Uuid),

    #[error("principal store unavailable: {0}")]
    Unavailable(String),
}

/// Result of a conditional credential update.
#[derive(Debug, Clone)]
pub enum CredentialSwap {
    Swapped(Principal),
    /// The stored credential or family changed since it was read.
    Conflict,
}

#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<Principal>, StoreError>;

    async fn find_by_upstream_account(&self, account_id: &str)
        -> Result<Option<Principal>, StoreError>;

    /// Insert or replace a principal record.
    async fn insert(&self, principal: Principal) -> Result<(), StoreError>;

    /// Store a credential obtained from a fresh login. Starts a new rotation family
    /// when the principal holds no credential (first login or after revocation).
    async fn record_login(
        &self,
        id: Uuid,
        display_name: Option<String>,
        credential: SealedSecret,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Principal, StoreError>;

    /// Replace the credential iff the family is unchanged and the stored ciphertext
    /// equals `expected`.
    async fn swap_credential(
        &self,
        id: Uuid,
        family: Uuid,
        expected: &SealedSecret,
        replacement: SealedSecret,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CredentialSwap, StoreError>;

    /// Bump the token version and clear the credential if `family` is still current.
    /// Returns the resulting token version.
    async fn revoke_family(&self, id: Uuid, family: Uuid) -> Result<u64, StoreError>;

    /// Bump the token version. Returns the new version.
    async fn bump_token_version(&self, id: Uuid) -> Result<u64, StoreError>;
}

/// In-process principal store backed by `DashMap`.
///
/// Each mutation holds the shard lock of its entry for the whole
/// read-compare-write, which is what makes `swap_credential` atomic.
#[derive(Default)]
pub struct InMemoryPrincipalStore {
    principals: DashMap<Uuid, Principal>,
    by_account: DashMap<String, Uuid>,
}

impl InMemoryPrincipalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.principals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.principals.is_empty()
    }
}

#[async_trait]
impl PrincipalStore for InMemoryPrincipalStore {
    async fn get(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
        Ok(self.principals.get(&id).map(|r| r.value().clone()))
    }

    async fn find_by_upstream_account(
        &self,
        account_id: &str,
    ) -> Result<Option<Principal>, StoreError> {
        let Some(id) = self.by_account.get(account_id).map(|r| *r.value()) else {
            return Ok(None);
        };
        self.get(id).await
    }

    async fn insert(&self, principal: Principal) -> Result<(), StoreError> {
        self.by_account
            .insert(principal.upstream_account_id.clone(), principal.id);
        self.principals.insert(principal.id, principal);
        Ok(())
    }

    async fn record_login(
        &self,
        id: Uuid,
        display_name: Option<String>,
        credential: SealedSecret,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Principal, StoreError> {
        let mut entry = self.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let principal = entry.value_mut();

        if principal.refresh_credential.is_none() {
            principal.rotation_family = Uuid::new_v4();
        }
        if display_name.is_some() {
            principal.display_name = display_name;
        }
        principal.refresh_credential = Some(credential);
        principal.refresh_expires_at = expires_at;
        Ok(principal.clone())
    }

    async fn swap_credential(
        &self,
        id: Uuid,
        family: Uuid,
        expected: &SealedSecret,
        replacement: SealedSecret,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<CredentialSwap, StoreError> {
        let mut entry = self.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let principal = entry.value_mut();

        let unchanged = principal.rotation_family == family
            && principal
                .refresh_credential
                .as_ref()
                .is_some_and(|current| current.ct_eq(expected));
        if !unchanged {
            return Ok(CredentialSwap::Conflict);
        }

        principal.refresh_credential = Some(replacement);
        if expires_at.is_some() {
            principal.refresh_expires_at = expires_at;
        }
        Ok(CredentialSwap::Swapped(principal.clone()))
    }

    async fn revoke_family(&self, id: Uuid, family: Uuid) -> Result<u64, StoreError> {
        let mut entry = self.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let principal = entry.value_mut();

        if principal.rotation_family == family {
            principal.token_version += 1;
            principal.refresh_credential = None;
            principal.refresh_expires_at = None;
        }
        Ok(principal.token_version)
    }

    async fn bump_token_version(&self, id: Uuid) -> Result<u64, StoreError> {
        let mut entry = self.principals.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.token_version += 1;
        Ok(entry.token_version)
    }
}
