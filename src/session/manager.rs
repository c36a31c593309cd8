//! Session issuance, authentication and upstream credential rotation.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue};
use chrono::{DateTime, Duration, TimeZone, Utc};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::crypto::{CredentialCipher, CryptoError, SealedSecret};
use crate::error::AppError;
use crate::http::cookies::CookieSpec;
use crate::observability::metrics;
use crate::session::principal::{Principal, UpstreamAccess};
use crate::session::store::{CredentialSwap, PrincipalStore, StoreError};
use crate::session::token::{SessionClaims, SessionSigner, TokenError};

/// Access credentials expiring within this margin are refreshed before use.
const ACCESS_REFRESH_SKEW_SECS: i64 = 30;

/// Conditional updates attempted before a contended rotation gives up.
const MAX_SWAP_ATTEMPTS: usize = 3;

/// Credentials returned by an upstream refresh or code exchange.
#[derive(Debug, Clone)]
pub struct UpstreamGrant {
    pub access: UpstreamAccess,
    /// Absent when the provider keeps the existing refresh credential.
    pub refresh_token: Option<String>,
    pub refresh_expires_at: Option<DateTime<Utc>>,
}

/// Exchanges a long-lived credential for fresh upstream credentials.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamGrant, AppError>;
}

/// Outcome of a rotation attempt. Reuse is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub enum RotationOutcome {
    Rotated { principal: Principal },
    ReuseDetected { revoked_version: u64 },
}

/// What the store holds relative to a rotation attempt.
enum StoredCredential {
    /// Still the credential the caller presented; swap against this ciphertext.
    Presented(SealedSecret),
    /// A concurrent refresh already stored the caller's new credential.
    AlreadyRotated,
    /// Another credential, a revoked family or a newer lineage.
    Superseded,
}

/// A freshly minted session.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub set_cookie: HeaderValue,
    pub principal: Principal,
    pub access: UpstreamAccess,
}

/// Result of a successful authentication.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    pub claims: SessionClaims,
    pub upstream: UpstreamAccess,
}

pub struct SessionManager {
    signer: SessionSigner,
    store: Arc<dyn PrincipalStore>,
    cipher: Arc<dyn CredentialCipher>,
    cookie: CookieSpec,
}

impl SessionManager {
    pub fn new(
        config: &SessionConfig,
        secure_cookies: bool,
        store: Arc<dyn PrincipalStore>,
        cipher: Arc<dyn CredentialCipher>,
    ) -> Self {
        // The cookie outlives the token so an expired session can still reach /auth/refresh.
        let cookie = CookieSpec::new(
            config.cookie_name.clone(),
            config.refresh_window(),
            secure_cookies,
        );
        Self {
            signer: SessionSigner::new(config),
            store,
            cipher,
            cookie,
        }
    }

    pub fn store(&self) -> &Arc<dyn PrincipalStore> {
        &self.store
    }

    /// `Set-Cookie` value that removes the session cookie.
    pub fn clear_cookie(&self) -> Result<HeaderValue, AppError> {
        self.cookie.clear()
    }

    /// Mint a signed session for `principal` carrying the given upstream access credential.
    pub fn issue(
        &self,
        principal: &Principal,
        access: &UpstreamAccess,
    ) -> Result<IssuedSession, AppError> {
        let sealed_access = self.cipher.encrypt_str(&access.access_token)?;
        let claims = self.signer.claims(
            principal.id,
            principal.token_version,
            principal.rotation_family,
            sealed_access,
            access.expires_at.timestamp(),
        );
        let token = self
            .signer
            .sign(&claims)
            .map_err(|e| AppError::ServerError(e.to_string()))?;
        let set_cookie = self.cookie.set(&token)?;

        tracing::debug!(
            principal_id = %principal.id,
            token_version = principal.token_version,
            "Session issued"
        );

        Ok(IssuedSession {
            token,
            expires_at: Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or_else(Utc::now),
            set_cookie,
            principal: principal.clone(),
            access: access.clone(),
        })
    }

    /// Authenticate a request from its session cookie or bearer header.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Authenticated, AppError> {
        let token = self.extract_token(headers).ok_or(AppError::Unauthenticated)?;
        let claims = self.signer.verify(&token).map_err(|e| match e {
            TokenError::Expired => AppError::TokenExpired,
            _ => AppError::Unauthenticated,
        })?;

        let principal = self.load_current(&claims).await?;

        let now = Utc::now();
        if !principal.has_live_credential(now) {
            return Err(AppError::NoRefreshToken);
        }
        if let Some(sealed) = &principal.refresh_credential {
            if self.cipher.decrypt(sealed).is_err() {
                tracing::warn!(principal_id = %principal.id, "Stored credential failed to decrypt");
                return Err(AppError::NoRefreshToken);
            }
        }

        let access_token = self
            .cipher
            .decrypt_string(&claims.uat)
            .map_err(|_| AppError::Unauthenticated)?;
        let upstream = UpstreamAccess {
            access_token,
            expires_at: Utc
                .timestamp_opt(claims.uexp, 0)
                .single()
                .unwrap_or(now),
        };

        Ok(Authenticated {
            principal,
            claims,
            upstream,
        })
    }

    /// Same checks as [`authenticate`](Self::authenticate); any failure means anonymous.
    pub async fn optional_authenticate(&self, headers: &HeaderMap) -> Option<Authenticated> {
        self.authenticate(headers).await.ok()
    }

    /// Principal id from a validly signed, unexpired token. No store lookup.
    pub fn subject_hint(&self, headers: &HeaderMap) -> Option<Uuid> {
        let token = self.extract_token(headers)?;
        self.signer.verify(&token).ok().map(|c| c.sub)
    }

    /// Authenticate for `/auth/refresh`: the token may be expired but must be
    /// within the refresh window and still match version and family.
    pub async fn authenticate_for_refresh(
        &self,
        headers: &HeaderMap,
    ) -> Result<Principal, AppError> {
        let token = self.extract_token(headers).ok_or(AppError::Unauthenticated)?;
        let claims = self.signer.verify_for_refresh(&token).map_err(|e| match e {
            TokenError::RefreshWindowElapsed | TokenError::Expired => AppError::TokenExpired,
            TokenError::Invalid(_) => AppError::Unauthenticated,
        })?;
        self.load_current(&claims).await
    }

    /// Decrypt the stored long-lived credential. Any failure means re-login.
    pub fn stored_credential(&self, principal: &Principal) -> Result<String, AppError> {
        let sealed = principal
            .refresh_credential
            .as_ref()
            .ok_or(AppError::NoRefreshToken)?;
        self.cipher
            .decrypt_string(sealed)
            .map_err(|_| AppError::NoRefreshToken)
    }

    /// Record a refreshed long-lived credential, detecting reuse of a superseded one.
    ///
    /// `observed_old` is the credential the caller presented upstream. Reuse means it is
    /// no longer the stored plaintext of `principal.rotation_family`; the family is then
    /// revoked. Losing the conditional update to a concurrent writer is not reuse by
    /// itself: the stored value is re-read and compared again.
    pub async fn rotate_upstream_credential(
        &self,
        principal: &Principal,
        new_credential: &str,
        observed_old: &str,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<RotationOutcome, AppError> {
        let family = principal.rotation_family;
        let replacement = self.cipher.encrypt_str(new_credential)?;

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current = self
                .store
                .get(principal.id)
                .await?
                .ok_or(AppError::UserNotFound)?;

            let expected = match self.classify(&current, family, observed_old, new_credential) {
                StoredCredential::Presented(sealed) => sealed,
                StoredCredential::AlreadyRotated => {
                    tracing::debug!(
                        principal_id = %current.id,
                        "Credential already rotated by a concurrent refresh"
                    );
                    return Ok(RotationOutcome::Rotated { principal: current });
                }
                StoredCredential::Superseded => {
                    return self.revoke_after_reuse(principal.id, family).await;
                }
            };

            match self
                .store
                .swap_credential(
                    principal.id,
                    family,
                    &expected,
                    replacement.clone(),
                    new_expires_at,
                )
                .await?
            {
                CredentialSwap::Swapped(updated) => {
                    tracing::info!(principal_id = %updated.id, "Upstream credential rotated");
                    return Ok(RotationOutcome::Rotated { principal: updated });
                }
                CredentialSwap::Conflict => continue,
            }
        }

        tracing::warn!(
            principal_id = %principal.id,
            "Credential rotation kept losing to concurrent writers"
        );
        Err(AppError::ServerError("credential rotation contended".into()))
    }

    /// Refresh the upstream credential, rotate it and mint a new session.
    pub async fn refresh_session(
        &self,
        principal: &Principal,
        refresher: &dyn CredentialRefresher,
    ) -> Result<IssuedSession, AppError> {
        if !principal.has_live_credential(Utc::now()) {
            return Err(AppError::NoRefreshToken);
        }
        let observed_old = self.stored_credential(principal)?;
        let grant = refresher.refresh(&observed_old).await?;
        let new_credential = grant.refresh_token.as_deref().unwrap_or(&observed_old);

        let outcome = self
            .rotate_upstream_credential(
                principal,
                new_credential,
                &observed_old,
                grant.refresh_expires_at,
            )
            .await?;
        match outcome {
            RotationOutcome::Rotated { principal } => self.issue(&principal, &grant.access),
            RotationOutcome::ReuseDetected { .. } => Err(AppError::ReuseDetected),
        }
    }

    /// Refresh the session first if its upstream access credential is (nearly) expired.
    pub async fn ensure_fresh_access(
        &self,
        auth: &Authenticated,
        refresher: &dyn CredentialRefresher,
    ) -> Result<Option<IssuedSession>, AppError> {
        if !auth
            .upstream
            .is_stale(Utc::now(), Duration::seconds(ACCESS_REFRESH_SKEW_SECS))
        {
            return Ok(None);
        }
        self.refresh_session(&auth.principal, refresher).await.map(Some)
    }

    /// Create or update the principal for a completed upstream login and issue a session.
    pub async fn complete_login(
        &self,
        upstream_account_id: &str,
        display_name: Option<String>,
        grant: UpstreamGrant,
    ) -> Result<IssuedSession, AppError> {
        let refresh_token = grant.refresh_token.as_deref().ok_or(AppError::NoRefreshToken)?;

        let principal = match self.store.find_by_upstream_account(upstream_account_id).await? {
            Some(existing) => existing,
            None => {
                let fresh = Principal::new(upstream_account_id, display_name.clone());
                self.store.insert(fresh.clone()).await?;
                tracing::info!(principal_id = %fresh.id, "Principal created");
                fresh
            }
        };

        let sealed = self.cipher.encrypt_str(refresh_token)?;
        let principal = self
            .store
            .record_login(principal.id, display_name, sealed, grant.refresh_expires_at)
            .await?;

        self.issue(&principal, &grant.access)
    }

    /// Invalidate every outstanding session of a principal.
    pub async fn revoke_all(&self, principal_id: Uuid) -> Result<u64, AppError> {
        let version = self.store.bump_token_version(principal_id).await?;
        tracing::info!(
            principal_id = %principal_id,
            token_version = version,
            "All sessions revoked"
        );
        Ok(version)
    }

    async fn load_current(&self, claims: &SessionClaims) -> Result<Principal, AppError> {
        let principal = self
            .store
            .get(claims.sub)
            .await?
            .ok_or(AppError::UserNotFound)?;

        if claims.ver != principal.token_version || claims.fam != principal.rotation_family {
            tracing::info!(
                principal_id = %principal.id,
                token_version = claims.ver,
                current_version = principal.token_version,
                "Rejected session with stale version or family"
            );
            return Err(AppError::SessionInvalidated);
        }
        Ok(principal)
    }

    async fn revoke_after_reuse(
        &self,
        principal_id: Uuid,
        family: Uuid,
    ) -> Result<RotationOutcome, AppError> {
        let revoked_version = self.store.revoke_family(principal_id, family).await?;
        tracing::warn!(
            principal_id = %principal_id,
            rotation_family = %family,
            token_version = revoked_version,
            "Superseded upstream credential presented, rotation family revoked"
        );
        metrics::record_credential_reuse();
        Ok(RotationOutcome::ReuseDetected { revoked_version })
    }

    fn classify(
        &self,
        current: &Principal,
        family: Uuid,
        observed_old: &str,
        new_credential: &str,
    ) -> StoredCredential {
        if current.rotation_family != family {
            return StoredCredential::Superseded;
        }
        let Some(sealed) = &current.refresh_credential else {
            return StoredCredential::Superseded;
        };
        let Ok(plain) = self.cipher.decrypt(sealed) else {
            return StoredCredential::Superseded;
        };
        if bool::from(plain.as_slice().ct_eq(observed_old.as_bytes())) {
            StoredCredential::Presented(sealed.clone())
        } else if bool::from(plain.as_slice().ct_eq(new_credential.as_bytes())) {
            StoredCredential::AlreadyRotated
        } else {
            StoredCredential::Superseded
        }
    }

    /// Session cookie first, then `Authorization: Bearer` for non-browser callers.
    fn extract_token(&self, headers: &HeaderMap) -> Option<String> {
        self.cookie.read(headers).or_else(|| bearer_token(headers))
    }
}

/// Token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AppError::UserNotFound,
            StoreError::Unavailable(msg) => AppError::ServerError(msg),
        }
    }
}

impl From<CryptoError> for AppError {
    fn from(e: CryptoError) -> Self {
        AppError::ServerError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AesGcmCipher;
    use crate::session::store::InMemoryPrincipalStore;
    use std::sync::Mutex;

    struct Harness {
        manager: SessionManager,
        store: Arc<InMemoryPrincipalStore>,
    }

    fn build(store: Arc<InMemoryPrincipalStore>, backing: Arc<dyn PrincipalStore>) -> Harness {
        let cipher = Arc::new(AesGcmCipher::from_key(&[9u8; 32]).unwrap());
        let config = SessionConfig {
            signing_secret: "session-signing-secret-for-tests-0001".into(),
            ..SessionConfig::default()
        };
        Harness {
            manager: SessionManager::new(&config, false, backing, cipher),
            store,
        }
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryPrincipalStore::new());
        build(store.clone(), store)
    }

    /// Harness whose store yields after every read, so two rotations started
    /// together both read before either writes.
    fn interleaving_harness() -> Harness {
        let store = Arc::new(InMemoryPrincipalStore::new());
        let yielding = Arc::new(YieldingStore {
            inner: store.clone(),
        });
        build(store, yielding)
    }

    struct YieldingStore {
        inner: Arc<InMemoryPrincipalStore>,
    }

    #[async_trait]
    impl PrincipalStore for YieldingStore {
        async fn get(&self, id: Uuid) -> Result<Option<Principal>, StoreError> {
            let found = self.inner.get(id).await;
            tokio::task::yield_now().await;
            found
        }

        async fn find_by_upstream_account(
            &self,
            account_id: &str,
        ) -> Result<Option<Principal>, StoreError> {
            self.inner.find_by_upstream_account(account_id).await
        }

        async fn insert(&self, principal: Principal) -> Result<(), StoreError> {
            self.inner.insert(principal).await
        }

        async fn record_login(
            &self,
            id: Uuid,
            display_name: Option<String>,
            credential: SealedSecret,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<Principal, StoreError> {
            self.inner
                .record_login(id, display_name, credential, expires_at)
                .await
        }

        async fn swap_credential(
            &self,
            id: Uuid,
            family: Uuid,
            expected: &SealedSecret,
            replacement: SealedSecret,
            expires_at: Option<DateTime<Utc>>,
        ) -> Result<CredentialSwap, StoreError> {
            self.inner
                .swap_credential(id, family, expected, replacement, expires_at)
                .await
        }

        async fn revoke_family(&self, id: Uuid, family: Uuid) -> Result<u64, StoreError> {
            self.inner.revoke_family(id, family).await
        }

        async fn bump_token_version(&self, id: Uuid) -> Result<u64, StoreError> {
            self.inner.bump_token_version(id).await
        }
    }

    fn rotated(outcomes: &[RotationOutcome]) -> usize {
        outcomes
            .iter()
            .filter(|o| matches!(o, RotationOutcome::Rotated { .. }))
            .count()
    }

    fn grant(refresh: Option<&str>) -> UpstreamGrant {
        UpstreamGrant {
            access: UpstreamAccess::new("access-1", 3600),
            refresh_token: refresh.map(str::to_string),
            refresh_expires_at: None,
        }
    }

    fn cookie_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_str(&format!("ls_session={token}")).unwrap(),
        );
        headers
    }

    async fn logged_in(h: &Harness, refresh: &str) -> IssuedSession {
        h.manager
            .complete_login("acct-1", Some("Ada".into()), grant(Some(refresh)))
            .await
            .unwrap()
    }

    struct FixedRefresher {
        next: Option<String>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CredentialRefresher for FixedRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<UpstreamGrant, AppError> {
            self.seen.lock().unwrap().push(refresh_token.to_string());
            Ok(UpstreamGrant {
                access: UpstreamAccess::new("access-2", 3600),
                refresh_token: self.next.clone(),
                refresh_expires_at: None,
            })
        }
    }

    #[tokio::test]
    async fn authenticates_issued_cookie_and_bearer() {
        let h = harness();
        let session = logged_in(&h, "r1").await;

        let auth = h.manager.authenticate(&cookie_headers(&session.token)).await.unwrap();
        assert_eq!(auth.principal.id, session.principal.id);
        assert_eq!(auth.upstream.access_token, "access-1");

        let mut bearer = HeaderMap::new();
        bearer.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", session.token)).unwrap(),
        );
        assert!(h.manager.authenticate(&bearer).await.is_ok());
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let h = harness();
        assert!(matches!(
            h.manager.authenticate(&HeaderMap::new()).await,
            Err(AppError::Unauthenticated)
        ));
        assert!(h.manager.optional_authenticate(&HeaderMap::new()).await.is_none());
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let h = harness();
        let session = logged_in(&h, "r1").await;
        h.manager.revoke_all(session.principal.id).await.unwrap();

        assert!(matches!(
            h.manager.authenticate(&cookie_headers(&session.token)).await,
            Err(AppError::SessionInvalidated)
        ));
    }

    #[tokio::test]
    async fn deleted_principal_is_user_not_found() {
        let h = harness();
        let other = harness();
        let session = logged_in(&other, "r1").await;
        assert!(matches!(
            h.manager.authenticate(&cookie_headers(&session.token)).await,
            Err(AppError::UserNotFound)
        ));
    }

    #[tokio::test]
    async fn undecryptable_credential_means_no_refresh_token() {
        let h = harness();
        let session = logged_in(&h, "r1").await;

        let mut p = h.store.get(session.principal.id).await.unwrap().unwrap();
        let foreign = AesGcmCipher::from_key(&[1u8; 32]).unwrap();
        p.refresh_credential = Some(foreign.encrypt_str("r1").unwrap());
        h.store.insert(p).await.unwrap();

        assert!(matches!(
            h.manager.authenticate(&cookie_headers(&session.token)).await,
            Err(AppError::NoRefreshToken)
        ));
    }

    #[tokio::test]
    async fn rotation_then_replay_of_old_credential_revokes_family() {
        let h = harness();
        let session = logged_in(&h, "r1").await;
        let p = session.principal.clone();

        let outcome = h.manager.rotate_upstream_credential(&p, "r2", "r1", None).await.unwrap();
        let RotationOutcome::Rotated { principal } = outcome else {
            panic!("expected rotation");
        };
        assert_eq!(h.manager.stored_credential(&principal).unwrap(), "r2");

        let replay = h.manager.rotate_upstream_credential(&p, "r3", "r1", None).await.unwrap();
        assert!(matches!(replay, RotationOutcome::ReuseDetected { revoked_version: 1 }));

        let revoked = h.store.get(p.id).await.unwrap().unwrap();
        assert_eq!(revoked.token_version, 1);
        assert!(revoked.refresh_credential.is_none());
        assert!(matches!(
            h.manager.authenticate(&cookie_headers(&session.token)).await,
            Err(AppError::SessionInvalidated)
        ));
    }

    #[tokio::test]
    async fn replay_after_many_rotations_is_always_detected() {
        for replay_index in 0..4 {
            let h = harness();
            let session = logged_in(&h, "r0").await;
            let mut principal = session.principal.clone();

            for i in 1..=4 {
                let outcome = h
                    .manager
                    .rotate_upstream_credential(
                        &principal,
                        &format!("r{i}"),
                        &format!("r{}", i - 1),
                        None,
                    )
                    .await
                    .unwrap();
                match outcome {
                    RotationOutcome::Rotated { principal: p } => principal = p,
                    other => panic!("unexpected {other:?}"),
                }
            }

            let before = principal.token_version;
            let outcome = h
                .manager
                .rotate_upstream_credential(&principal, "rx", &format!("r{replay_index}"), None)
                .await
                .unwrap();
            match outcome {
                RotationOutcome::ReuseDetected { revoked_version } => {
                    assert_eq!(revoked_version, before + 1)
                }
                other => panic!("replay of r{replay_index} not detected: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn racing_rotations_to_different_credentials_revoke_the_loser() {
        let h = interleaving_harness();
        let session = logged_in(&h, "r1").await;
        let p = session.principal.clone();

        let (a, b) = tokio::join!(
            h.manager.rotate_upstream_credential(&p, "r2a", "r1", None),
            h.manager.rotate_upstream_credential(&p, "r2b", "r1", None),
        );
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(rotated(&outcomes), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, RotationOutcome::ReuseDetected { revoked_version: 1 })));

        let stored = h.store.get(p.id).await.unwrap().unwrap();
        assert_eq!(stored.token_version, 1);
        assert!(stored.refresh_credential.is_none());
    }

    #[tokio::test]
    async fn racing_refreshes_of_a_non_rotating_credential_both_succeed() {
        let h = interleaving_harness();
        let session = logged_in(&h, "r1").await;
        let p = session.principal.clone();

        let (a, b) = tokio::join!(
            h.manager.rotate_upstream_credential(&p, "r1", "r1", None),
            h.manager.rotate_upstream_credential(&p, "r1", "r1", None),
        );
        assert_eq!(rotated(&[a.unwrap(), b.unwrap()]), 2);

        let stored = h.store.get(p.id).await.unwrap().unwrap();
        assert_eq!(stored.token_version, 0);
        assert_eq!(h.manager.stored_credential(&stored).unwrap(), "r1");
        assert!(h.manager.authenticate(&cookie_headers(&session.token)).await.is_ok());
    }

    #[tokio::test]
    async fn racing_rotations_to_the_same_credential_both_succeed() {
        let h = interleaving_harness();
        let session = logged_in(&h, "r1").await;
        let p = session.principal.clone();

        let (a, b) = tokio::join!(
            h.manager.rotate_upstream_credential(&p, "r2", "r1", None),
            h.manager.rotate_upstream_credential(&p, "r2", "r1", None),
        );
        assert_eq!(rotated(&[a.unwrap(), b.unwrap()]), 2);

        let stored = h.store.get(p.id).await.unwrap().unwrap();
        assert_eq!(stored.token_version, 0);
        assert_eq!(h.manager.stored_credential(&stored).unwrap(), "r2");
    }

    #[tokio::test]
    async fn parallel_refresh_sessions_without_provider_rotation_stay_signed_in() {
        let h = interleaving_harness();
        let session = logged_in(&h, "r1").await;
        let refresher = FixedRefresher {
            next: None,
            seen: Mutex::new(Vec::new()),
        };

        let (a, b) = tokio::join!(
            h.manager.refresh_session(&session.principal, &refresher),
            h.manager.refresh_session(&session.principal, &refresher),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(refresher.seen.lock().unwrap().len(), 2);
        assert!(h.manager.authenticate(&cookie_headers(&a.token)).await.is_ok());
        assert!(h.manager.authenticate(&cookie_headers(&b.token)).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_session_rotates_and_reissues() {
        let h = harness();
        let session = logged_in(&h, "r1").await;
        let refresher = FixedRefresher {
            next: Some("r2".into()),
            seen: Mutex::new(Vec::new()),
        };

        let renewed = h.manager.refresh_session(&session.principal, &refresher).await.unwrap();
        assert_eq!(refresher.seen.lock().unwrap().as_slice(), ["r1".to_string()]);
        assert_eq!(renewed.access.access_token, "access-2");
        assert_eq!(h.manager.stored_credential(&renewed.principal).unwrap(), "r2");

        let auth = h.manager.authenticate(&cookie_headers(&renewed.token)).await.unwrap();
        assert_eq!(auth.upstream.access_token, "access-2");
    }

    #[tokio::test]
    async fn refresh_keeps_credential_when_provider_does_not_rotate() {
        let h = harness();
        let session = logged_in(&h, "r1").await;
        let refresher = FixedRefresher {
            next: None,
            seen: Mutex::new(Vec::new()),
        };

        let renewed = h.manager.refresh_session(&session.principal, &refresher).await.unwrap();
        assert_eq!(h.manager.stored_credential(&renewed.principal).unwrap(), "r1");
    }

    #[tokio::test]
    async fn login_without_refresh_token_is_rejected() {
        let h = harness();
        assert!(matches!(
            h.manager.complete_login("acct", None, grant(None)).await,
            Err(AppError::NoRefreshToken)
        ));
    }

    #[tokio::test]
    async fn second_login_keeps_principal_and_family() {
        let h = harness();
        let first = logged_in(&h, "r1").await;
        let second = logged_in(&h, "r1b").await;

        assert_eq!(first.principal.id, second.principal.id);
        assert_eq!(first.principal.rotation_family, second.principal.rotation_family);
        // The first device stays signed in.
        assert!(h.manager.authenticate(&cookie_headers(&first.token)).await.is_ok());
    }

    #[test]
    fn bearer_parsing() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
