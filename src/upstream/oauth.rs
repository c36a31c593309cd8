//! Authorization-code login and credential refresh against the accounts host.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use url::Url;

use crate::error::AppError;
use crate::session::{UpstreamAccess, UpstreamGrant};
use crate::upstream::client::{UpstreamClient, ACCOUNTS};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
    /// Lifetime of the refresh token, when the provider reports one.
    #[serde(default)]
    refresh_token_expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_grant(self, now: DateTime<Utc>) -> UpstreamGrant {
        UpstreamGrant {
            access: UpstreamAccess::new(self.access_token, self.expires_in),
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            refresh_expires_at: self
                .refresh_token_expires_in
                .map(|secs| now + chrono::Duration::seconds(secs)),
        }
    }
}

impl UpstreamClient {
    /// Provider authorize URL for a login carrying `state`.
    pub fn authorize_url(&self, state: &str) -> Result<Url, AppError> {
        let base = format!("{}/authorize", self.config.accounts_url.trim_end_matches('/'));
        let mut url = Url::parse(&base)
            .map_err(|e| AppError::ServerError(format!("invalid accounts url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("state", state);
        Ok(url)
    }

    /// Exchange an authorization code for credentials.
    pub async fn exchange_code(&self, code: &str) -> Result<UpstreamGrant, AppError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        self.token_request(&form).await
    }

    /// Trade the long-lived credential for a fresh access credential. The provider may
    /// or may not rotate the long-lived credential.
    pub async fn refresh_grant(&self, refresh_token: &str) -> Result<UpstreamGrant, AppError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&form).await
    }

    /// Codes are single-use and a rotating provider may already have consumed the
    /// refresh credential when an attempt times out, so token grants are never retried.
    async fn token_request(&self, form: &[(&str, &str)]) -> Result<UpstreamGrant, AppError> {
        let url = format!("{}/api/token", self.config.accounts_url.trim_end_matches('/'));
        let once = self.policy.single_attempt();
        let response: TokenResponse = self
            .send_json(ACCOUNTS, &once, || {
                self.http
                    .post(&url)
                    .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                    .form(form)
            })
            .await?;
        Ok(response.into_grant(Utc::now()))
    }
}
