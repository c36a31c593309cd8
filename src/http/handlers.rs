//! Authentication and API handlers.

use axum::{
    extract::{Path, Query, RawQuery, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Extension, Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::AppError;
use crate::http::cookies::{append_set_cookie, read_cookie, CookieSpec};
use crate::http::server::AppState;
use crate::session::{Authenticated, IssuedSession, Principal};

/// Cookie holding the OAuth `state` between login and callback.
pub const OAUTH_STATE_COOKIE: &str = "ls_oauth_state";

/// Lifetime of a pending login.
const OAUTH_STATE_MAX_AGE_SECS: u64 = 600;

#[derive(Debug, Serialize)]
pub struct UserView {
    pub id: Uuid,
    pub upstream_account_id: String,
    pub display_name: Option<String>,
}

impl From<&Principal> for UserView {
    fn from(p: &Principal) -> Self {
        Self {
            id: p.id,
            upstream_account_id: p.upstream_account_id.clone(),
            display_name: p.display_name.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserView>,
}

#[derive(Debug, Serialize)]
pub struct RefreshedView {
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct CsrfView {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

fn oauth_state_cookie(state: &AppState) -> CookieSpec {
    CookieSpec::new(
        OAUTH_STATE_COOKIE,
        std::time::Duration::from_secs(OAUTH_STATE_MAX_AGE_SECS),
        state.config.environment.is_production(),
    )
}

fn with_session_cookie(mut response: Response, issued: &IssuedSession) -> Response {
    append_set_cookie(response.headers_mut(), issued.set_cookie.clone());
    response
}

/// `GET /auth/login`: redirect to the provider with a fresh `state`.
pub async fn login(State(state): State<AppState>) -> Result<Response, AppError> {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let oauth_state = URL_SAFE_NO_PAD.encode(bytes);

    let url = state.upstream.authorize_url(&oauth_state)?;
    let mut response = Redirect::to(url.as_str()).into_response();
    append_set_cookie(response.headers_mut(), oauth_state_cookie(&state).set(&oauth_state)?);

    tracing::debug!("Login redirect issued");
    Ok(response)
}

/// `GET /auth/callback`: finish the login, create or update the principal, issue a session.
pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    if let Some(error) = params.error {
        tracing::info!(error = %error, "Upstream authorization denied");
        return Err(AppError::BadRequest("authorization was not granted".into()));
    }

    let expected = read_cookie(&headers, OAUTH_STATE_COOKIE);
    let state_matches = match (expected.as_deref(), params.state.as_deref()) {
        (Some(expected), Some(received)) => {
            bool::from(expected.as_bytes().ct_eq(received.as_bytes()))
        }
        _ => false,
    };
    if !state_matches {
        tracing::warn!("OAuth state mismatch on callback");
        return Err(AppError::BadRequest("invalid OAuth state".into()));
    }
    let code = params
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::BadRequest("missing authorization code".into()))?;

    let grant = state.upstream.exchange_code(&code).await?;
    let profile = state.upstream.current_profile(&grant.access.access_token).await?;
    let issued = state
        .sessions
        .complete_login(&profile.id, profile.display_name.clone(), grant)
        .await?;

    tracing::info!(principal_id = %issued.principal.id, "Login completed");

    let mut response = Redirect::to(&state.config.upstream.post_login_redirect).into_response();
    append_set_cookie(response.headers_mut(), oauth_state_cookie(&state).clear()?);
    Ok(with_session_cookie(response, &issued))
}

/// `POST /auth/refresh`: rotate the upstream credential and reissue the session.
pub async fn refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let principal = state.sessions.authenticate_for_refresh(&headers).await?;
    let issued = state
        .sessions
        .refresh_session(&principal, state.upstream.as_ref())
        .await?;

    let response = Json(RefreshedView {
        expires_at: issued.expires_at,
    })
    .into_response();
    Ok(with_session_cookie(response, &issued))
}

/// `POST /auth/logout`: clear this browser's cookies.
pub async fn logout(State(state): State<AppState>) -> Result<Response, AppError> {
    clear_cookies(&state)
}

/// `POST /auth/logout-all`: invalidate every session of the principal.
pub async fn logout_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let auth = state.sessions.authenticate(&headers).await?;
    state.sessions.revoke_all(auth.principal.id).await?;
    clear_cookies(&state)
}

fn clear_cookies(state: &AppState) -> Result<Response, AppError> {
    let mut response = StatusCode::NO_CONTENT.into_response();
    append_set_cookie(response.headers_mut(), state.sessions.clear_cookie()?);
    append_set_cookie(response.headers_mut(), state.csrf.clear_cookie()?);
    Ok(response)
}

/// `GET /auth/session`: who is signed in, if anyone.
pub async fn session(State(state): State<AppState>, headers: HeaderMap) -> Json<SessionView> {
    let auth = state.sessions.optional_authenticate(&headers).await;
    Json(SessionView {
        authenticated: auth.is_some(),
        user: auth.as_ref().map(|a| UserView::from(&a.principal)),
    })
}

/// `GET /auth/csrf`: the CSRF token, also set as cookie and response header.
pub async fn csrf_token(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let mut response_headers = HeaderMap::new();
    let token = state.csrf.issue_if_absent(&headers, &mut response_headers)?;

    let mut response = Json(CsrfView { token }).into_response();
    for (name, value) in response_headers.iter() {
        response.headers_mut().append(name.clone(), value.clone());
    }
    Ok(response)
}

/// `GET /api/me`
pub async fn me(Extension(auth): Extension<Authenticated>) -> Json<UserView> {
    Json(UserView::from(&auth.principal))
}

/// `GET /api/upstream/{*path}`: read-only upstream call with the session's access credential.
pub async fn upstream_proxy(
    State(state): State<AppState>,
    Extension(auth): Extension<Authenticated>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
) -> Result<Response, AppError> {
    let reissued = state
        .sessions
        .ensure_fresh_access(&auth, state.upstream.as_ref())
        .await?;
    let access_token = reissued
        .as_ref()
        .map(|issued| issued.access.access_token.as_str())
        .unwrap_or(auth.upstream.access_token.as_str());

    let body: serde_json::Value = state
        .upstream
        .get_json(access_token, &path, query.as_deref())
        .await?;

    let response = Json(body).into_response();
    Ok(match reissued {
        Some(issued) => with_session_cookie(response, &issued),
        None => response,
    })
}

/// Fallback for unmatched routes.
pub async fn not_found() -> AppError {
    AppError::NotFound
}

/// `GET /health`
pub async fn health() -> &'static str {
    "ok"
}
