//! Shared utilities for integration tests: a programmable mock provider and a live app.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{COOKIE, LOCATION, SET_COOKIE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use listenstats::crypto::AesGcmCipher;
use listenstats::lifecycle::build_state;
use listenstats::{AppState, HttpServer, ServiceConfig, ServiceRoutes, Shutdown};

pub const INTERNAL_SECRET: &str = "internal-test-secret";
pub const SESSION_COOKIE: &str = "ls_session";
pub const CSRF_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";
pub const GOOD_CODE: &str = "good-code";

/// A request as seen by the mock backend.
#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl MockRequest {
    pub fn form(&self) -> HashMap<String, String> {
        url::form_urlencoded::parse(self.body.as_bytes())
            .into_owned()
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MockResponse {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Start a programmable mock backend on an ephemeral port.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(MockRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MockResponse> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let Some(request) = read_request(&mut socket).await else {
                            return;
                        };
                        let response = f(request).await;
                        let mut raw = format!("HTTP/1.1 {} Mock\r\n", response.status);
                        for (name, value) in &response.headers {
                            raw.push_str(&format!("{name}: {value}\r\n"));
                        }
                        raw.push_str(&format!(
                            "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                            response.body.len(),
                            response.body
                        ));
                        let _ = socket.write_all(raw.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

async fn read_request(socket: &mut TcpStream) -> Option<MockRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split(' ');
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: HashMap<String, String> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let body_start = head_end + 4;
    while buf.len() < body_start + content_length {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let body_end = buf.len().min(body_start + content_length);
    let body = String::from_utf8_lossy(&buf[body_start..body_end]).to_string();

    Some(MockRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Knobs and counters of the mock OAuth provider and resource API.
#[derive(Debug)]
pub struct Provider {
    /// Token endpoint calls with `grant_type=refresh_token`.
    pub refresh_calls: AtomicU32,
    /// Resource API calls other than `/v1/me`.
    pub api_calls: AtomicU32,
    /// Non-zero: every resource API call answers with this status.
    pub api_failure: AtomicU16,
    /// The next this-many resource API calls answer 503.
    pub fail_next: AtomicU32,
    /// Non-zero: `Retry-After` seconds sent with failures.
    pub retry_after_secs: AtomicU64,
    /// Non-zero: resource API calls stall this long.
    pub api_delay_ms: AtomicU64,
    /// `expires_in` of issued access tokens.
    pub access_expires_in: AtomicI64,
}

impl Default for Provider {
    fn default() -> Self {
        Self {
            refresh_calls: AtomicU32::new(0),
            api_calls: AtomicU32::new(0),
            api_failure: AtomicU16::new(0),
            fail_next: AtomicU32::new(0),
            retry_after_secs: AtomicU64::new(0),
            api_delay_ms: AtomicU64::new(0),
            access_expires_in: AtomicI64::new(3600),
        }
    }
}

impl Provider {
    async fn respond(&self, request: MockRequest) -> MockResponse {
        let path = request.path.split('?').next().unwrap_or_default().to_string();
        match (request.method.as_str(), path.as_str()) {
            ("POST", "/api/token") => self.token(&request),
            ("GET", "/v1/me") => MockResponse::json(
                200,
                serde_json::json!({ "id": "user-1", "display_name": "Ada" }),
            ),
            ("GET", p) if p.starts_with("/v1/") => {
                self.api_calls.fetch_add(1, Ordering::SeqCst);
                let delay = self.api_delay_ms.load(Ordering::SeqCst);
                if delay > 0 {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                let scripted = self
                    .fail_next
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                let failure = if scripted { 503 } else { self.api_failure.load(Ordering::SeqCst) };
                match failure {
                    0 => MockResponse::json(
                        200,
                        serde_json::json!({
                            "path": request.path,
                            "authorization": request.headers.get("authorization"),
                        }),
                    ),
                    status => {
                        let body = serde_json::json!({ "error": "unavailable" });
                        let response = MockResponse::json(status, body);
                        match self.retry_after_secs.load(Ordering::SeqCst) {
                            0 => response,
                            secs => response.with_header("Retry-After", &secs.to_string()),
                        }
                    }
                }
            }
            _ => MockResponse::json(404, serde_json::json!({ "error": "not found" })),
        }
    }

    fn token(&self, request: &MockRequest) -> MockResponse {
        let form = request.form();
        let expires_in = self.access_expires_in.load(Ordering::SeqCst);
        match form.get("grant_type").map(String::as_str) {
            Some("authorization_code")
                if form.get("code").map(String::as_str) == Some(GOOD_CODE) =>
            {
                MockResponse::json(
                    200,
                    serde_json::json!({
                        "access_token": "access-0",
                        "token_type": "Bearer",
                        "expires_in": expires_in,
                        "refresh_token": "refresh-0",
                    }),
                )
            }
            Some("refresh_token") => {
                let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
                MockResponse::json(
                    200,
                    serde_json::json!({
                        "access_token": format!("access-{n}"),
                        "token_type": "Bearer",
                        "expires_in": expires_in,
                        "refresh_token": format!("refresh-{n}"),
                    }),
                )
            }
            _ => MockResponse::json(400, serde_json::json!({ "error": "invalid_grant" })),
        }
    }
}

/// Start the mock provider and return it with its address.
pub async fn start_provider() -> (Arc<Provider>, SocketAddr) {
    let provider = Arc::new(Provider::default());
    let p = provider.clone();
    let addr = start_programmable_backend(move |request| {
        let p = p.clone();
        async move { p.respond(request).await }
    })
    .await;
    (provider, addr)
}

/// Development config pointing at `upstream`, with fast resilience settings.
pub fn test_config(upstream: SocketAddr) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.encryption.key_hex = AesGcmCipher::generate_key();
    config.session.signing_secret = "integration-signing-secret-0123456789abcdef".into();
    config.internal.bearer_secret = INTERNAL_SECRET.into();

    config.upstream.accounts_url = format!("http://{upstream}");
    config.upstream.api_url = format!("http://{upstream}/v1");
    config.upstream.client_id = "client-id".into();
    config.upstream.client_secret = "client-secret".into();
    config.upstream.post_login_redirect = "/dashboard".into();
    config.upstream.request_timeout_ms = 300;

    config.resilience.failure_threshold = 3;
    config.resilience.rolling_window_secs = 30;
    config.resilience.cooldown_secs = 1;
    config.resilience.max_attempts = 1;
    config.resilience.base_delay_ms = 10;
    config.resilience.max_delay_ms = 50;
    config.resilience.max_retry_after_secs = 1;

    config.rate_limit.general.max_requests = 1000;
    config.rate_limit.auth.max_requests = 1000;
    config.rate_limit.api.max_requests = 1000;
    config.rate_limit.bulk_import.max_requests = 1000;
    config
}

/// A running instance of the service.
pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
    pub client: reqwest::Client,
    shutdown: Shutdown,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

pub async fn spawn_app(config: ServiceConfig) -> TestApp {
    spawn_app_with(config, ServiceRoutes::default()).await
}

pub async fn spawn_app_with(config: ServiceConfig, routes: ServiceRoutes) -> TestApp {
    let state = build_state(config).await.expect("state builds");
    let shutdown = Shutdown::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = HttpServer::new(state.clone(), routes);
    tokio::spawn(server.run(listener, shutdown.wait()));

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .no_proxy()
        .build()
        .unwrap();

    TestApp {
        addr,
        state,
        client,
        shutdown,
    }
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Full browser login against the mock provider, then fetch a CSRF token.
    pub async fn login(&self) -> BrowserSession {
        let res = self.client.get(self.url("/auth/login")).send().await.unwrap();
        assert_eq!(res.status(), 303);
        let state_cookie = set_cookie(&res, "ls_oauth_state").expect("state cookie");
        let location = res.headers()[LOCATION].to_str().unwrap().to_string();
        let authorize = url::Url::parse(&location).unwrap();
        let oauth_state = authorize
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .expect("state parameter");
        assert_eq!(state_cookie, oauth_state);

        let res = self
            .client
            .get(self.url(&format!("/auth/callback?code={GOOD_CODE}&state={oauth_state}")))
            .header(COOKIE, format!("ls_oauth_state={oauth_state}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 303, "callback should redirect");
        assert_eq!(res.headers()[LOCATION], "/dashboard");
        let session = set_cookie(&res, SESSION_COOKIE).expect("session cookie");

        let res = self
            .client
            .get(self.url("/auth/csrf"))
            .header(COOKIE, format!("{SESSION_COOKIE}={session}"))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 200);
        let csrf = set_cookie(&res, CSRF_COOKIE).expect("csrf cookie");

        BrowserSession { session, csrf }
    }
}

/// Cookies a browser would hold after login.
#[derive(Debug, Clone)]
pub struct BrowserSession {
    pub session: String,
    pub csrf: String,
}

impl BrowserSession {
    pub fn cookie_header(&self) -> String {
        format!("{SESSION_COOKIE}={}; {CSRF_COOKIE}={}", self.session, self.csrf)
    }

    /// Authenticated request carrying both cookies and the CSRF header.
    pub fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request
            .header(COOKIE, self.cookie_header())
            .header(CSRF_HEADER, &self.csrf)
    }
}

/// Value set for cookie `name` by the response, if any.
pub fn set_cookie(res: &reqwest::Response, name: &str) -> Option<String> {
    res.headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.to_string())
}

/// Problem-details body of an error response.
pub async fn problem(res: reqwest::Response) -> serde_json::Value {
    assert_eq!(
        res.headers()["content-type"],
        "application/problem+json",
        "error responses use problem+json"
    );
    res.json().await.unwrap()
}
