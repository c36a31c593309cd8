//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the service.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServiceConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Deployment environment. Controls cookie `Secure` flags and error detail exposure.
    pub environment: Environment,

    /// Session token signing and lifetime.
    pub session: SessionConfig,

    /// At-rest encryption of upstream credentials.
    pub encryption: EncryptionConfig,

    /// Double-submit CSRF settings.
    pub csrf: CsrfConfig,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Upstream provider endpoints and OAuth client.
    pub upstream: UpstreamConfig,

    /// Circuit breaker and retry configuration.
    pub resilience: ResilienceConfig,

    /// Machine-to-machine endpoints.
    pub internal: InternalConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,

    /// Whole-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
            request_timeout_secs: 30,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// Session token configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// HMAC secret for HS256 session tokens. Must differ from the encryption key.
    pub signing_secret: String,

    /// `iss` claim written into and required from session tokens.
    pub issuer: String,

    /// Session token lifetime in seconds.
    pub ttl_secs: u64,

    /// How long after issuance an expired token may still be exchanged at `/auth/refresh`.
    pub refresh_window_secs: u64,

    /// Clock skew tolerance in seconds.
    pub leeway_secs: u64,

    /// Session cookie name.
    pub cookie_name: String,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn refresh_window(&self) -> Duration {
        Duration::from_secs(self.refresh_window_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            signing_secret: String::new(),
            issuer: "listenstats".to_string(),
            ttl_secs: 3600,
            refresh_window_secs: 30 * 24 * 3600,
            leeway_secs: 30,
            cookie_name: "ls_session".to_string(),
        }
    }
}

/// Credential encryption configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Hex-encoded 32-byte AES-256-GCM key.
    pub key_hex: String,
}

/// CSRF configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CsrfConfig {
    pub cookie_name: String,
    pub header_name: String,
    pub max_age_secs: u64,
    /// Path prefixes authenticated by another mechanism (bearer secrets).
    pub exempt_prefixes: Vec<String>,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self {
            cookie_name: "csrf_token".to_string(),
            header_name: "x-csrf-token".to_string(),
            max_age_secs: 24 * 3600,
            exempt_prefixes: vec!["/internal/".to_string()],
        }
    }
}

/// Which backing store holds rate-limit counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateStoreKind {
    /// In-process map. Correct for a single instance only.
    #[default]
    Memory,
    /// Shared Redis. Required when running more than one instance.
    Redis,
}

/// Limits for one route class.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyConfig {
    /// Window length in seconds.
    pub window_secs: u64,

    /// Maximum requests allowed within one window.
    pub max_requests: u32,

    /// Key by `user:ip` when a session is present instead of ip alone.
    #[serde(default)]
    pub per_user: bool,
}

impl PolicyConfig {
    fn new(window_secs: u64, max_requests: u32, per_user: bool) -> Self {
        Self {
            window_secs,
            max_requests,
            per_user,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Counter store.
    pub store: RateStoreKind,

    /// Redis URL, required when `store = "redis"`.
    pub redis_url: Option<String>,

    /// How often expired in-memory windows are swept.
    pub sweep_interval_secs: u64,

    /// Use the left-most `X-Forwarded-For` entry as the client ip.
    pub trust_forwarded_for: bool,

    pub general: PolicyConfig,
    pub auth: PolicyConfig,
    pub api: PolicyConfig,
    pub bulk_import: PolicyConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: RateStoreKind::Memory,
            redis_url: None,
            sweep_interval_secs: 60,
            trust_forwarded_for: false,
            general: PolicyConfig::new(60, 300, false),
            auth: PolicyConfig::new(900, 20, false),
            api: PolicyConfig::new(60, 120, true),
            bulk_import: PolicyConfig::new(3600, 5, true),
        }
    }
}

/// Upstream provider configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Accounts host (authorize + token endpoints).
    pub accounts_url: String,

    /// Resource API base URL.
    pub api_url: String,

    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,

    /// Where the browser lands after a successful login.
    pub post_login_redirect: String,

    /// Fixed per-call timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            accounts_url: "https://accounts.spotify.com".to_string(),
            api_url: "https://api.spotify.com/v1".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            redirect_uri: "http://localhost:8080/auth/callback".to_string(),
            scopes: vec![
                "user-read-recently-played".to_string(),
                "user-top-read".to_string(),
                "user-read-private".to_string(),
            ],
            post_login_redirect: "/".to_string(),
            request_timeout_ms: 5000,
        }
    }
}

/// Circuit breaker and retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Failures within the rolling window that open the circuit.
    pub failure_threshold: u32,

    /// Rolling window in seconds over which failures are counted.
    pub rolling_window_secs: u64,

    /// Time the circuit stays open before allowing a trial call.
    pub cooldown_secs: u64,

    /// Maximum attempts per call, including the first.
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Cap for computed backoff delays in milliseconds.
    pub max_delay_ms: u64,

    /// Longest upstream `Retry-After` hint that is waited for.
    pub max_retry_after_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            rolling_window_secs: 60,
            cooldown_secs: 30,
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            max_retry_after_secs: 10,
        }
    }
}

/// Machine-to-machine endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct InternalConfig {
    /// Static bearer secret for `/internal/*` (scheduled jobs, operators).
    pub bearer_secret: String,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines. Defaults to on in production.
    pub json_logs: Option<bool>,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: None,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
