//! Configuration validation.
//!
//! Serde handles syntax; this checks semantics. All problems are reported at
//! once so an operator can fix a config file in one pass.

use url::Url;

use crate::config::schema::{PolicyConfig, RateStoreKind, ServiceConfig};

/// Minimum length of the session signing secret in bytes.
pub const MIN_SIGNING_SECRET_LEN: usize = 32;

/// Minimum length of the machine-to-machine bearer secret in bytes.
pub const MIN_INTERNAL_SECRET_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("session.signing_secret must be at least {MIN_SIGNING_SECRET_LEN} bytes")]
    WeakSigningSecret,

    #[error("encryption.key_hex must be 64 hex characters (32 bytes)")]
    InvalidEncryptionKey,

    #[error("session signing secret and encryption key must be independent")]
    SharedKeyMaterial,

    #[error("internal.bearer_secret must be at least {MIN_INTERNAL_SECRET_LEN} bytes")]
    WeakInternalSecret,

    #[error("{field} is not a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },

    #[error("rate_limit.{class} needs a non-zero window and ceiling")]
    InvalidPolicy { class: &'static str },

    #[error("rate_limit.redis_url is required when store = \"redis\"")]
    MissingRedisUrl,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("session.ttl_secs must not exceed session.refresh_window_secs")]
    TtlExceedsRefreshWindow,

    #[error("upstream.client_id is required in production")]
    MissingClientId,

    #[error("upstream.redirect_uri must use https in production")]
    InsecureRedirect,
}

/// Validate a configuration, returning every error found.
pub fn validate_config(config: &ServiceConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.session.signing_secret.len() < MIN_SIGNING_SECRET_LEN {
        errors.push(ValidationError::WeakSigningSecret);
    }

    match hex::decode(config.encryption.key_hex.trim()) {
        Ok(key) if key.len() == 32 => {
            // A signing secret equal to the key's hex text or its raw bytes would tie
            // both together.
            let secret = config.session.signing_secret.as_bytes();
            if secret == key.as_slice() || secret == config.encryption.key_hex.trim().as_bytes() {
                errors.push(ValidationError::SharedKeyMaterial);
            }
        }
        _ => errors.push(ValidationError::InvalidEncryptionKey),
    }

    if config.internal.bearer_secret.len() < MIN_INTERNAL_SECRET_LEN {
        errors.push(ValidationError::WeakInternalSecret);
    }

    for (field, value) in [
        ("upstream.accounts_url", &config.upstream.accounts_url),
        ("upstream.api_url", &config.upstream.api_url),
        ("upstream.redirect_uri", &config.upstream.redirect_uri),
    ] {
        if Url::parse(value).is_err() {
            errors.push(ValidationError::InvalidUrl {
                field,
                value: value.clone(),
            });
        }
    }

    let rl = &config.rate_limit;
    for (class, policy) in [
        ("general", &rl.general),
        ("auth", &rl.auth),
        ("api", &rl.api),
        ("bulk_import", &rl.bulk_import),
    ] {
        if !policy_is_valid(policy) {
            errors.push(ValidationError::InvalidPolicy { class });
        }
    }
    if rl.store == RateStoreKind::Redis {
        match &rl.redis_url {
            None => errors.push(ValidationError::MissingRedisUrl),
            Some(u) if Url::parse(u).is_err() => errors.push(ValidationError::InvalidUrl {
                field: "rate_limit.redis_url",
                value: u.clone(),
            }),
            Some(_) => {}
        }
    }

    let res = &config.resilience;
    for (field, value) in [
        ("resilience.failure_threshold", res.failure_threshold as u64),
        ("resilience.cooldown_secs", res.cooldown_secs),
        ("resilience.rolling_window_secs", res.rolling_window_secs),
        ("resilience.max_attempts", res.max_attempts as u64),
        ("upstream.request_timeout_ms", config.upstream.request_timeout_ms),
        ("session.ttl_secs", config.session.ttl_secs),
    ] {
        if value == 0 {
            errors.push(ValidationError::Zero { field });
        }
    }

    if config.session.ttl_secs > config.session.refresh_window_secs {
        errors.push(ValidationError::TtlExceedsRefreshWindow);
    }

    if config.environment.is_production() {
        if config.upstream.client_id.is_empty() {
            errors.push(ValidationError::MissingClientId);
        }
        if !config.upstream.redirect_uri.starts_with("https://") {
            errors.push(ValidationError::InsecureRedirect);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn policy_is_valid(policy: &PolicyConfig) -> bool {
    policy.window_secs > 0 && policy.max_requests > 0
}
