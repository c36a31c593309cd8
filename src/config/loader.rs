//! Configuration loading from disk and environment.

use std::fs;
use std::path::Path;

use crate::config::schema::ServiceConfig;
use crate::config::validation::{validate_config, ValidationError};

pub const ENV_SESSION_SECRET: &str = "LISTENSTATS_SESSION_SECRET";
pub const ENV_ENCRYPTION_KEY: &str = "LISTENSTATS_ENCRYPTION_KEY";
pub const ENV_INTERNAL_SECRET: &str = "LISTENSTATS_INTERNAL_SECRET";
pub const ENV_UPSTREAM_CLIENT_SECRET: &str = "LISTENSTATS_UPSTREAM_CLIENT_SECRET";

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load, apply environment overrides and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ServiceConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let mut config: ServiceConfig = toml::from_str(&content)?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Build configuration from defaults plus environment overrides, then validate.
pub fn load_from_env() -> Result<ServiceConfig, ConfigError> {
    let mut config = ServiceConfig::default();
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Secrets never need to live in the config file.
pub fn apply_env_overrides<F>(config: &mut ServiceConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup(ENV_SESSION_SECRET) {
        config.session.signing_secret = v;
    }
    if let Some(v) = lookup(ENV_ENCRYPTION_KEY) {
        config.encryption.key_hex = v;
    }
    if let Some(v) = lookup(ENV_INTERNAL_SECRET) {
        config.internal.bearer_secret = v;
    }
    if let Some(v) = lookup(ENV_UPSTREAM_CLIENT_SECRET) {
        config.upstream.client_secret = v;
    }
}
