//! Startup orchestration.
//!
//! Builds the stores the configuration asks for, then the shared `AppState`.
//! Any failure here is fatal.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::{RateStoreKind, ServiceConfig};
use crate::error::AppError;
use crate::http::AppState;
use crate::lifecycle::Shutdown;
use crate::security::{MemoryRateStore, RateLimitStore, RateStoreError, RedisRateStore};
use crate::session::{InMemoryPrincipalStore, PrincipalStore};

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("rate store unavailable: {0}")]
    RateStore(#[from] RateStoreError),

    #[error("redis rate store selected without rate_limit.redis_url")]
    MissingRedisUrl,

    #[error(transparent)]
    State(#[from] AppError),
}

/// Connect the configured rate store and assemble the application state.
pub async fn build_state(config: ServiceConfig) -> Result<AppState, StartupError> {
    let rate_store: Arc<dyn RateLimitStore> = match config.rate_limit.store {
        RateStoreKind::Memory => Arc::new(MemoryRateStore::new()),
        RateStoreKind::Redis => {
            let url = config
                .rate_limit
                .redis_url
                .as_deref()
                .ok_or(StartupError::MissingRedisUrl)?;
            Arc::new(RedisRateStore::connect(url).await?)
        }
    };
    let principals: Arc<dyn PrincipalStore> = Arc::new(InMemoryPrincipalStore::new());

    let state = AppState::new(config, principals, rate_store)?;

    tracing::info!(
        failure_threshold = state.config.resilience.failure_threshold,
        cooldown_secs = state.config.resilience.cooldown_secs,
        "Circuit breakers are per process; each instance trips independently"
    );
    Ok(state)
}

/// Periodically drop expired windows from the rate store until shutdown.
pub fn spawn_rate_store_sweeper(
    state: &AppState,
    shutdown: &Shutdown,
) -> tokio::task::JoinHandle<()> {
    let limiter = state.limiter.clone();
    let every = Duration::from_secs(state.config.rate_limit.sweep_interval_secs.max(1));
    let mut stop = shutdown.subscribe();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = limiter.store().sweep().await;
                    if removed > 0 {
                        tracing::debug!(removed, "Swept expired rate windows");
                    }
                }
                _ = stop.recv() => {
                    tracing::debug!("Rate store sweeper stopping");
                    break;
                }
            }
        }
    })
}
