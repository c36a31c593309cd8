use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::config::Environment;
use crate::error::AppError;
use crate::http::server::AppState;
use crate::resilience::circuit_breaker::CircuitSnapshot;

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub environment: Environment,
    pub uptime_secs: u64,
    pub rate_store: &'static str,
    pub rate_limiting_enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct RevokedView {
    pub principal_id: Uuid,
    pub token_version: u64,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        environment: state.config.environment,
        uptime_secs: state.started_at.elapsed().as_secs(),
        rate_store: state.limiter.store().name(),
        rate_limiting_enabled: state.limiter.policies().enabled,
    })
}

pub async fn get_circuits(State(state): State<AppState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.breakers.snapshot())
}

/// Invalidate every session of a principal.
pub async fn revoke_principal(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<RevokedView>, AppError> {
    let token_version = state.sessions.revoke_all(id).await.map_err(|e| match e {
        AppError::UserNotFound => AppError::NotFound,
        other => other,
    })?;
    Ok(Json(RevokedView {
        principal_id: id,
        token_version,
    }))
}
