//! Health check and statistics endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::error::{AppError, Result};
use crate::isolation::{FactoryStats, IsolationKey, ManagerStats};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub active_managers: usize,
    pub background_cleanup_running: bool,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.factory.get_factory_stats().await;
    let status = if stats.is_shut_down {
        "shutting_down"
    } else {
        "healthy"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_managers: stats.active_managers,
        background_cleanup_running: stats.background_cleanup_running,
    })
}

/// GET /stats - factory snapshot
pub async fn stats(State(state): State<AppState>) -> Json<FactoryStats> {
    Json(state.factory.get_factory_stats().await)
}

/// GET /stats/managers/{key} - snapshot of one active manager
pub async fn manager_stats(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ManagerStats>> {
    let key = IsolationKey::from(key);
    let manager = state
        .factory
        .get_manager(&key)
        .await
        .ok_or_else(|| AppError::NotFound(format!("No active manager for {}", key)))?;

    Ok(Json(manager.get_manager_stats().await))
}
