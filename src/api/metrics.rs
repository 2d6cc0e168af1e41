//! Prometheus metrics endpoint.

use axum::{extract::State, http::header, response::IntoResponse};

use crate::error::{AppError, Result};
use crate::metrics::{self, ManagerLifecycleMetrics};
use crate::server::AppState;

/// GET /metrics - Prometheus metrics endpoint
pub async fn prometheus_metrics(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let stats = state.factory.get_factory_stats().await;
    ManagerLifecycleMetrics::set_active(stats.active_managers, stats.user_distribution.len());

    let output = metrics::encode_metrics()
        .map_err(|e| AppError::Internal(format!("Failed to encode metrics: {}", e)))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    ))
}
