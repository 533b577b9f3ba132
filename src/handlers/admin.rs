use axum::{extract::State, response::Json};
use std::sync::Arc;
use tracing::info;

use crate::{errors::ServiceError, handlers::AppState, services::sweep::SweepSummary};

/// Runs a reconciliation sweep and returns its summary. A sweep that is
/// already running anywhere answers 409.
pub async fn trigger_sweep(
    State(state): State<Arc<AppState>>,
) -> Result<Json<SweepSummary>, ServiceError> {
    info!("manual sweep requested");
    let sweep = state.services.sweep.clone();
    // Detached from the request: a disconnecting caller must not abandon the lease.
    let summary = tokio::spawn(async move { sweep.run().await })
        .await
        .map_err(|e| ServiceError::InternalError(format!("sweep task failed: {}", e)))??;
    Ok(Json(summary))
}
