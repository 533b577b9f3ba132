pub mod admin;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

// Re-export AppState so handler modules can import it as crate::handlers::AppState
pub use crate::AppState;

/// Admin surface: health probes and the manual sweep trigger.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::readiness_check))
        .route("/health/live", get(health::liveness_check))
        .route("/admin/sweep", post(admin::trigger_sweep))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
