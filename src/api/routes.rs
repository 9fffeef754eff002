use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let upload_limit = state.config.max_upload_size as usize;

    let mut router = Router::new()
        // Files
        .route("/files", get(handlers::list_files))
        .route(
            "/files",
            post(handlers::create_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/:id", delete(handlers::delete_file))
        .route("/files/:id", get(handlers::get_file))
        .route("/files/:id/version", get(handlers::get_file_version))
        // Stored content by name
        .route("/static/*name", get(handlers::serve_static))
        // Internal
        .route("/_internal/health", get(handlers::health))
        .route("/_internal/reconcile", post(handlers::reconcile_now))
        .route("/_internal/status", get(handlers::pool_status));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled: DELETE /admin/purge is routed");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
