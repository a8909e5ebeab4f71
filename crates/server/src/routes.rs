//! Route configuration.

use crate::handlers;
use crate::metrics::metrics_handler;
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let upload_routes = Router::new()
        .route(
            "/uploads",
            post(handlers::create_upload).options(handlers::options_uploads),
        )
        .route("/uploads/route", post(handlers::route_upload))
        .route("/uploads/complete-batch", post(handlers::complete_batch))
        .route("/uploads/check-duplicate", post(handlers::check_duplicate))
        .route("/uploads/stats", get(handlers::upload_stats))
        .route(
            "/uploads/{upload_id}",
            get(handlers::get_upload)
                .head(handlers::head_upload)
                .patch(handlers::patch_upload)
                .delete(handlers::delete_upload),
        )
        // PATCH bodies are bounded by server.max_chunk_size in the handler.
        .layer(DefaultBodyLimit::disable());

    let mut router = Router::new()
        .merge(upload_routes)
        .route("/health", get(handlers::health_check));

    // When enabled, /metrics should only be reachable by the scraper.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
