pub mod metrics;
pub mod middleware;

use crate::state::AppState;
use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::timeout::TimeoutLayer;

pub fn create_router(state: Arc<AppState>) -> Router {
    let write_timeout = state.config.server.timeout.write;
    let log_requests = state.config.server.log.requests;

    let mut router = Router::new()
        .route("/metrics/backups", get(metrics::latest_backups))
        .with_state(state);

    if log_requests {
        router = router.layer(axum::middleware::from_fn(middleware::request_logging));
    }
    router = router.layer(axum::middleware::from_fn(middleware::request_id));

    if !write_timeout.is_zero() {
        router = router.layer(TimeoutLayer::new(write_timeout));
    }

    router
}
