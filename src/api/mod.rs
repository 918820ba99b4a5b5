//! Admin API: a small bearer-token-protected surface for deployment
//! inspection, control, and log access, plus the unauthenticated `/health`
//! and `/metrics` endpoints.

pub mod admin;
pub mod auth;
pub mod daemonlog;
pub mod error;
pub mod metrics;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/deploy", post(admin::deploy))
        .route("/v1/deploy/:id/logs", get(admin::deploy_logs))
        .route("/v1/images/upload", post(admin::images_upload))
        .route("/v1/layers/check", post(admin::layers_check))
        .route("/v1/layers/upload", post(admin::layers_upload))
        .route("/v1/images/assemble", post(admin::images_assemble))
        .route("/v1/logs", get(admin::daemon_logs))
        .route("/v1/status/:app", get(admin::app_status))
        .route("/v1/rollback/:app", get(admin::rollback_status))
        .route("/v1/rollback", post(admin::rollback))
        .route("/v1/stop/:app", post(admin::stop_app))
        .route("/v1/exec/:app", post(admin::exec))
        .route("/v1/tunnel/:app", get(admin::tunnel))
        .route("/v1/version", get(admin::version))
        .route("/v1/upgrade", post(admin::upgrade))
        .route("/v1/upgrade/restart", post(admin::upgrade_restart))
        .route("/v1/logs/app/:app/stream", get(admin::app_logs_stream))
        .layer(middleware::from_fn_with_state(state.clone(), auth::auth_middleware));

    Router::new()
        .route("/health", get(admin::health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .merge(protected)
        .layer(middleware::from_fn(metrics::metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
