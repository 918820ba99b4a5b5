//! Prometheus metrics endpoint and HTTP request tracking middleware.

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

pub const HTTP_REQUESTS_TOTAL: &str = "wharfd_http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "wharfd_http_request_duration_seconds";

pub const BACKENDS_HEALTHY: &str = "wharfd_backends_healthy";
pub const BACKENDS_UNHEALTHY: &str = "wharfd_backends_unhealthy";
pub const HEALTH_CHECK_TOTAL: &str = "wharfd_health_check_total";
pub const HEALTH_CHECK_DURATION_SECONDS: &str = "wharfd_health_check_duration_seconds";

pub const RECONCILE_TOTAL: &str = "wharfd_reconcile_total";
pub const ROUTED_DOMAINS: &str = "wharfd_routed_domains";

pub const ACME_ISSUANCE_TOTAL: &str = "wharfd_acme_issuance_total";

/// Installs the process-wide Prometheus recorder and registers every
/// metric's help text. Call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();
    let handle = builder.install_recorder().expect("failed to install Prometheus recorder");

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of admin API HTTP requests");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "Admin API HTTP request duration in seconds");

    describe_gauge!(BACKENDS_HEALTHY, "Number of backends currently marked healthy");
    describe_gauge!(BACKENDS_UNHEALTHY, "Number of backends currently marked unhealthy");
    describe_counter!(HEALTH_CHECK_TOTAL, "Total number of health checks performed, by result");
    describe_histogram!(HEALTH_CHECK_DURATION_SECONDS, "Health check probe duration in seconds");

    describe_counter!(RECONCILE_TOTAL, "Total number of reconciliation passes, by trigger reason");
    describe_gauge!(ROUTED_DOMAINS, "Number of domains currently present in the route table");

    describe_counter!(ACME_ISSUANCE_TOTAL, "Total number of ACME certificate issuance attempts, by result");

    handle
}

/// `GET /metrics` — unauthenticated, Prometheus text exposition format.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state);

    match state.metrics_handle.as_ref() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::INTERNAL_SERVER_ERROR, "metrics not initialized".to_string()),
    }
}

fn update_gauge_metrics(state: &AppState) {
    let (_, healthy, unhealthy) = state.health.get_stats();
    gauge!(BACKENDS_HEALTHY).set(healthy as f64);
    gauge!(BACKENDS_UNHEALTHY).set(unhealthy as f64);
    gauge!(ROUTED_DOMAINS).set(state.routes.domains().len() as f64);
}

/// Records request count and latency for every admin API call, keyed by
/// method, matched route template, and status.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_health_check(healthy: bool, duration_secs: f64) {
    let result = if healthy { "success" } else { "failure" };
    counter!(HEALTH_CHECK_TOTAL, "result" => result).increment(1);
    histogram!(HEALTH_CHECK_DURATION_SECONDS).record(duration_secs);
}

pub fn record_reconcile(reason: &str) {
    counter!(RECONCILE_TOTAL, "reason" => reason.to_string()).increment(1);
}

pub fn record_acme_issuance(success: bool) {
    let result = if success { "success" } else { "failure" };
    counter!(ACME_ISSUANCE_TOTAL, "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_follow_prometheus_conventions() {
        assert!(HTTP_REQUESTS_TOTAL.contains("_total"));
        assert!(RECONCILE_TOTAL.contains("_total"));
        assert!(HTTP_REQUEST_DURATION_SECONDS.contains("_seconds"));
    }
}
