//! HTTP surface of rampart.
//!
//! The proxy application routes every method and path into the decision
//! core; the metrics application answers any GET with the counter object
//! and serves the healthcheck.

use std::sync::Arc;

use axum::routing::get;
use axum::Router;

use rampart_service::metrics::ProxyMetrics;
use rampart_service::proxying::ProxyService;

mod error;
mod metrics;
mod proxy;
mod request_stats;

pub use error::ResponseError;
use request_stats::RequestStatsLayer;

/// Answers `ok`, bypassing all proxy logic.
pub async fn healthcheck() -> &'static str {
    "ok"
}

/// Builds the reverse proxy application.
pub fn create_app(service: ProxyService) -> Router {
    let stats = RequestStatsLayer::new(service.metrics());
    Router::new()
        .fallback(proxy::handle_request)
        .with_state(service)
        .layer(stats)
}

/// Builds the metrics application for the secondary listener.
pub fn create_metrics_app(metrics: Arc<ProxyMetrics>) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .fallback(get(metrics::counters))
        .with_state(metrics)
}
