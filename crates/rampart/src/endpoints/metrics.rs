//! The JSON counter endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use rampart_service::metrics::{ProxyMetrics, Snapshot};

/// Serves the counter object; the metrics listener answers this on any
/// path.
pub async fn counters(State(metrics): State<Arc<ProxyMetrics>>) -> Json<Snapshot> {
    Json(metrics.snapshot())
}
