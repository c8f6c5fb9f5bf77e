//! Prometheus scrape endpoint.
//!
//! Serves the text exposition of [`TrafficMetrics`] at `/metrics`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::metrics::error::MetricsError;
use crate::metrics::registry::TrafficMetrics;

async fn metrics_handler(State(metrics): State<Arc<TrafficMetrics>>) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || metrics.gather_text()).await {
        Ok(Ok(body)) => (StatusCode::OK, body),
        Ok(Err(e)) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Failed to encode metrics: {e}"))
        }
        Err(e) => {
            error!("Metrics gathering task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics".to_string())
        }
    }
}

pub fn router(metrics: Arc<TrafficMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

/// Binds `listen` and serves until the task is dropped or the listener fails.
pub async fn serve(listen: SocketAddr, metrics: Arc<TrafficMetrics>) -> Result<(), MetricsError> {
    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| MetricsError::bind_address(listen.to_string(), e))?;

    info!("Serving metrics on http://{}/metrics", listen);

    axum::serve(listener, router(metrics))
        .await
        .map_err(MetricsError::ServeError)
}
