use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!(
            "http_requests_total",
            "Total number of HTTP requests"
        );
        metrics::describe_histogram!(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        metrics::describe_gauge!(
            "ws_connections_active",
            "Number of currently open WebSocket connections"
        );
        metrics::describe_gauge!(
            "ws_rooms_active",
            "Number of rooms with at least one local subscriber"
        );
        metrics::describe_counter!(
            "ws_messages_published_total",
            "Total number of messages fanned out to room subscribers"
        );
        metrics::describe_counter!(
            "ws_frames_dropped_total",
            "Total number of outbound frames dropped because a connection's queue was full"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

/// Handler for Prometheus metrics endpoint
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}

/// Middleware to track HTTP request metrics
pub async fn track_request_metrics(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let start = std::time::Instant::now();

    let response = next.run(req).await;

    let duration = start.elapsed();

    // Record basic metrics
    metrics::counter!("http_requests_total", 1);
    metrics::histogram!("http_request_duration_seconds", duration.as_secs_f64());

    response
}

/// Record connection/room/fan-out metrics (spec §10).
pub fn set_active_connections(count: usize) {
    metrics::gauge!("ws_connections_active", count as f64);
}

pub fn set_active_rooms(count: usize) {
    metrics::gauge!("ws_rooms_active", count as f64);
}

pub fn record_message_published() {
    metrics::counter!("ws_messages_published_total", 1);
}

pub fn record_frame_dropped() {
    metrics::counter!("ws_frames_dropped_total", 1);
}
