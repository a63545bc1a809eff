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

        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!("http_request_duration_seconds", "HTTP request duration in seconds");
        metrics::describe_gauge!("ws_connections_active", "Number of currently open WebSocket connections");
        metrics::describe_counter!("ws_connections_total", "Total number of WebSocket connections accepted");
        metrics::describe_counter!("pubsub_messages_published_total", "Total number of pub/sub messages delivered to subscribers");
        metrics::describe_counter!("pubsub_messages_dropped_total", "Total number of pub/sub messages dropped due to a full subscriber queue");
        metrics::describe_gauge!("presence_records_active", "Number of non-expired presence records");
        metrics::describe_counter!("ops_submitted_total", "Total number of operations accepted by the submit chain");
        metrics::describe_counter!("ops_rejected_total", "Total number of operations rejected by the submit chain");

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}

/// Middleware tracking basic HTTP request metrics for the health/metrics
/// surface (the WebSocket path is instrumented separately in the
/// dispatcher, where request/response framing doesn't apply).
pub async fn track_request_metrics(req: axum::extract::Request, next: axum::middleware::Next) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();

    metrics::counter!("http_requests_total").increment(1);
    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());

    response
}
