use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const EVENTS_TOTAL: &str = "bridge_events_total";
pub const RETRIES_TOTAL: &str = "bridge_retries_total";
pub const PROCESSING_DURATION: &str = "bridge_processing_duration_seconds";
pub const SUBMISSION_DURATION: &str = "bridge_submission_duration_seconds";
pub const DLQ_SIZE: &str = "bridge_dlq_size";
pub const DLQ_ROTATIONS_TOTAL: &str = "bridge_dlq_rotations_total";
pub const CIRCUIT_BREAKER_STATE: &str = "bridge_circuit_breaker_state";
pub const SOURCE_FILES_TOTAL: &str = "bridge_source_files_total";
pub const DECODED_EVENTS_TOTAL: &str = "bridge_decoded_events_total";
pub const QUEUE_ACTIVE_TASKS: &str = "bridge_queue_active_tasks";
pub const ALERTS_TOTAL: &str = "bridge_alerts_total";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_router`, potentially with more routes added by the caller.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Build a Router for a metrics endpoint.
pub fn setup_metrics_router() -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(Router::new()
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

/// Install the global Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Submissions are bounded by the request timeout, processing by the retry budget.
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware recording request counts and latencies of the operational endpoints.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();
    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
