//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to retrieve metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record model registration
pub fn record_model_registered(name: &str) {
    metrics::counter!("gateway_models_registered_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Record model removal
pub fn record_model_unregistered(name: &str) {
    metrics::counter!("gateway_models_unregistered_total",
        "model" => name.to_string()
    )
    .increment(1);
}

/// Update registered model gauge
pub fn update_model_count(count: usize) {
    metrics::gauge!("gateway_models_count").set(count as f64);
}

/// Record a worker process spawn
pub fn record_worker_spawned(model: &str) {
    metrics::counter!("gateway_workers_spawned_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a worker declared dead and scheduled for replacement
pub fn record_worker_restart(model: &str) {
    metrics::counter!("gateway_worker_restarts_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record one finished prediction request
pub fn record_request(model: &str, outcome: &'static str, elapsed: Duration) {
    metrics::counter!("gateway_requests_total",
        "model" => model.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds",
        "model" => model.to_string()
    )
    .record(elapsed.as_secs_f64());
}
