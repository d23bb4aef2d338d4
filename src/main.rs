use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

use sheet_scan::config::AppConfig;
use sheet_scan::services::pipeline::Pipeline;
use sheet_scan::{build_router, AppState};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing sheet-scan server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("sheet_uploads_total", "Total sheet uploads accepted");
    metrics::describe_counter!(
        "sheet_uploads_deduplicated",
        "Uploads that matched an already stored sheet"
    );
    metrics::describe_counter!("sheet_jobs_completed", "Conversions that finished successfully");
    metrics::describe_counter!("sheet_jobs_failed", "Conversions that ended in failure");
    metrics::describe_histogram!(
        "sheet_conversion_seconds",
        "Wall-clock time of a full conversion pipeline run"
    );

    let data_dir = config
        .prepare_data_dir()
        .await
        .expect("Failed to prepare data directory");
    tracing::info!(
        data_dir = %data_dir.display(),
        recognizer = %config.audiveris_bin.display(),
        converter = %config.mscore_bin.display(),
        timeout_secs = config.pipeline_timeout_secs,
        "Storage and engines configured"
    );

    let state = AppState::new(data_dir, Pipeline::from_config(&config));

    let app = build_router(state).route(
        "/metrics",
        get(|State(handle): State<Arc<PrometheusHandle>>| async move { handle.render() })
            .with_state(prometheus_handle),
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
