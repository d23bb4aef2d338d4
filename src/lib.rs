//! Sheet music recognition service
//!
//! Accepts a scanned score image, stores it content-addressed by SHA-256, and
//! converts it in the background with an optical music recognition engine
//! into a MusicXML document and a compressed `.mxl` package.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;

use axum::extract::DefaultBodyLimit;
use axum::response::Html;
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use app_state::AppState;

use services::validation::MAX_UPLOAD_BYTES;

/// Room for multipart boundaries and part headers on top of the file itself.
pub const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// All HTTP routes of the service, without the metrics endpoint.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { Html(include_str!("../static/index.html")) }))
        .route("/health", get(routes::health::health_check))
        .route("/upload", post(routes::upload::upload_sheet))
        .route("/sheet/{id}", get(routes::sheet::get_sheet))
        .route("/sheet/{id}/data", get(routes::sheet::get_sheet_data))
        .route("/sheet/{id}/input", get(routes::sheet::get_sheet_input))
        .route("/sheet/{id}/download", get(routes::sheet::download_sheet))
        .route("/sheet/{id}/error", get(routes::sheet::get_sheet_error))
        .with_state(state)
        // Checked while the body streams; oversize uploads still reach the handler.
        .layer(DefaultBodyLimit::max(
            MAX_UPLOAD_BYTES as usize + MULTIPART_OVERHEAD,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
