//! HTTP API
//!
//! Route tree:
//! - `/files` - upload, listing, download, deletion of studies
//! - `/preprocess` - eligible-study listing and preprocess-only runs
//! - `/inference` - the full pipeline and the result cache
//! - `/ml` - model administration
//! - `/tasks` - background run registry
//! - `/health` - probes

pub mod files;
pub mod health;
pub mod inference;
pub mod ml;
pub mod preprocess;
pub mod tasks;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Extra room for multipart framing on top of the payload limit.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Simultaneous in-flight requests; pipeline back-pressure proper lives
/// in the model queue.
const CONCURRENCY_LIMIT: usize = 100;

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.settings.cors_origins);
    let body_limit =
        DefaultBodyLimit::max((state.settings.max_file_size + MULTIPART_OVERHEAD) as usize);

    Router::new()
        .nest("/files", files::router())
        .nest("/preprocess", preprocess::router())
        .nest("/inference", inference::router())
        .nest("/ml", ml::router())
        .nest("/tasks", tasks::router())
        .nest("/health", health::router())
        .layer(
            ServiceBuilder::new()
                .concurrency_limit(CONCURRENCY_LIMIT)
                .layer(cors)
                .layer(body_limit),
        )
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// Bytes to fractional megabytes, rounded for display.
pub(crate) fn size_mb(bytes: u64) -> f64 {
    (bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0
}
