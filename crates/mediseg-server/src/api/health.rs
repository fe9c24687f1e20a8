//! Health and probe endpoints

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::{Value, json};

use super::size_mb;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(basic))
        .route("/detailed", get(detailed))
        .route("/ready", get(ready))
        .route("/live", get(live))
}

/// GET /health - quick liveness summary.
async fn basic(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.uptime_secs(),
        "upload_dir": state.settings.upload_dir,
        "max_file_size_mb": size_mb(state.settings.max_file_size),
    }))
}

/// GET /health/detailed - directories, model and memory.
async fn detailed(State(state): State<AppState>) -> Json<Value> {
    let settings = &state.settings;
    let model = state.coordinator.model();
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.uptime_secs(),
        "directories": {
            "upload": { "path": settings.upload_dir, "exists": settings.upload_dir.is_dir() },
            "results": { "path": settings.results_dir, "exists": settings.results_dir.is_dir() },
            "temp": { "path": settings.temp_dir, "exists": settings.temp_dir.is_dir() },
            "logs": { "path": settings.log_dir, "exists": settings.log_dir.is_dir() },
        },
        "model": {
            "file_available": settings.model_available(),
            "info": model.info(),
            "memory": model.memory_usage(),
        },
        "tasks": state.tasks.list().await.len(),
    }))
}

/// GET /health/ready - readiness probe: a study can be processed.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let model_ok = state.settings.model_available()
        || state.coordinator.model().state() == mediseg_core::ModelState::Ready;
    let dirs_ok = state.settings.upload_dir.is_dir() && state.settings.results_dir.is_dir();

    if model_ok && dirs_ok {
        (StatusCode::OK, Json(json!({ "ready": true })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "ready": false,
                "model_available": model_ok,
                "directories_available": dirs_ok,
            })),
        )
    }
}

/// GET /health/live - pure liveness probe.
async fn live() -> Json<Value> {
    Json(json!({ "alive": true }))
}
