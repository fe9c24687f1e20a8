//! Model administration endpoints
//!
//! Thin 1:1 surface over the model manager operations, for operators
//! and for calibrating the preventive-reload threshold.

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::routing::{get, post};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/load-model", post(load_model))
        .route("/unload-model", post(unload_model))
        .route("/memory-usage", get(memory_usage))
        .route("/cleanup", post(cleanup))
}

/// GET /ml/status
async fn status(State(state): State<AppState>) -> Json<Value> {
    let info = state.coordinator.model().info();
    Json(json!({
        "model_available": state.settings.model_available(),
        "model_info": info,
        "status": match info.state {
            mediseg_core::ModelState::Ready | mediseg_core::ModelState::Running => "ready",
            _ => "not_loaded",
        },
    }))
}

/// POST /ml/load-model - bring the model to Ready.
async fn load_model(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.coordinator.model().ensure_loaded().await?;
    Ok(Json(json!({
        "message": "model loaded",
        "model_info": state.coordinator.model().info(),
    })))
}

/// POST /ml/unload-model - drop the model and free its memory.
async fn unload_model(State(state): State<AppState>) -> Json<Value> {
    state.coordinator.model().unload().await;
    Json(json!({
        "message": "model unloaded",
        "model_info": state.coordinator.model().info(),
    }))
}

/// GET /ml/memory-usage
async fn memory_usage(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "memory": state.coordinator.model().memory_usage() }))
}

/// POST /ml/cleanup - idempotent forced teardown.
async fn cleanup(State(state): State<AppState>) -> Json<Value> {
    state.coordinator.model().force_cleanup().await;
    Json(json!({
        "message": "cleanup complete",
        "model_info": state.coordinator.model().info(),
    }))
}
