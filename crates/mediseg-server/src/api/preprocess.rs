//! Preprocessing endpoints
//!
//! Eligible-study discovery, preprocess-only runs, and the saved
//! tensor-blob listing.

use axum::Json;
use axum::Router;
use axum::extract::{Path as UrlPath, Query, State};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};

use mediseg_core::{modality, preprocess};

use super::size_mb;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/folders", get(folders))
        .route("/folder/{id}", post(run_preprocess))
        .route("/saved", get(saved))
}

/// GET /preprocess/status - active preprocessing parameters.
async fn status(State(state): State<AppState>) -> Json<Value> {
    let config = &state.coordinator.config().preprocess;
    Json(json!({
        "initialized": true,
        "config": config.snapshot(),
        "temp_dir": state.settings.temp_dir,
    }))
}

/// GET /preprocess/folders - studies that validate for inference.
async fn folders(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let upload_dir = state.settings.upload_dir.clone();
    let items = tokio::task::spawn_blocking(move || modality::find_eligible(&upload_dir))
        .await
        .map_err(|e| ApiError::internal(format!("scan task: {}", e)))?;
    Ok(Json(json!({
        "count": items.len(),
        "items": items,
    })))
}

#[derive(Debug, Deserialize)]
struct PreprocessParams {
    #[serde(default = "default_save_data")]
    save_data: bool,
}

fn default_save_data() -> bool {
    true
}

/// POST /preprocess/folder/{id} - run preprocessing only.
async fn run_preprocess(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
    Query(params): Query<PreprocessParams>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .coordinator
        .preprocess_only(&study_id, params.save_data)
        .await?;
    Ok(Json(json!({
        "study_id": result.study_id,
        "processed_shape": result.processed_shape,
        "saved_path": result.saved_path,
        "elapsed": result.elapsed,
        "config": result.config_snapshot,
    })))
}

/// GET /preprocess/saved - saved tensor blobs.
async fn saved(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let temp_dir = state.settings.temp_dir.clone();
    let blobs = tokio::task::spawn_blocking(move || {
        let mut blobs: Vec<Value> = Vec::new();
        let Ok(entries) = std::fs::read_dir(&temp_dir) else {
            return blobs;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(study) = preprocess::study_from_blob_name(&name) else {
                continue;
            };
            let Ok(meta) = entry.metadata() else { continue };
            blobs.push(json!({
                "filename": name,
                "study_id": study,
                "size": meta.len(),
                "size_mb": size_mb(meta.len()),
            }));
        }
        blobs.sort_by(|a, b| a["filename"].as_str().cmp(&b["filename"].as_str()));
        blobs
    })
    .await
    .map_err(|e| ApiError::internal(format!("blob scan task: {}", e)))?;

    Ok(Json(json!({
        "count": blobs.len(),
        "items": blobs,
    })))
}
