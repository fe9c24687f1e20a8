//! Inference endpoints
//!
//! The full pipeline (synchronous and background forms), cache probes,
//! result listing, downloads and eviction.

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{delete, get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use mediseg_core::{Artifact, RunOptions};

use super::size_mb;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/cache-check/{id}", get(cache_check))
        .route("/folder/{id}", post(run_folder))
        .route("/folder/{id}/async", post(run_folder_async))
        .route("/preprocessed/{blob}", post(run_preprocessed))
        .route("/results", get(results))
        .route(
            "/results/{id}/download-segmentation",
            get(download_segmentation),
        )
        .route("/results/{id}/download-overlay", get(download_overlay))
        .route("/results/{id}", delete(evict))
        .route("/cache/clear-all", delete(clear_all))
}

/// GET /inference/status - readiness of every pipeline component.
async fn status(State(state): State<AppState>) -> Json<Value> {
    let model = state.coordinator.model();
    let info = model.info();
    let memory = model.memory_usage();
    let ready = matches!(
        info.state,
        mediseg_core::ModelState::Ready | mediseg_core::ModelState::Running
    );

    Json(json!({
        "status": if ready { "ready" } else { "model_not_loaded" },
        "components": {
            "preprocessor": {
                "initialized": true,
                "config": state.coordinator.config().preprocess.snapshot(),
            },
            "model": info,
            "postprocessor": { "initialized": true },
            "cache": {
                "results_dir": state.coordinator.cache().root(),
                "entries": state.coordinator.cache().list_results().len(),
            },
        },
        "memory_usage": memory,
    }))
}

/// GET /inference/cache-check/{id}
async fn cache_check(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
) -> Json<Value> {
    let probe = state.coordinator.cache_probe(&study_id);
    Json(json!({
        "study_id": study_id,
        "has_cache": probe.has_segmentation,
        "has_segmentation": probe.has_segmentation,
        "has_overlay": probe.has_overlay,
    }))
}

#[derive(Debug, Deserialize)]
struct RunParams {
    #[serde(default = "default_true")]
    save_result: bool,
    #[serde(default = "default_true")]
    create_overlay: bool,
    #[serde(default)]
    force_reprocess: bool,
}

fn default_true() -> bool {
    true
}

impl RunParams {
    fn options(&self) -> RunOptions {
        RunOptions {
            save: self.save_result,
            force_reprocess: self.force_reprocess,
            create_overlay: self.create_overlay,
        }
    }
}

/// POST /inference/folder/{id} - run the full pipeline.
async fn run_folder(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .coordinator
        .run(&study_id, params.options(), CancellationToken::new())
        .await?;
    Ok(Json(serde_json::to_value(result).map_err(|e| {
        ApiError::internal(format!("result serialization: {}", e))
    })?))
}

/// POST /inference/folder/{id}/async - run in the background.
async fn run_folder_async(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    // reject unknown studies up front so the task id is worth polling
    if !state.settings.upload_dir.join(&study_id).is_dir() {
        return Err(ApiError::not_found(format!("study not found: {}", study_id)));
    }

    let task_id = state
        .tasks
        .spawn_run(
            state.coordinator.clone(),
            study_id.clone(),
            params.options(),
        )
        .await;
    Ok(Json(json!({
        "task_id": task_id,
        "study_id": study_id,
        "status": "queued",
    })))
}

/// POST /inference/preprocessed/{blob} - pipeline from a saved tensor.
async fn run_preprocessed(
    State(state): State<AppState>,
    UrlPath(blob): UrlPath<String>,
    Query(params): Query<RunParams>,
) -> Result<Json<Value>, ApiError> {
    let result = state
        .coordinator
        .run_preprocessed(&blob, params.options(), CancellationToken::new())
        .await?;
    Ok(Json(serde_json::to_value(result).map_err(|e| {
        ApiError::internal(format!("result serialization: {}", e))
    })?))
}

/// GET /inference/results - list cached study results.
async fn results(State(state): State<AppState>) -> Json<Value> {
    let items = state.coordinator.cache().list_results();
    Json(json!({
        "count": items.len(),
        "results": items,
        "results_dir": state.coordinator.cache().root(),
    }))
}

async fn stream_artifact(
    state: &AppState,
    study_id: &str,
    artifact: Artifact,
) -> Result<Response, ApiError> {
    let path = state.coordinator.stream_path(study_id, artifact)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{}.nii.gz", study_id));

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("no cached result for {}", study_id)))?;

    Response::builder()
        .header(header::CONTENT_TYPE, "application/gzip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(format!("response build failed: {}", e)))
}

/// GET /inference/results/{id}/download-segmentation
async fn download_segmentation(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
) -> Result<Response, ApiError> {
    stream_artifact(&state, &study_id, Artifact::Segmentation).await
}

/// GET /inference/results/{id}/download-overlay
async fn download_overlay(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
) -> Result<Response, ApiError> {
    stream_artifact(&state, &study_id, Artifact::Overlay).await
}

/// DELETE /inference/results/{id} - evict one study.
async fn evict(
    State(state): State<AppState>,
    UrlPath(study_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let report = state.coordinator.cache().evict(&study_id).await?;
    Ok(Json(json!({
        "study_id": report.study_id,
        "files_deleted": report.files_deleted,
        "freed_mb": size_mb(report.freed_bytes),
    })))
}

/// DELETE /inference/cache/clear-all - evict everything.
async fn clear_all(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let (folders_deleted, freed_bytes) = state.coordinator.cache().clear_all().await?;
    Ok(Json(json!({
        "folders_deleted": folders_deleted,
        "freed_mb": size_mb(freed_bytes),
    })))
}
