//! Task registry endpoints

use axum::Json;
use axum::Router;
use axum::extract::{Path as UrlPath, State};
use axum::routing::{delete, get};
use serde_json::{Value, json};

use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list))
        .route("/{id}", get(status))
        .route("/{id}", delete(remove))
}

/// GET /tasks - all task records, newest first.
async fn list(State(state): State<AppState>) -> Json<Value> {
    let tasks = state.tasks.list().await;
    Json(json!({
        "count": tasks.len(),
        "tasks": tasks,
    }))
}

/// GET /tasks/{id} - one task record.
async fn status(
    State(state): State<AppState>,
    UrlPath(task_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let record = state
        .tasks
        .get(&task_id)
        .await
        .ok_or_else(|| ApiError::not_found(format!("no such task: {}", task_id)))?;
    Ok(Json(json!({ "task": record })))
}

/// DELETE /tasks/{id} - drop a task record.
async fn remove(
    State(state): State<AppState>,
    UrlPath(task_id): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    if state.tasks.delete(&task_id).await {
        Ok(Json(json!({ "deleted": true, "task_id": task_id })))
    } else {
        Err(ApiError::not_found(format!("no such task: {}", task_id)))
    }
}
