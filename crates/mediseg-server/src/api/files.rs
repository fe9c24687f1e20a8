//! File management endpoints
//!
//! Uploads (volumes and study archives), listing, per-item info,
//! downloads (single file or whole study as zip) and deletion.

use std::path::{Path, PathBuf};

use axum::Json;
use axum::body::Body;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::header;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::Router;
use serde_json::{Value, json};
use tokio_util::io::ReaderStream;

use mediseg_core::{IngestOutcome, modality};

use super::size_mb;
use crate::error::ApiError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload))
        .route("/", get(list))
        .route("/{name}", delete(delete_entry))
        .route("/{name}/info", get(info))
        .route("/{name}/download", get(download))
        .route("/{name}/download-zip", get(download_zip))
        .route("/{name}/files", get(folder_files))
        .route("/{name}/{file}", delete(delete_nested))
        .route("/{name}/{file}/info", get(nested_info))
        .route("/{name}/{file}/download", get(nested_download))
}

/// POST /files/upload - accept a volume or archive upload.
async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("malformed multipart body: {}", e)))?
    {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("upload read failed: {}", e)))?;

        // reject before buffering any further work
        state
            .ingestor
            .validate_upload(&filename, bytes.len() as u64)?;

        let ingestor = state.ingestor.clone();
        let outcome = tokio::task::spawn_blocking(move || ingestor.ingest(&filename, &bytes))
            .await
            .map_err(|e| ApiError::internal(format!("ingest task: {}", e)))??;

        return Ok(Json(outcome_response(outcome)));
    }

    Err(ApiError::bad_request("multipart upload has no file field"))
}

fn outcome_response(outcome: IngestOutcome) -> Value {
    match outcome {
        IngestOutcome::SingleVolume { filename, size } => json!({
            "type": "single_volume",
            "filename": filename,
            "size": size,
            "size_mb": size_mb(size),
        }),
        IngestOutcome::Archive {
            filename,
            size,
            folder,
            extracted_files,
            nifti_count,
            validation,
        } => json!({
            "type": "archive",
            "filename": filename,
            "size": size,
            "size_mb": size_mb(size),
            "extraction": {
                "folder": folder,
                "files": extracted_files,
                "nifti_count": nifti_count,
                "validation": validation,
            },
        }),
        IngestOutcome::ArchiveFailed {
            filename,
            size,
            reason,
        } => json!({
            "type": "archive_failed",
            "filename": filename,
            "size": size,
            "size_mb": size_mb(size),
            "error": reason,
        }),
    }
}

/// GET /files/ - list top-level volumes and study folders.
async fn list(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let ingestor = state.ingestor.clone();
    let items = tokio::task::spawn_blocking(move || ingestor.list_entries())
        .await
        .map_err(|e| ApiError::internal(format!("listing task: {}", e)))?;

    let files_count = items
        .iter()
        .filter(|i| i.kind == mediseg_core::ingest::EntryKind::File)
        .count();
    let folders_count = items.len() - files_count;

    Ok(Json(json!({
        "items": items,
        "total_count": items.len(),
        "files_count": files_count,
        "folders_count": folders_count,
    })))
}

/// DELETE /files/{name} - remove a file or study folder.
async fn delete_entry(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.ingestor.delete_entry(&name)?;
    Ok(Json(json!({ "deleted_item": deleted })))
}

/// DELETE /files/{name}/{file} - remove a file inside a study folder.
async fn delete_nested(
    State(state): State<AppState>,
    UrlPath((name, file)): UrlPath<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let deleted = state.ingestor.delete_entry(&format!("{}/{}", name, file))?;
    Ok(Json(json!({ "deleted_item": deleted })))
}

fn item_info(path: &Path, name: &str) -> Result<Value, ApiError> {
    let meta = std::fs::metadata(path)
        .map_err(|_| ApiError::not_found(format!("no such item: {}", name)))?;
    let modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs());
    let extension = if name.to_lowercase().ends_with(".nii.gz") {
        ".nii.gz".to_string()
    } else {
        path.extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default()
    };
    Ok(json!({
        "name": name,
        "size": meta.len(),
        "size_mb": size_mb(meta.len()),
        "modified": modified,
        "is_dir": meta.is_dir(),
        "extension": extension,
    }))
}

/// GET /files/{name}/info
async fn info(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let path = state.ingestor.resolve_path(&name)?;
    Ok(Json(item_info(&path, &name)?))
}

/// GET /files/{name}/{file}/info - file metadata plus, for volumes,
/// shape/spacing/orientation read from the header.
async fn nested_info(
    State(state): State<AppState>,
    UrlPath((name, file)): UrlPath<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let rel = format!("{}/{}", name, file);
    let path = state.ingestor.resolve_path(&rel)?;
    let mut response = item_info(&path, &rel)?;

    if mediseg_core::volume::is_volume_file(&file) {
        let volume_path = path.clone();
        match tokio::task::spawn_blocking(move || mediseg_core::volume_info(&volume_path)).await {
            Ok(Ok(info)) => {
                response["volume"] = serde_json::to_value(info)
                    .map_err(|e| ApiError::internal(format!("info serialization: {}", e)))?;
            }
            Ok(Err(e)) => {
                // a corrupt volume still has file metadata worth returning
                response["volume_error"] = json!(e.to_string());
            }
            Err(e) => return Err(ApiError::internal(format!("info task: {}", e))),
        }
    }

    Ok(Json(response))
}

async fn stream_file(path: PathBuf, download_name: String) -> Result<Response, ApiError> {
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found(format!("no such file: {}", download_name)))?;
    let content_type = if download_name.ends_with(".gz") {
        "application/gzip"
    } else if download_name.ends_with(".zip") {
        "application/zip"
    } else {
        "application/octet-stream"
    };

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", download_name),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| ApiError::internal(format!("response build failed: {}", e)))
}

/// GET /files/{name}/download - stream one file.
async fn download(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Response, ApiError> {
    let path = state.ingestor.resolve_path(&name)?;
    if !path.is_file() {
        return Err(ApiError::not_found(format!("no such file: {}", name)));
    }
    stream_file(path, name).await
}

/// GET /files/{name}/{file}/download - stream a file inside a study.
async fn nested_download(
    State(state): State<AppState>,
    UrlPath((name, file)): UrlPath<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state.ingestor.resolve_path(&format!("{}/{}", name, file))?;
    if !path.is_file() {
        return Err(ApiError::not_found(format!("no such file: {}", file)));
    }
    stream_file(path, file).await
}

/// GET /files/{name}/download-zip - stream a study folder as a zip.
async fn download_zip(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Response, ApiError> {
    let folder = state.ingestor.resolve_path(&name)?;
    if !folder.is_dir() {
        return Err(ApiError::not_found(format!("no such folder: {}", name)));
    }

    let archive = tokio::task::spawn_blocking(move || {
        let mut buf = std::io::Cursor::new(Vec::new());
        mediseg_core::ingest::zip_directory(&folder, &mut buf)?;
        Ok::<Vec<u8>, mediseg_core::IngestError>(buf.into_inner())
    })
    .await
    .map_err(|e| ApiError::internal(format!("zip task: {}", e)))??;

    Response::builder()
        .header(header::CONTENT_TYPE, "application/zip")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}.zip\"", name),
        )
        .body(Body::from(archive))
        .map_err(|e| ApiError::internal(format!("response build failed: {}", e)))
}

/// GET /files/{name}/files - per-study file listing with validation.
async fn folder_files(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Json<Value>, ApiError> {
    let folder = state.ingestor.resolve_path(&name)?;
    if !folder.is_dir() {
        return Err(ApiError::not_found(format!("no such folder: {}", name)));
    }

    let report = tokio::task::spawn_blocking(move || modality::resolve(&folder))
        .await
        .map_err(|e| ApiError::internal(format!("validation task: {}", e)))?;

    Ok(Json(json!({
        "folder": name,
        "validation": report,
    })))
}
