//! Router surface tests: status codes and error bodies of the HTTP
//! contract, exercised without a real model file.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::Value;
use tower::ServiceExt;

use mediseg_core::{
    InferenceCoordinator, ModelConfig, ModelManager, OnnxPredictorFactory, PipelineConfig,
    ResultCache,
};
use mediseg_server::api::build_router;
use mediseg_server::{AppState, Settings, TaskRegistry};

fn test_app(root: &std::path::Path, max_file_size: u64) -> Router {
    let settings = Arc::new(Settings {
        upload_dir: root.join("uploads"),
        results_dir: root.join("results"),
        temp_dir: root.join("temp"),
        log_dir: root.join("logs"),
        max_file_size,
        model_path: root.join("missing-model.onnx"),
        ..Settings::default()
    });
    settings.ensure_directories().unwrap();

    let model_config = ModelConfig {
        model_path: settings.model_path.clone(),
        ..ModelConfig::default()
    };
    let factory = OnnxPredictorFactory::new(
        settings.model_path.clone(),
        "input",
        model_config.input_channels,
        model_config.num_classes,
    );
    let model = Arc::new(ModelManager::new(
        model_config,
        mediseg_core::DevicePreference::Cpu,
        Box::new(factory),
    ));
    let cache = Arc::new(ResultCache::new(settings.results_dir.clone()));
    let coordinator = Arc::new(InferenceCoordinator::new(
        PipelineConfig {
            upload_dir: settings.upload_dir.clone(),
            temp_dir: settings.temp_dir.clone(),
            ..PipelineConfig::default()
        },
        model,
        cache,
    ));
    let tasks = Arc::new(TaskRegistry::new(Duration::from_secs(3600)));

    build_router(AppState::new(settings, coordinator, tasks))
}

fn multipart_upload(filename: &str, data: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(b"--BOUNDARY\r\n");
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
            filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n--BOUNDARY--\r\n");

    Request::builder()
        .method("POST")
        .uri("/files/upload")
        .header(
            header::CONTENT_TYPE,
            "multipart/form-data; boundary=BOUNDARY",
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 10 * 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn get(app: &Router, uri: &str) -> axum::response::Response {
    app.clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

#[tokio::test]
async fn health_endpoints_respond() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let response = get(&app, "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "healthy");

    let response = get(&app, "/health/live").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn upload_accepts_volume_and_rejects_bad_extension() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let response = app
        .clone()
        .oneshot(multipart_upload("scan.nii.gz", b"volume-bytes"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["type"], "single_volume");
    assert!(root.path().join("uploads/scan.nii.gz").exists());

    let response = app
        .clone()
        .oneshot(multipart_upload("scan.dcm", b"whatever"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "BadInput");
}

#[tokio::test]
async fn upload_size_boundary_is_exact() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 16);

    // exactly at the limit
    let response = app
        .clone()
        .oneshot(multipart_upload("ok.nii", &[0u8; 16]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // one byte over
    let response = app
        .clone()
        .oneshot(multipart_upload("big.nii", &[0u8; 17]))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "BadInput");
    assert!(!root.path().join("uploads/big.nii").exists());
}

#[tokio::test]
async fn cache_check_reports_absence() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let response = get(&app, "/inference/cache-check/BraTS-001").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["has_cache"], false);
    assert_eq!(body["has_segmentation"], false);
    assert_eq!(body["has_overlay"], false);
}

#[tokio::test]
async fn inference_on_unknown_study_is_404() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/inference/folder/ghost")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["error"], "StudyNotFound");
}

#[tokio::test]
async fn ineligible_study_is_400() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    // a folder with no volumes at all
    std::fs::create_dir_all(root.path().join("uploads/incomplete")).unwrap();
    std::fs::write(root.path().join("uploads/incomplete/notes.txt"), b"x").unwrap();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/inference/folder/incomplete")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["error"], "NotEligible");
}

#[tokio::test]
async fn inference_status_reports_unloaded_model() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let response = get(&app, "/inference/status").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["status"], "model_not_loaded");
    assert_eq!(body["components"]["model"]["state"], "unloaded");
}

#[tokio::test]
async fn missing_model_file_fails_load_with_500() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ml/load-model")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert_eq!(body["error"], "ModelLoadFailed");
}

#[tokio::test]
async fn file_listing_and_deletion_round_trip() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    app.clone()
        .oneshot(multipart_upload("scan.nii.gz", b"data"))
        .await
        .unwrap();

    let body = json_body(get(&app, "/files").await).await;
    assert_eq!(body["files_count"], 1);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/files/scan.nii.gz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/files/scan.nii.gz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn task_registry_surface() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let body = json_body(get(&app, "/tasks").await).await;
    assert_eq!(body["count"], 0);

    let response = get(&app, "/tasks/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn results_listing_starts_empty() {
    let root = tempfile::tempdir().unwrap();
    let app = test_app(root.path(), 1 << 20);

    let body = json_body(get(&app, "/inference/results").await).await;
    assert_eq!(body["count"], 0);
}
