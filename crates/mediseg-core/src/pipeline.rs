//! Inference coordinator
//!
//! Composes ingest, modality resolution, preprocessing, the model
//! manager, postprocessing, overlay rendering and the result cache into
//! the end-to-end pipeline. The coordinator owns tensors only for the
//! duration of a run and releases them on every exit path; cancellation
//! is honored at stage boundaries and an overall timeout bounds the
//! whole run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ndarray::{Array4, Axis};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cache::{Artifact, CacheError, ResultCache};
use crate::modality;
use crate::model::{ModelError, ModelManager};
use crate::overlay::{self, OverlayConfig};
use crate::postprocess::{self, SegStats};
use crate::preprocess::{self, PreprocessConfig, PreprocessError, PreprocessSnapshot};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Pipeline error type: the single failure surface the HTTP layer maps
/// to status codes.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Referenced study id does not exist under the upload directory
    #[error("Study not found: {0}")]
    StudyNotFound(String),
    /// Study folder is missing modalities or has duplicates
    #[error("Study {study} is not inference-eligible: {detail}")]
    NotEligible { study: String, detail: String },
    /// Preprocessing failed
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    /// Model lifecycle or inference failure
    #[error(transparent)]
    Model(#[from] ModelError),
    /// Cache insert failed
    #[error(transparent)]
    Cache(#[from] CacheError),
    /// Run was cancelled between stages
    #[error("Pipeline run cancelled")]
    Cancelled,
    /// Run exceeded the inference timeout
    #[error("Pipeline run timed out after {0:?}")]
    Timeout(Duration),
    /// Last-resort catch-all
    #[error("Internal pipeline error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Short machine-readable kind tag carried in error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::StudyNotFound(_) => "StudyNotFound",
            PipelineError::NotEligible { .. } => "NotEligible",
            PipelineError::Preprocess(PreprocessError::Volume { .. }) => "IOFailure",
            PipelineError::Preprocess(_) => "PreprocessError",
            PipelineError::Model(ModelError::NotLoaded) => "ModelNotLoaded",
            PipelineError::Model(ModelError::NotFound(_))
            | PipelineError::Model(ModelError::LoadFailed(_)) => "ModelLoadFailed",
            PipelineError::Model(ModelError::Overloaded { .. }) => "Overloaded",
            PipelineError::Model(ModelError::ShapeMismatch { .. }) => "BadInput",
            PipelineError::Model(_) => "InferenceFailed",
            PipelineError::Cache(_) => "CacheFailure",
            PipelineError::Cancelled => "Cancelled",
            PipelineError::Timeout(_) => "Timeout",
            PipelineError::Internal(_) => "Internal",
        }
    }
}

/// Pipeline result type
pub type Result<T> = std::result::Result<T, PipelineError>;

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Options of a pipeline run.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Persist the results into the cache
    pub save: bool,
    /// Skip the cache probe and overwrite any existing entry
    pub force_reprocess: bool,
    /// Render the review overlay from channel 0 of the input tensor
    pub create_overlay: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            save: true,
            force_reprocess: false,
            create_overlay: true,
        }
    }
}

/// Wall-clock seconds per stage.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageTimings {
    pub preprocess: f64,
    pub inference: f64,
    pub postprocess: f64,
    pub overlay: f64,
    pub total: f64,
}

/// Paths of the persisted artifacts.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPaths {
    pub segmentation: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
}

/// Outcome of a successful pipeline run (fresh or cached).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub ok: bool,
    pub cached: bool,
    pub study_id: String,
    pub timings: StageTimings,
    pub seg_stats: Option<SegStats>,
    pub paths: ResultPaths,
    pub config_snapshot: Option<PreprocessSnapshot>,
}

/// Outcome of a preprocess-only run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessOnlyResult {
    pub study_id: String,
    pub processed_shape: Vec<usize>,
    pub saved_path: Option<PathBuf>,
    pub elapsed: f64,
    pub config_snapshot: PreprocessSnapshot,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Where ingested studies live
    pub upload_dir: PathBuf,
    /// Where preprocessed tensor blobs live
    pub temp_dir: PathBuf,
    /// Preprocessing parameters
    pub preprocess: PreprocessConfig,
    /// Overlay rendering parameters
    pub overlay: OverlayConfig,
    /// Bound on a whole pipeline run
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from("uploads"),
            temp_dir: PathBuf::from("temp/preprocess"),
            preprocess: PreprocessConfig::default(),
            overlay: OverlayConfig::default(),
            timeout: Duration::from_secs(300),
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// Drives full pipeline runs. Multiple runs may execute concurrently;
/// they serialize only on the model manager and on per-study cache
/// locks.
pub struct InferenceCoordinator {
    config: PipelineConfig,
    model: Arc<ModelManager>,
    cache: Arc<ResultCache>,
}

impl InferenceCoordinator {
    pub fn new(config: PipelineConfig, model: Arc<ModelManager>, cache: Arc<ResultCache>) -> Self {
        Self {
            config,
            model,
            cache,
        }
    }

    pub fn model(&self) -> &Arc<ModelManager> {
        &self.model
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run the full pipeline for a study. Honors the cache unless
    /// `force_reprocess` is set, checks `cancel` at every stage entry,
    /// and gives up after the configured timeout (cleaning the model up
    /// preventively).
    pub async fn run(
        &self,
        study_id: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        match tokio::time::timeout(self.config.timeout, self.run_inner(study_id, options, cancel))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(study = study_id, timeout = ?self.config.timeout, "pipeline timed out");
                self.model.force_cleanup().await;
                Err(PipelineError::Timeout(self.config.timeout))
            }
        }
    }

    async fn run_inner(
        &self,
        study_id: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        let started = Instant::now();
        tracing::info!(
            study = study_id,
            save = options.save,
            force = options.force_reprocess,
            overlay = options.create_overlay,
            "pipeline run starting"
        );

        // 1. cache short-circuit
        if !options.force_reprocess {
            let probe = self.cache.probe(study_id);
            if probe.has_segmentation && (!options.create_overlay || probe.has_overlay) {
                tracing::info!(study = study_id, "serving cached result");
                return Ok(PipelineResult {
                    ok: true,
                    cached: true,
                    study_id: study_id.to_string(),
                    timings: StageTimings {
                        total: started.elapsed().as_secs_f64(),
                        ..StageTimings::default()
                    },
                    seg_stats: None,
                    paths: ResultPaths {
                        segmentation: probe.segmentation,
                        overlay: probe.overlay,
                    },
                    config_snapshot: None,
                });
            }
        }

        // 2. locate the study
        let folder = self.study_folder(study_id)?;

        // 3. resolve modalities
        check_cancel(&cancel)?;
        let report = modality::resolve(&folder);
        if !report.inference_eligible {
            return Err(PipelineError::NotEligible {
                study: study_id.to_string(),
                detail: report.errors.join("; "),
            });
        }
        let mapping = modality::modality_mapping(&folder).ok_or_else(|| {
            PipelineError::Internal("eligible study lost its modality mapping".into())
        })?;

        // 4. preprocess
        check_cancel(&cancel)?;
        let preprocess_started = Instant::now();
        let study_owned = study_id.to_string();
        let preprocess_config = self.config.preprocess.clone();
        let preprocessed = tokio::task::spawn_blocking(move || {
            preprocess::preprocess(&study_owned, &mapping, &preprocess_config)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("preprocess task: {}", e)))??;
        let preprocess_time = preprocess_started.elapsed().as_secs_f64();

        self.finish_from_tensor(
            study_id,
            preprocessed.tensor,
            Some(preprocessed.reference),
            preprocessed.snapshot,
            preprocess_time,
            options,
            cancel,
            started,
        )
        .await
    }

    /// Enter the pipeline at the inference stage from a saved tensor
    /// blob.
    pub async fn run_preprocessed(
        &self,
        blob_name: &str,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Result<PipelineResult> {
        if blob_name.contains('/') || blob_name.contains('\\') || blob_name.contains("..") {
            return Err(PipelineError::StudyNotFound(blob_name.to_string()));
        }
        let study_id = preprocess::study_from_blob_name(blob_name)
            .ok_or_else(|| {
                PipelineError::Preprocess(PreprocessError::Blob {
                    study: blob_name.to_string(),
                    detail: "blob name does not follow <study>-tensor.bin".into(),
                })
            })?
            .to_string();

        let path = self.config.temp_dir.join(blob_name);
        if !path.is_file() {
            return Err(PipelineError::StudyNotFound(blob_name.to_string()));
        }

        let started = Instant::now();
        let config = self.config.preprocess.clone();
        let study_owned = study_id.clone();
        let load_started = Instant::now();
        let tensor = tokio::task::spawn_blocking(move || {
            preprocess::load_tensor(&study_owned, &path, &config)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("blob load task: {}", e)))??;
        let load_time = load_started.elapsed().as_secs_f64();

        let snapshot = self.config.preprocess.snapshot();
        match tokio::time::timeout(
            self.config.timeout,
            self.finish_from_tensor(
                &study_id, tensor, None, snapshot, load_time, options, cancel, started,
            ),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                self.model.force_cleanup().await;
                Err(PipelineError::Timeout(self.config.timeout))
            }
        }
    }

    /// Stages 5-9: predict, postprocess, optional overlay, optional save.
    #[allow(clippy::too_many_arguments)]
    async fn finish_from_tensor(
        &self,
        study_id: &str,
        tensor: Array4<f32>,
        reference: Option<crate::volume::VolumeMeta>,
        snapshot: PreprocessSnapshot,
        preprocess_time: f64,
        options: RunOptions,
        cancel: CancellationToken,
        started: Instant,
    ) -> Result<PipelineResult> {
        // 5. inference
        check_cancel(&cancel)?;
        self.model.ensure_loaded().await?;
        let inference_started = Instant::now();
        let prediction = self.model.predict(&tensor).await?;
        let inference_time = inference_started.elapsed().as_secs_f64();

        // a predict that finished after cancellation is discarded
        if cancel.is_cancelled() {
            drop(prediction);
            return Err(PipelineError::Cancelled);
        }

        // 6. postprocess
        let postprocess_started = Instant::now();
        let (segmentation, stats) =
            tokio::task::spawn_blocking(move || postprocess::postprocess(&prediction))
                .await
                .map_err(|e| PipelineError::Internal(format!("postprocess task: {}", e)))?;
        let postprocess_time = postprocess_started.elapsed().as_secs_f64();

        // 7. overlay
        check_cancel(&cancel)?;
        let mut overlay_time = 0.0;
        let mut overlay_volume = None;
        if options.create_overlay {
            let overlay_started = Instant::now();
            let base = tensor.index_axis(Axis(0), 0).to_owned();
            let seg = segmentation.clone();
            let overlay_config = self.config.overlay;
            let rendered = tokio::task::spawn_blocking(move || {
                overlay::render(&base.view(), &seg, &overlay_config)
            })
            .await
            .map_err(|e| PipelineError::Internal(format!("overlay task: {}", e)))?;
            overlay_volume = Some(rendered);
            overlay_time = overlay_started.elapsed().as_secs_f64();
        }
        drop(tensor);

        // 8. save
        check_cancel(&cancel)?;
        let mut paths = ResultPaths::default();
        if options.save {
            let probe = self
                .cache
                .insert(
                    study_id,
                    &segmentation,
                    overlay_volume.as_ref(),
                    reference.as_ref(),
                )
                .await?;
            paths.segmentation = probe.segmentation;
            paths.overlay = probe.overlay;
        }

        // 9. report
        let timings = StageTimings {
            preprocess: preprocess_time,
            inference: inference_time,
            postprocess: postprocess_time,
            overlay: overlay_time,
            total: started.elapsed().as_secs_f64(),
        };
        tracing::info!(
            study = study_id,
            total_s = timings.total,
            inference_s = timings.inference,
            foreground = stats.total_segmented_voxels,
            "pipeline run complete"
        );

        Ok(PipelineResult {
            ok: true,
            cached: false,
            study_id: study_id.to_string(),
            timings,
            seg_stats: Some(stats),
            paths,
            config_snapshot: Some(snapshot),
        })
    }

    /// Run preprocessing only, optionally persisting the tensor blob.
    pub async fn preprocess_only(
        &self,
        study_id: &str,
        save_tensor: bool,
    ) -> Result<PreprocessOnlyResult> {
        let started = Instant::now();
        let folder = self.study_folder(study_id)?;
        let report = modality::resolve(&folder);
        if !report.inference_eligible {
            return Err(PipelineError::NotEligible {
                study: study_id.to_string(),
                detail: report.errors.join("; "),
            });
        }
        let mapping = modality::modality_mapping(&folder).ok_or_else(|| {
            PipelineError::Internal("eligible study lost its modality mapping".into())
        })?;

        let study_owned = study_id.to_string();
        let config = self.config.preprocess.clone();
        let preprocessed = tokio::task::spawn_blocking(move || {
            preprocess::preprocess(&study_owned, &mapping, &config)
        })
        .await
        .map_err(|e| PipelineError::Internal(format!("preprocess task: {}", e)))??;

        let mut saved_path = None;
        if save_tensor {
            let path = self
                .config
                .temp_dir
                .join(preprocess::tensor_blob_name(study_id));
            preprocess::save_tensor(&preprocessed.tensor, &path)
                .map_err(PipelineError::Preprocess)?;
            saved_path = Some(path);
        }

        Ok(PreprocessOnlyResult {
            study_id: study_id.to_string(),
            processed_shape: preprocessed.tensor.shape().to_vec(),
            saved_path,
            elapsed: started.elapsed().as_secs_f64(),
            config_snapshot: preprocessed.snapshot,
        })
    }

    /// Resolve a study id to its folder, refusing ids that would
    /// escape the upload directory.
    fn study_folder(&self, study_id: &str) -> Result<std::path::PathBuf> {
        if study_id.trim().is_empty()
            || study_id.contains('/')
            || study_id.contains('\\')
            || study_id.contains("..")
        {
            return Err(PipelineError::StudyNotFound(study_id.to_string()));
        }
        let folder = self.config.upload_dir.join(study_id);
        if !folder.is_dir() {
            return Err(PipelineError::StudyNotFound(study_id.to_string()));
        }
        Ok(folder)
    }

    /// Probe the cache for the status endpoint.
    pub fn cache_probe(&self, study_id: &str) -> crate::cache::CacheProbe {
        self.cache.probe(study_id)
    }

    /// Stream path of a cached artifact.
    pub fn stream_path(&self, study_id: &str, artifact: Artifact) -> Result<PathBuf> {
        Ok(self.cache.stream_path(study_id, artifact)?)
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(PipelineError::Cancelled)
    } else {
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
