//! # MediSeg Core
//!
//! Inference orchestration engine for multi-modal brain MRI
//! segmentation. A study (four volumetric scans per patient: T1-native,
//! T1-contrast, T2-weighted, T2-FLAIR) flows through:
//!
//! - **Archive Ingest**: uploads are validated, archives expanded into
//!   per-study working directories
//! - **Modality Resolver**: filename patterns classify each volume into
//!   one of {t1n, t1c, t2w, t2f} and report completeness
//! - **Preprocess Pipeline**: resample, reorient, intensity-normalize,
//!   crop-to-brain, resize and stack into one `(4, 128, 128, 128)` tensor
//! - **Model Manager**: the single heavyweight predictor behind an
//!   exclusive FIFO lock, with preventive reload to reclaim drifting
//!   accelerator memory
//! - **Postprocess Pipeline**: softmax + argmax, per-class morphological
//!   cleanup and minimum-component filtering
//! - **Overlay Renderer**: base modality blended with class colors into
//!   a 3-D RGB review volume
//! - **Result Cache**: per-study result folders with atomic inserts
//! - **Inference Coordinator**: composes the above with timing,
//!   cancellation and idempotence guarantees
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mediseg_core::{
//!     InferenceCoordinator, ModelConfig, ModelManager, OnnxPredictorFactory,
//!     PipelineConfig, ResultCache, RunOptions,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let factory = OnnxPredictorFactory::new("models/segmentation.onnx", "input", 4, 5);
//! let model = Arc::new(ModelManager::new(
//!     ModelConfig::default(),
//!     Default::default(),
//!     Box::new(factory),
//! ));
//! let cache = Arc::new(ResultCache::new("results"));
//! let coordinator = InferenceCoordinator::new(PipelineConfig::default(), model, cache);
//!
//! let result = coordinator
//!     .run("BraTS-001", RunOptions::default(), CancellationToken::new())
//!     .await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `onnx` (default): ONNX Runtime predictor backend with CUDA when
//!   available

#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULES
// ============================================================================

pub mod cache;
pub mod ingest;
pub mod modality;
pub mod model;
pub mod overlay;
pub mod pipeline;
pub mod postprocess;
pub mod preprocess;
pub mod volume;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

// Volume I/O
pub use volume::{Volume, VolumeError, VolumeInfo, VolumeMeta, read_volume, volume_info};

// Ingest
pub use ingest::{DeletedEntry, IngestError, IngestOutcome, Ingestor, UploadEntry};

// Modality resolution
pub use modality::{
    EligibleStudy, Modality, ValidationReport, find_eligible, modality_mapping, resolve,
};

// Preprocessing
pub use preprocess::{
    IntensityRange, PreprocessConfig, PreprocessError, PreprocessSnapshot, Preprocessed,
    preprocess,
};

// Model lifecycle
pub use model::{
    AcceleratorMemory, Device, DevicePreference, MemoryUsage, ModelConfig, ModelError, ModelInfo,
    ModelManager, ModelState, Predictor, PredictorFactory,
};

#[cfg(feature = "onnx")]
pub use model::OnnxPredictorFactory;

// Postprocessing
pub use postprocess::{NUM_CLASSES, SegStats, postprocess};

// Overlay
pub use overlay::{CLASS_PALETTE, OverlayConfig};

// Result cache
pub use cache::{Artifact, CacheError, CacheProbe, CachedResult, EvictReport, ResultCache};

// Coordinator
pub use pipeline::{
    InferenceCoordinator, PipelineConfig, PipelineError, PipelineResult, PreprocessOnlyResult,
    ResultPaths, RunOptions, StageTimings,
};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
