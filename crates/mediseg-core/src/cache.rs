//! Result cache
//!
//! Per-study folders under the results directory hold the persisted
//! segmentation and overlay volumes. The cache is presence-based: no
//! age or size eviction, a study either has results or it does not.
//! Inserts write to temporary names and rename into place, and insert /
//! evict of the same study serialize on a per-study lock while
//! different studies proceed in parallel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::{Array3, Array4};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::volume::{self, VolumeMeta};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Cache error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Study id would escape the results directory
    #[error("Invalid study id: {0}")]
    InvalidStudyId(String),
    /// Requested artifact does not exist
    #[error("No cached result for study {0}")]
    NotFound(String),
    /// Write or rename failed
    #[error("Cache write failed for study {study}: {detail}")]
    WriteFailed { study: String, detail: String },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cache result type
pub type Result<T> = std::result::Result<T, CacheError>;

// ============================================================================
// TYPES
// ============================================================================

/// Which persisted artifact of a study is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Artifact {
    Segmentation,
    Overlay,
}

/// What `probe` found for a study, without reading any content.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheProbe {
    pub has_segmentation: bool,
    pub has_overlay: bool,
    pub segmentation: Option<PathBuf>,
    pub overlay: Option<PathBuf>,
}

impl CacheProbe {
    fn empty() -> Self {
        Self {
            has_segmentation: false,
            has_overlay: false,
            segmentation: None,
            overlay: None,
        }
    }
}

/// Report of an eviction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictReport {
    pub study_id: String,
    pub freed_bytes: u64,
    pub files_deleted: usize,
}

/// One cached study, for listing endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResult {
    pub study_id: String,
    pub has_segmentation: bool,
    pub has_overlay: bool,
    pub size_bytes: u64,
    pub modified_secs: Option<u64>,
}

// ============================================================================
// CACHE
// ============================================================================

/// Owns the results directory tree.
pub struct ResultCache {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ResultCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_id(study_id: &str) -> Result<()> {
        if study_id.trim().is_empty()
            || study_id.contains('/')
            || study_id.contains('\\')
            || study_id.contains("..")
        {
            return Err(CacheError::InvalidStudyId(study_id.to_string()));
        }
        Ok(())
    }

    /// Canonical path of an artifact: `results/<id>/<id>-seg.nii.gz`,
    /// `results/<id>/<id>-overlay.nii.gz`.
    pub fn artifact_path(&self, study_id: &str, artifact: Artifact) -> PathBuf {
        let suffix = match artifact {
            Artifact::Segmentation => "seg",
            Artifact::Overlay => "overlay",
        };
        self.root
            .join(study_id)
            .join(format!("{}-{}.nii.gz", study_id, suffix))
    }

    async fn study_lock(&self, study_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(study_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Report which artifacts exist, without reading them.
    pub fn probe(&self, study_id: &str) -> CacheProbe {
        if Self::check_id(study_id).is_err() {
            return CacheProbe::empty();
        }
        let seg = self.artifact_path(study_id, Artifact::Segmentation);
        let overlay = self.artifact_path(study_id, Artifact::Overlay);
        let has_segmentation = seg.is_file();
        let has_overlay = overlay.is_file();
        CacheProbe {
            has_segmentation,
            has_overlay,
            segmentation: has_segmentation.then_some(seg),
            overlay: has_overlay.then_some(overlay),
        }
    }

    /// Persist a study's results. Writes go to temporary names first and
    /// rename into place, so a reader never observes a torn artifact.
    /// Existing artifacts are overwritten.
    pub async fn insert(
        &self,
        study_id: &str,
        segmentation: &Array3<u8>,
        overlay: Option<&Array4<u8>>,
        reference: Option<&VolumeMeta>,
    ) -> Result<CacheProbe> {
        Self::check_id(study_id)?;
        let lock = self.study_lock(study_id).await;
        let _guard = lock.lock().await;

        let study_dir = self.root.join(study_id);
        std::fs::create_dir_all(&study_dir)?;

        let seg_final = self.artifact_path(study_id, Artifact::Segmentation);
        let seg_tmp = temp_name(&seg_final);
        volume::write_segmentation(segmentation, &seg_tmp, reference).map_err(|e| {
            let _ = std::fs::remove_file(&seg_tmp);
            CacheError::WriteFailed {
                study: study_id.to_string(),
                detail: e.to_string(),
            }
        })?;

        let overlay_final = self.artifact_path(study_id, Artifact::Overlay);
        let mut overlay_tmp = None;
        if let Some(rgb) = overlay {
            let tmp = temp_name(&overlay_final);
            volume::write_overlay(rgb, &tmp).map_err(|e| {
                let _ = std::fs::remove_file(&seg_tmp);
                let _ = std::fs::remove_file(&tmp);
                CacheError::WriteFailed {
                    study: study_id.to_string(),
                    detail: e.to_string(),
                }
            })?;
            overlay_tmp = Some(tmp);
        }

        // both artifacts staged, move them into place
        std::fs::rename(&seg_tmp, &seg_final)?;
        if let Some(tmp) = overlay_tmp {
            std::fs::rename(&tmp, &overlay_final)?;
        }

        tracing::info!(
            study = study_id,
            overlay = overlay.is_some(),
            "result cached"
        );
        Ok(self.probe(study_id))
    }

    /// Remove a study's cached results.
    pub async fn evict(&self, study_id: &str) -> Result<EvictReport> {
        Self::check_id(study_id)?;
        let lock = self.study_lock(study_id).await;
        let _guard = lock.lock().await;

        let study_dir = self.root.join(study_id);
        if !study_dir.is_dir() {
            return Err(CacheError::NotFound(study_id.to_string()));
        }

        let mut freed_bytes = 0u64;
        let mut files_deleted = 0usize;
        for entry in std::fs::read_dir(&study_dir)?.filter_map(|e| e.ok()) {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    freed_bytes += meta.len();
                    files_deleted += 1;
                }
            }
        }
        std::fs::remove_dir_all(&study_dir)?;

        self.locks.lock().await.remove(study_id);
        tracing::info!(study = study_id, freed_bytes, "cache entry evicted");
        Ok(EvictReport {
            study_id: study_id.to_string(),
            freed_bytes,
            files_deleted,
        })
    }

    /// Remove every study directory.
    pub async fn clear_all(&self) -> Result<(usize, u64)> {
        let mut folders_deleted = 0usize;
        let mut freed_bytes = 0u64;

        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Ok((0, 0));
        };
        let studies: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();

        for study in studies {
            match self.evict(&study).await {
                Ok(report) => {
                    folders_deleted += 1;
                    freed_bytes += report.freed_bytes;
                }
                Err(e) => tracing::warn!(study = %study, error = %e, "eviction failed during clear"),
            }
        }
        Ok((folders_deleted, freed_bytes))
    }

    /// Path of an artifact for streaming, when it exists.
    pub fn stream_path(&self, study_id: &str, artifact: Artifact) -> Result<PathBuf> {
        Self::check_id(study_id)?;
        let path = self.artifact_path(study_id, artifact);
        if !path.is_file() {
            return Err(CacheError::NotFound(study_id.to_string()));
        }
        Ok(path)
    }

    /// List cached studies, newest first.
    pub fn list_results(&self) -> Vec<CachedResult> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };

        let mut results: Vec<CachedResult> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| {
                let study_id = e.file_name().into_string().ok()?;
                let probe = self.probe(&study_id);
                if !probe.has_segmentation && !probe.has_overlay {
                    return None;
                }
                let mut size_bytes = 0u64;
                let mut modified_secs = None;
                if let Ok(children) = std::fs::read_dir(e.path()) {
                    for child in children.filter_map(|c| c.ok()) {
                        if let Ok(meta) = child.metadata() {
                            if meta.is_file() {
                                size_bytes += meta.len();
                                let secs = meta
                                    .modified()
                                    .ok()
                                    .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                                    .map(|d| d.as_secs());
                                if secs > modified_secs {
                                    modified_secs = secs;
                                }
                            }
                        }
                    }
                }
                Some(CachedResult {
                    study_id,
                    has_segmentation: probe.has_segmentation,
                    has_overlay: probe.has_overlay,
                    size_bytes,
                    modified_secs,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.modified_secs
                .cmp(&a.modified_secs)
                .then(a.study_id.cmp(&b.study_id))
        });
        results
    }
}

fn temp_name(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

// ============================================================================
// TESTS
// ============================================================================
