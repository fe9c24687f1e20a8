//! Preprocessing pipeline
//!
//! Normalizes the four modality volumes of a study into one fixed-shape
//! 4-channel tensor for the segmentation model. The transform order is
//! fixed: load, resample to isotropic spacing, reorient, per-modality
//! intensity rescale, foreground crop (t1n as mask source), pad-or-crop
//! resize, channel stack, f32.

pub mod spatial;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use ndarray::{Array4, s};
use serde::{Deserialize, Serialize};

use crate::modality::Modality;
use crate::volume::{self, Volume, VolumeError, VolumeMeta};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Preprocess error type. Every failure names the study it belongs to.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    /// The modality mapping is incomplete
    #[error("Study {study}: missing modalities for preprocessing")]
    MissingModalities { study: String },
    /// The pipeline produced a tensor of the wrong shape
    #[error("Study {study}: preprocessed tensor has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        study: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    /// A volume could not be read
    #[error("Study {study}: {source}")]
    Volume {
        study: String,
        #[source]
        source: VolumeError,
    },
    /// Blob store failure
    #[error("Study {study}: tensor blob error: {detail}")]
    Blob { study: String, detail: String },
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Preprocess result type
pub type Result<T> = std::result::Result<T, PreprocessError>;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Per-modality intensity window mapped onto `[b_min, b_max]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct IntensityRange {
    pub a_min: f32,
    pub a_max: f32,
    pub b_min: f32,
    pub b_max: f32,
}

/// Preprocessing parameters. The defaults match the training setup of
/// the segmentation model and rarely change at runtime.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Final spatial shape per modality
    pub img_size: [usize; 3],
    /// Target isotropic voxel spacing in millimetres
    pub spacing: [f32; 3],
    /// Canonical axis code
    pub orientation: [char; 3],
    /// Margin in voxels around the foreground bounding box
    pub crop_margin: usize,
    /// Intensity windows per modality
    pub intensity_ranges: BTreeMap<Modality, IntensityRange>,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        let window = |a_max: f32| IntensityRange {
            a_min: 0.0,
            a_max,
            b_min: 0.0,
            b_max: 1.0,
        };
        let mut intensity_ranges = BTreeMap::new();
        intensity_ranges.insert(Modality::T1n, window(3000.0));
        intensity_ranges.insert(Modality::T1c, window(3000.0));
        intensity_ranges.insert(Modality::T2w, window(3500.0));
        intensity_ranges.insert(Modality::T2f, window(3500.0));

        Self {
            img_size: [128, 128, 128],
            spacing: [1.0, 1.0, 1.0],
            orientation: ['R', 'A', 'I'],
            crop_margin: 10,
            intensity_ranges,
        }
    }
}

impl PreprocessConfig {
    /// Serializable record of the parameters a tensor was produced with.
    pub fn snapshot(&self) -> PreprocessSnapshot {
        PreprocessSnapshot {
            img_size: self.img_size,
            spacing: self.spacing,
            orientation: self.orientation.iter().collect(),
            crop_margin: self.crop_margin,
            intensity_ranges: self.intensity_ranges.clone(),
        }
    }

    /// Expected output tensor shape `(channels, x, y, z)`.
    pub fn tensor_shape(&self) -> [usize; 4] {
        [
            Modality::CHANNEL_ORDER.len(),
            self.img_size[0],
            self.img_size[1],
            self.img_size[2],
        ]
    }
}

/// Frozen copy of the configuration, embedded in pipeline results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PreprocessSnapshot {
    pub img_size: [usize; 3],
    pub spacing: [f32; 3],
    pub orientation: String,
    pub crop_margin: usize,
    pub intensity_ranges: BTreeMap<Modality, IntensityRange>,
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Output of a preprocessing run.
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// `(4, x, y, z)` tensor in canonical channel order
    pub tensor: Array4<f32>,
    /// Parameters the tensor was produced with
    pub snapshot: PreprocessSnapshot,
    /// Metadata of the t1n volume, the write reference for results
    pub reference: VolumeMeta,
}

/// Run the full preprocessing pipeline over a modality mapping.
pub fn preprocess(
    study: &str,
    mapping: &BTreeMap<Modality, PathBuf>,
    config: &PreprocessConfig,
) -> Result<Preprocessed> {
    for modality in Modality::CHANNEL_ORDER {
        if !mapping.contains_key(&modality) {
            return Err(PreprocessError::MissingModalities {
                study: study.to_string(),
            });
        }
    }

    // load + resample + reorient + intensity, in canonical channel order
    let mut volumes: Vec<Volume> = Vec::with_capacity(Modality::CHANNEL_ORDER.len());
    for modality in Modality::CHANNEL_ORDER {
        let path = &mapping[&modality];
        let mut vol = volume::read_volume(path).map_err(|source| PreprocessError::Volume {
            study: study.to_string(),
            source,
        })?;
        vol = spatial::resample_trilinear(&vol, config.spacing);
        vol = spatial::reorient(&vol, config.orientation);
        let range = config.intensity_ranges[&modality];
        spatial::scale_intensity_range(
            &mut vol.data,
            range.a_min,
            range.a_max,
            range.b_min,
            range.b_max,
        );
        tracing::debug!(study, %modality, shape = ?vol.data.shape(), "modality normalized");
        volumes.push(vol);
    }

    // crop all modalities with the t1n foreground box so spatial
    // alignment is preserved
    let bbox = spatial::foreground_bbox(&volumes[Modality::T1n.channel()].data, config.crop_margin);
    let reference = volumes[Modality::T1n.channel()].meta.clone();

    let mut tensor = Array4::<f32>::zeros((
        Modality::CHANNEL_ORDER.len(),
        config.img_size[0],
        config.img_size[1],
        config.img_size[2],
    ));
    for (channel, vol) in volumes.into_iter().enumerate() {
        let cropped = spatial::crop(&vol.data, bbox);
        let resized = spatial::resize_with_pad_or_crop(&cropped, config.img_size);
        tensor.slice_mut(s![channel, .., .., ..]).assign(&resized);
    }

    let expected = config.tensor_shape();
    if tensor.shape() != expected {
        return Err(PreprocessError::ShapeMismatch {
            study: study.to_string(),
            got: tensor.shape().to_vec(),
            expected: expected.to_vec(),
        });
    }

    tracing::info!(study, shape = ?tensor.shape(), "preprocessing complete");

    Ok(Preprocessed {
        tensor,
        snapshot: config.snapshot(),
        reference,
    })
}

// ============================================================================
// TENSOR BLOB STORE
// ============================================================================

/// Filename of the saved tensor blob for a study.
pub fn tensor_blob_name(study: &str) -> String {
    format!("{}-tensor.bin", study)
}

/// Study name encoded in a blob filename, if it follows the convention.
pub fn study_from_blob_name(name: &str) -> Option<&str> {
    name.strip_suffix("-tensor.bin").filter(|s| !s.is_empty())
}

/// Persist a preprocessed tensor as raw little-endian f32.
pub fn save_tensor(tensor: &Array4<f32>, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let standard = tensor.as_standard_layout();
    let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
    for &v in standard.iter() {
        file.write_all(&v.to_le_bytes())?;
    }
    file.flush()?;
    Ok(())
}

/// Load a tensor blob, validating that the byte length matches the
/// expected shape exactly.
pub fn load_tensor(study: &str, path: &Path, config: &PreprocessConfig) -> Result<Array4<f32>> {
    let expected = config.tensor_shape();
    let expected_len: usize = expected.iter().product();

    let mut bytes = Vec::new();
    std::fs::File::open(path)
        .map_err(|e| PreprocessError::Blob {
            study: study.to_string(),
            detail: format!("{}: {}", path.display(), e),
        })?
        .read_to_end(&mut bytes)?;

    if bytes.len() != expected_len * 4 {
        return Err(PreprocessError::Blob {
            study: study.to_string(),
            detail: format!(
                "blob holds {} bytes, expected {} for shape {:?}",
                bytes.len(),
                expected_len * 4,
                expected
            ),
        });
    }

    let values: Vec<f32> = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Array4::from_shape_vec((expected[0], expected[1], expected[2], expected[3]), values).map_err(
        |e| PreprocessError::Blob {
            study: study.to_string(),
            detail: e.to_string(),
        },
    )
}

// ============================================================================
// TESTS
// ============================================================================
