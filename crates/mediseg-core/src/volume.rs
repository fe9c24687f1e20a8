//! Volumetric image I/O
//!
//! Reads and writes NIfTI-1 volumes while preserving spatial metadata
//! (affine, voxel spacing, orientation). The rest of the engine treats
//! the on-disk format as opaque and only ever sees [`Volume`] and
//! [`VolumeMeta`].

use std::path::Path;

use ndarray::{Array3, Array4, ArrayD, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use serde::Serialize;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Volume I/O error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    /// File does not exist
    #[error("Volume not found: {0}")]
    NotFound(String),
    /// File exists but cannot be parsed as a volume
    #[error("Unreadable volume format: {0}")]
    UnreadableFormat(String),
    /// Fewer than 3 spatial dimensions
    #[error("Volume has {0} spatial dimension(s), expected at least 3")]
    Dimensionality(usize),
    /// Write failed at the filesystem boundary
    #[error("Volume write failed: {0}")]
    WriteFailed(String),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Volume result type
pub type Result<T> = std::result::Result<T, VolumeError>;

// ============================================================================
// METADATA
// ============================================================================

/// Spatial metadata carried alongside voxel data.
///
/// The raw NIfTI header is retained so that writes with a reference
/// round-trip the affine and spacing exactly.
#[derive(Debug, Clone)]
pub struct VolumeMeta {
    /// 4x4 voxel-index -> world-coordinate transform
    pub affine: [[f32; 4]; 4],
    /// Voxel extent in millimetres along each axis
    pub spacing: [f32; 3],
    /// Three-letter anatomical axis code (e.g. "RAI")
    pub orientation: [char; 3],
    /// Header of the source file, used as write reference
    pub header: NiftiHeader,
}

impl VolumeMeta {
    /// Orientation as a display string, e.g. `"RAS"`.
    pub fn orientation_code(&self) -> String {
        self.orientation.iter().collect()
    }
}

/// A 3-D volume with its spatial metadata.
#[derive(Debug, Clone)]
pub struct Volume {
    pub data: Array3<f32>,
    pub meta: VolumeMeta,
}

/// Summary of an on-disk volume, for listing endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeInfo {
    pub shape: Vec<usize>,
    pub spacing: [f32; 3],
    pub orientation: String,
    pub value_range: [f32; 2],
    pub file_size_bytes: u64,
}

// ============================================================================
// AFFINE / ORIENTATION
// ============================================================================

/// Build the voxel->world affine from a NIfTI header.
///
/// Prefers the sform rows when `sform_code > 0`, then the qform
/// quaternion, then a plain pixdim diagonal.
pub fn affine_from_header(header: &NiftiHeader) -> [[f32; 4]; 4] {
    let mut affine = [[0.0f32; 4]; 4];
    affine[3][3] = 1.0;

    if header.sform_code > 0 {
        affine[0] = header.srow_x;
        affine[1] = header.srow_y;
        affine[2] = header.srow_z;
        return affine;
    }

    let sx = header.pixdim[1].abs().max(f32::EPSILON);
    let sy = header.pixdim[2].abs().max(f32::EPSILON);
    let sz = header.pixdim[3].abs().max(f32::EPSILON);

    if header.qform_code > 0 {
        let (b, c, d) = (header.quatern_b, header.quatern_c, header.quatern_d);
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        // qfac lives in pixdim[0]; anything that is not -1 means +1
        let qfac = if header.pixdim[0] == -1.0 { -1.0 } else { 1.0 };

        let r = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        for i in 0..3 {
            affine[i][0] = r[i][0] * sx;
            affine[i][1] = r[i][1] * sy;
            affine[i][2] = r[i][2] * sz * qfac;
        }
        affine[0][3] = header.quatern_x;
        affine[1][3] = header.quatern_y;
        affine[2][3] = header.quatern_z;
        return affine;
    }

    affine[0][0] = sx;
    affine[1][1] = sy;
    affine[2][2] = sz;
    affine
}

/// Derive the three-letter axis code from an affine.
///
/// For each voxel axis, the dominant world axis of its direction column
/// decides the letter: +x/-x -> R/L, +y/-y -> A/P, +z/-z -> S/I.
pub fn orientation_from_affine(affine: &[[f32; 4]; 4]) -> [char; 3] {
    let mut code = ['R', 'A', 'S'];
    for (j, slot) in code.iter_mut().enumerate() {
        let mut best = 0usize;
        let mut best_abs = 0.0f32;
        for i in 0..3 {
            let v = affine[i][j].abs();
            if v > best_abs {
                best_abs = v;
                best = i;
            }
        }
        let positive = affine[best][j] >= 0.0;
        *slot = match (best, positive) {
            (0, true) => 'R',
            (0, false) => 'L',
            (1, true) => 'A',
            (1, false) => 'P',
            (2, true) => 'S',
            _ => 'I',
        };
    }
    code
}

fn spacing_from_header(header: &NiftiHeader) -> [f32; 3] {
    [
        header.pixdim[1].abs(),
        header.pixdim[2].abs(),
        header.pixdim[3].abs(),
    ]
}

// ============================================================================
// READ / WRITE
// ============================================================================

/// Check whether a filename has a supported volume extension.
pub fn is_volume_file(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.ends_with(".nii") || lower.ends_with(".nii.gz")
}

/// Read a volume from disk, squeezing trailing singleton axes down to 3-D.
pub fn read_volume(path: &Path) -> Result<Volume> {
    if !path.exists() {
        return Err(VolumeError::NotFound(path.display().to_string()));
    }

    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| VolumeError::UnreadableFormat(format!("{}: {}", path.display(), e)))?;
    let header = obj.header().clone();
    let data: ArrayD<f32> = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| VolumeError::UnreadableFormat(format!("{}: {}", path.display(), e)))?;

    let data = squeeze_to_3d(data)?;
    let affine = affine_from_header(&header);
    let meta = VolumeMeta {
        affine,
        spacing: spacing_from_header(&header),
        orientation: orientation_from_affine(&affine),
        header,
    };

    tracing::debug!(
        path = %path.display(),
        shape = ?data.shape(),
        orientation = %meta.orientation_code(),
        "volume read"
    );

    Ok(Volume { data, meta })
}

fn squeeze_to_3d(data: ArrayD<f32>) -> Result<Array3<f32>> {
    let mut data = data;
    while data.ndim() > 3 {
        let last = data.ndim() - 1;
        if data.shape()[last] == 1 {
            data = data.remove_axis(ndarray::Axis(last));
        } else {
            return Err(VolumeError::UnreadableFormat(format!(
                "volume has non-singleton extra dimensions: {:?}",
                data.shape()
            )));
        }
    }
    if data.ndim() < 3 {
        return Err(VolumeError::Dimensionality(data.ndim()));
    }
    data.into_dimensionality::<Ix3>()
        .map_err(|e| VolumeError::UnreadableFormat(e.to_string()))
}

/// Write a scalar f32 volume, borrowing affine and spacing from the
/// reference when given.
pub fn write_volume(data: &Array3<f32>, path: &Path, reference: Option<&VolumeMeta>) -> Result<()> {
    prepare_parent(path)?;
    let mut options = WriterOptions::new(path);
    if let Some(meta) = reference {
        options = options.reference_header(&meta.header);
    }
    options
        .write_nifti(data)
        .map_err(|e| VolumeError::WriteFailed(format!("{}: {}", path.display(), e)))
}

/// Write a labeled u8 segmentation volume.
pub fn write_segmentation(
    data: &Array3<u8>,
    path: &Path,
    reference: Option<&VolumeMeta>,
) -> Result<()> {
    prepare_parent(path)?;
    let mut options = WriterOptions::new(path);
    if let Some(meta) = reference {
        options = options.reference_header(&meta.header);
    }
    options
        .write_nifti(data)
        .map_err(|e| VolumeError::WriteFailed(format!("{}: {}", path.display(), e)))
}

/// Write an RGB overlay as a 4-D u8 volume (H, W, D, 3).
///
/// Packing RGB into a scalar container format is a deliberate
/// compromise: the overlay stays next to its segmentation under the
/// same study id and viewers that understand 4-D NIfTI can render it.
pub fn write_overlay(data: &Array4<u8>, path: &Path) -> Result<()> {
    prepare_parent(path)?;
    WriterOptions::new(path)
        .write_nifti(data)
        .map_err(|e| VolumeError::WriteFailed(format!("{}: {}", path.display(), e)))
}

fn prepare_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Read shape, spacing, orientation and value range without keeping the
/// voxel data around.
pub fn volume_info(path: &Path) -> Result<VolumeInfo> {
    let file_size_bytes = std::fs::metadata(path)
        .map_err(|_| VolumeError::NotFound(path.display().to_string()))?
        .len();
    let volume = read_volume(path)?;
    let mut lo = f32::INFINITY;
    let mut hi = f32::NEG_INFINITY;
    for &v in volume.data.iter() {
        lo = lo.min(v);
        hi = hi.max(v);
    }
    if !lo.is_finite() {
        lo = 0.0;
        hi = 0.0;
    }
    Ok(VolumeInfo {
        shape: volume.data.shape().to_vec(),
        spacing: volume.meta.spacing,
        orientation: volume.meta.orientation_code(),
        value_range: [lo, hi],
        file_size_bytes,
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    fn identity_affine(spacing: [f32; 3]) -> [[f32; 4]; 4] {
        let mut a = [[0.0f32; 4]; 4];
        a[0][0] = spacing[0];
        a[1][1] = spacing[1];
        a[2][2] = spacing[2];
        a[3][3] = 1.0;
        a
    }

    #[test]
    fn orientation_of_identity_is_ras() {
        let affine = identity_affine([1.0, 1.0, 1.0]);
        assert_eq!(orientation_from_affine(&affine), ['R', 'A', 'S']);
    }

    #[test]
    fn orientation_detects_flipped_axes() {
        let mut affine = identity_affine([1.0, 1.0, 1.0]);
        affine[0][0] = -1.0;
        affine[2][2] = -1.0;
        assert_eq!(orientation_from_affine(&affine), ['L', 'A', 'I']);
    }

    #[test]
    fn orientation_follows_dominant_axis() {
        // voxel x axis mostly along world -y
        let mut affine = [[0.0f32; 4]; 4];
        affine[1][0] = -2.0;
        affine[0][1] = 1.0;
        affine[2][2] = 1.0;
        affine[3][3] = 1.0;
        assert_eq!(orientation_from_affine(&affine)[0], 'P');
    }

    #[test]
    fn squeeze_keeps_3d_and_drops_singletons() {
        let four = Array::<f32, _>::zeros(ndarray::IxDyn(&[4, 5, 6, 1]));
        let squeezed = squeeze_to_3d(four).unwrap();
        assert_eq!(squeezed.shape(), &[4, 5, 6]);

        let two = Array::<f32, _>::zeros(ndarray::IxDyn(&[4, 5]));
        assert!(matches!(
            squeeze_to_3d(two),
            Err(VolumeError::Dimensionality(2))
        ));
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let err = read_volume(Path::new("/nonexistent/vol.nii.gz")).unwrap_err();
        assert!(matches!(err, VolumeError::NotFound(_)));
    }

    #[test]
    fn write_read_round_trip_preserves_shape_and_spacing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.nii");

        let data = Array3::<f32>::from_shape_fn((6, 5, 4), |(x, y, z)| (x + y + z) as f32);
        write_volume(&data, &path, None).unwrap();

        let back = read_volume(&path).unwrap();
        assert_eq!(back.data.shape(), &[6, 5, 4]);
        assert_eq!(back.meta.spacing, [1.0, 1.0, 1.0]);
        assert!((back.data[[3, 2, 1]] - 6.0).abs() < 1e-5);
    }
}
