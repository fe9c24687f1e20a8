//! Overlay rendering
//!
//! Blends a grayscale base modality with the colored segmentation into
//! a 3-D RGB volume for visual review. The base is normalized with
//! robust percentile clipping so a handful of bright voxels cannot wash
//! out the rest of the brain.

use ndarray::{Array3, Array4, ArrayView3};
use serde::{Deserialize, Serialize};

/// RGB triples per class; background stays transparent. The colors are
/// chosen to stay distinguishable on grayscale backgrounds.
pub const CLASS_PALETTE: [[u8; 3]; 5] = [
    [0, 0, 0],       // background
    [102, 178, 255], // class 1, light blue
    [255, 255, 153], // class 2, light yellow
    [255, 102, 102], // class 3, light red
    [204, 153, 255], // class 4, light violet
];

/// Overlay rendering parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayConfig {
    /// Blend weight of the class color over the base image
    pub alpha: f32,
    /// Background darkening applied to the base before blending
    pub background_dim: f32,
    /// Lower/upper percentile for robust base normalization
    pub percentiles: [f32; 2],
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            alpha: 0.4,
            background_dim: 0.35,
            percentiles: [1.0, 99.0],
        }
    }
}

/// Normalize a base volume to `[0, 255]` using percentile clipping over
/// its non-zero voxels. Returns `None` when the volume is entirely zero.
fn normalize_base(base: &ArrayView3<'_, f32>, percentiles: [f32; 2]) -> Option<Array3<u8>> {
    let mut nonzero: Vec<f32> = base.iter().copied().filter(|&v| v != 0.0).collect();
    if nonzero.is_empty() {
        return None;
    }
    nonzero.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let rank = |p: f32| -> f32 {
        let pos = (p / 100.0 * (nonzero.len() - 1) as f32).round() as usize;
        nonzero[pos.min(nonzero.len() - 1)]
    };
    let mut lo = rank(percentiles[0]);
    let mut hi = rank(percentiles[1]);
    if hi - lo < 1e-6 {
        // fall back to the full value range when the percentile window
        // collapses (near-constant tissue intensity)
        lo = nonzero[0];
        hi = nonzero[nonzero.len() - 1];
    }
    if hi - lo < 1e-6 {
        return Some(base.mapv(|v| if v != 0.0 { 255 } else { 0 }));
    }
    let span = hi - lo;

    Some(base.mapv(|v| {
        let clipped = v.clamp(lo, hi);
        ((clipped - lo) / span * 255.0).round() as u8
    }))
}

/// Render the segmentation over the base volume as `(x, y, z, 3)` RGB.
///
/// An all-zero base yields an all-zero overlay rather than an error.
pub fn render(
    base: &ArrayView3<'_, f32>,
    segmentation: &Array3<u8>,
    config: &OverlayConfig,
) -> Array4<u8> {
    let dims = base.dim();
    let mut out = Array4::<u8>::zeros((dims.0, dims.1, dims.2, 3));

    let Some(gray) = normalize_base(base, config.percentiles) else {
        tracing::warn!("overlay base is entirely zero, emitting empty overlay");
        return out;
    };

    let dim = 1.0 - config.background_dim;
    let alpha = config.alpha;

    for ((x, y, z), &g) in gray.indexed_iter() {
        let backdrop = (g as f32 * dim).round().clamp(0.0, 255.0) as u8;
        let class = segmentation[[x, y, z]] as usize;
        if class == 0 || class >= CLASS_PALETTE.len() {
            for c in 0..3 {
                out[[x, y, z, c]] = backdrop;
            }
        } else {
            let color = CLASS_PALETTE[class];
            for c in 0..3 {
                let blended = (1.0 - alpha) * backdrop as f32 + alpha * color[c] as f32;
                out[[x, y, z, c]] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn zero_base_produces_zero_overlay() {
        let base = Array3::<f32>::zeros((4, 4, 4));
        let mut seg = Array3::<u8>::zeros((4, 4, 4));
        seg[[1, 1, 1]] = 2;

        let overlay = render(&base.view(), &seg, &OverlayConfig::default());
        assert!(overlay.iter().all(|&v| v == 0));
    }

    #[test]
    fn background_voxels_are_gray_and_dimmed() {
        let mut base = Array3::<f32>::zeros((4, 4, 4));
        base.fill(1.0);
        let seg = Array3::<u8>::zeros((4, 4, 4));

        let overlay = render(&base.view(), &seg, &OverlayConfig::default());
        // uniform base normalizes to 255, dimmed by 0.35
        let expected = (255.0 * 0.65f32).round() as u8;
        assert_eq!(overlay[[2, 2, 2, 0]], expected);
        assert_eq!(overlay[[2, 2, 2, 1]], expected);
        assert_eq!(overlay[[2, 2, 2, 2]], expected);
    }

    #[test]
    fn segmented_voxels_blend_toward_class_color() {
        let mut base = Array3::<f32>::zeros((4, 4, 4));
        base.fill(1.0);
        let mut seg = Array3::<u8>::zeros((4, 4, 4));
        seg[[1, 1, 1]] = 1;

        let config = OverlayConfig::default();
        let overlay = render(&base.view(), &seg, &config);

        let backdrop = (255.0 * 0.65f32).round();
        let expected_r = (0.6 * backdrop + 0.4 * 102.0).round() as u8;
        let expected_b = (0.6 * backdrop + 0.4 * 255.0).round() as u8;
        assert_eq!(overlay[[1, 1, 1, 0]], expected_r);
        assert_eq!(overlay[[1, 1, 1, 2]], expected_b);
        // blue channel of light blue pulls above the backdrop
        assert!(overlay[[1, 1, 1, 2]] > overlay[[0, 0, 0, 2]]);
    }

    #[test]
    fn percentile_clipping_tames_outliers() {
        // smooth gradient of intensities
        let gradient =
            Array3::<f32>::from_shape_fn((10, 10, 10), |(x, y, z)| 1.0 + (x + y + z) as f32);
        let mut with_outlier = gradient.clone();
        with_outlier[[0, 0, 0]] = 1.0e6; // hot voxel

        let seg = Array3::<u8>::zeros((10, 10, 10));
        let config = OverlayConfig::default();
        let clean = render(&gradient.view(), &seg, &config);
        let spiked = render(&with_outlier.view(), &seg, &config);

        // the outlier is clipped away, mid-range voxels are unaffected
        assert_eq!(clean[[5, 5, 5, 0]], spiked[[5, 5, 5, 0]]);
        assert_eq!(clean[[9, 9, 9, 0]], spiked[[9, 9, 9, 0]]);
    }

    #[test]
    fn palette_classes_are_distinct() {
        let colors: std::collections::HashSet<[u8; 3]> = CLASS_PALETTE.into_iter().collect();
        assert_eq!(colors.len(), CLASS_PALETTE.len());
    }
}
