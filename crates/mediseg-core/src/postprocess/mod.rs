//! Postprocessing pipeline
//!
//! Converts raw class-probability predictions into a cleaned labeled
//! segmentation volume: softmax + argmax, per-class morphological
//! cleanup, and minimum-component filtering. Deterministic for a given
//! prediction tensor.

pub mod morphology;

use std::collections::BTreeMap;

use ndarray::{Array3, Array4, Zip};
use serde::{Deserialize, Serialize};

// ============================================================================
// CLASS CONSTANTS
// ============================================================================

/// Background plus four tissue classes.
pub const NUM_CLASSES: usize = 5;

/// Foreground class labels.
pub const FOREGROUND_CLASSES: [u8; 4] = [1, 2, 3, 4];

/// Binary-opening iterations per foreground class.
fn opening_iterations(class: u8) -> usize {
    match class {
        2 => 2,
        _ => 1,
    }
}

/// Minimum connected-component size (voxels) per foreground class.
fn min_component_size(class: u8) -> usize {
    match class {
        1 => 50,
        2 => 100,
        3 => 20,
        4 => 30,
        _ => 50,
    }
}

// ============================================================================
// STATS
// ============================================================================

/// Summary statistics of a cleaned segmentation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SegStats {
    /// Labels present in the volume, background included
    pub classes_present: Vec<u8>,
    /// Voxel count per present label
    pub class_counts: BTreeMap<u8, usize>,
    /// Total non-background voxels
    pub total_segmented_voxels: usize,
}

impl SegStats {
    /// Compute stats from a labeled volume.
    pub fn from_segmentation(segmentation: &Array3<u8>) -> Self {
        let mut class_counts = BTreeMap::new();
        for &label in segmentation.iter() {
            *class_counts.entry(label).or_insert(0usize) += 1;
        }
        let classes_present: Vec<u8> = class_counts.keys().copied().collect();
        let total_segmented_voxels = class_counts
            .iter()
            .filter(|&(&label, _)| label > 0)
            .map(|(_, &count)| count)
            .sum();
        Self {
            classes_present,
            class_counts,
            total_segmented_voxels,
        }
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

/// Softmax over the class axis followed by argmax, yielding discrete labels.
pub fn predictions_to_classes(prediction: &Array4<f32>) -> Array3<u8> {
    let (classes, nx, ny, nz) = prediction.dim();
    let mut out = Array3::<u8>::zeros((nx, ny, nz));

    for x in 0..nx {
        for y in 0..ny {
            for z in 0..nz {
                // softmax is monotonic, but mirrors the model's training
                // head and keeps the probabilities available for debugging
                let mut max_logit = f32::NEG_INFINITY;
                for c in 0..classes {
                    max_logit = max_logit.max(prediction[[c, x, y, z]]);
                }
                let mut best = 0usize;
                let mut best_prob = f32::NEG_INFINITY;
                for c in 0..classes {
                    let p = (prediction[[c, x, y, z]] - max_logit).exp();
                    if p > best_prob {
                        best_prob = p;
                        best = c;
                    }
                }
                out[[x, y, z]] = best as u8;
            }
        }
    }
    out
}

/// Full postprocessing: discretize, clean each foreground class with
/// opening + hole filling, drop undersized components, compute stats.
pub fn postprocess(prediction: &Array4<f32>) -> (Array3<u8>, SegStats) {
    let mut segmentation = predictions_to_classes(prediction);

    for class in FOREGROUND_CLASSES {
        let mask = class_mask(&segmentation, class);
        if !mask.iter().any(|&v| v) {
            continue;
        }

        let before = mask.iter().filter(|&&v| v).count();
        let cleaned = morphology::fill_holes(&morphology::binary_opening(
            &mask,
            opening_iterations(class),
        ));

        // clear the old label, then write the cleaned mask back
        Zip::from(&mut segmentation).and(&mask).for_each(|s, &m| {
            if m {
                *s = 0;
            }
        });
        Zip::from(&mut segmentation).and(&cleaned).for_each(|s, &m| {
            if m {
                *s = class;
            }
        });

        let after = cleaned.iter().filter(|&&v| v).count();
        tracing::debug!(class, before, after, "morphological cleanup");
    }

    for class in FOREGROUND_CLASSES {
        let mask = class_mask(&segmentation, class);
        if !mask.iter().any(|&v| v) {
            continue;
        }
        let kept = morphology::remove_small_components(&mask, min_component_size(class));
        Zip::from(&mut segmentation)
            .and(&mask)
            .and(&kept)
            .for_each(|s, &was, &keep| {
                if was && !keep {
                    *s = 0;
                }
            });
    }

    let stats = SegStats::from_segmentation(&segmentation);
    tracing::info!(
        classes = ?stats.classes_present,
        foreground_voxels = stats.total_segmented_voxels,
        "postprocessing complete"
    );
    (segmentation, stats)
}

fn class_mask(segmentation: &Array3<u8>, class: u8) -> Array3<bool> {
    segmentation.mapv(|v| v == class)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    /// Prediction tensor that argmaxes to the given labeled volume.
    fn prediction_for(labels: &Array3<u8>) -> Array4<f32> {
        let (nx, ny, nz) = labels.dim();
        let mut pred = Array4::<f32>::zeros((NUM_CLASSES, nx, ny, nz));
        for ((x, y, z), &label) in labels.indexed_iter() {
            pred[[label as usize, x, y, z]] = 10.0;
        }
        pred
    }

    #[test]
    fn argmax_picks_strongest_class() {
        let mut labels = Array3::<u8>::zeros((4, 4, 4));
        labels[[1, 1, 1]] = 3;
        labels[[2, 2, 2]] = 4;

        let classes = predictions_to_classes(&prediction_for(&labels));
        assert_eq!(classes, labels);
    }

    #[test]
    fn labels_stay_in_range() {
        let mut labels = Array3::<u8>::zeros((6, 6, 6));
        labels[[3, 3, 3]] = 2;
        let (seg, _) = postprocess(&prediction_for(&labels));
        assert!(seg.iter().all(|&v| v <= 4));
    }

    #[test]
    fn small_components_are_dropped() {
        // a single class-1 voxel is far below the 50-voxel minimum
        let mut labels = Array3::<u8>::zeros((8, 8, 8));
        labels[[4, 4, 4]] = 1;

        let (seg, stats) = postprocess(&prediction_for(&labels));
        assert!(seg.iter().all(|&v| v == 0));
        assert_eq!(stats.total_segmented_voxels, 0);
    }

    #[test]
    fn large_component_survives_cleanup() {
        // 10x10x10 block of class 3: opening erodes the shell but the
        // core stays well above the 20-voxel minimum
        let mut labels = Array3::<u8>::zeros((16, 16, 16));
        for x in 3..13 {
            for y in 3..13 {
                for z in 3..13 {
                    labels[[x, y, z]] = 3;
                }
            }
        }

        let (seg, stats) = postprocess(&prediction_for(&labels));
        assert_eq!(seg[[8, 8, 8]], 3);
        assert!(stats.classes_present.contains(&3));
        assert!(stats.total_segmented_voxels >= 8 * 8 * 8);
    }

    #[test]
    fn stats_count_each_class() {
        let mut seg = Array3::<u8>::zeros((4, 4, 4));
        seg[[0, 0, 0]] = 1;
        seg[[0, 0, 1]] = 1;
        seg[[0, 0, 2]] = 2;

        let stats = SegStats::from_segmentation(&seg);
        assert_eq!(stats.class_counts[&1], 2);
        assert_eq!(stats.class_counts[&2], 1);
        assert_eq!(stats.class_counts[&0], 64 - 3);
        assert_eq!(stats.total_segmented_voxels, 3);
        assert_eq!(stats.classes_present, vec![0, 1, 2]);
    }

    #[test]
    fn postprocess_is_deterministic() {
        let mut labels = Array3::<u8>::zeros((12, 12, 12));
        for x in 2..10 {
            for y in 2..10 {
                for z in 2..10 {
                    labels[[x, y, z]] = 2;
                }
            }
        }
        let pred = prediction_for(&labels);
        let (seg_a, stats_a) = postprocess(&pred);
        let (seg_b, stats_b) = postprocess(&pred);
        assert_eq!(seg_a, seg_b);
        assert_eq!(stats_a, stats_b);
    }
}
