//! Spatial transforms for the preprocessing pipeline
//!
//! Resampling, reorientation, foreground cropping and pad-or-crop
//! resizing over `ndarray` volumes. All transforms keep the affine and
//! spacing metadata consistent with the voxel data they produce.

use ndarray::{Array3, Axis, s};

use crate::volume::{Volume, VolumeMeta, orientation_from_affine};

/// Axis family for an orientation letter: x = {R, L}, y = {A, P}, z = {S, I}.
fn letter_family(letter: char) -> usize {
    match letter {
        'R' | 'L' => 0,
        'A' | 'P' => 1,
        _ => 2,
    }
}

fn opposite(letter: char) -> char {
    match letter {
        'R' => 'L',
        'L' => 'R',
        'A' => 'P',
        'P' => 'A',
        'S' => 'I',
        _ => 'S',
    }
}

// ============================================================================
// RESAMPLING
// ============================================================================

/// Resample a volume to the target voxel spacing with trilinear
/// interpolation. A volume already at the target spacing is returned
/// unchanged.
pub fn resample_trilinear(volume: &Volume, target_spacing: [f32; 3]) -> Volume {
    let spacing = volume.meta.spacing;
    if spacing
        .iter()
        .zip(target_spacing.iter())
        .all(|(a, b)| (a - b).abs() < 1e-4)
    {
        return volume.clone();
    }

    let shape = volume.data.dim();
    let old_dims = [shape.0, shape.1, shape.2];
    let mut new_dims = [0usize; 3];
    let mut scale = [1.0f32; 3];
    for axis in 0..3 {
        let extent = old_dims[axis] as f32 * spacing[axis];
        new_dims[axis] = ((extent / target_spacing[axis]).round() as usize).max(1);
        // output index -> input index
        scale[axis] = target_spacing[axis] / spacing[axis];
    }

    let src = &volume.data;
    let mut out = Array3::<f32>::zeros((new_dims[0], new_dims[1], new_dims[2]));
    for x in 0..new_dims[0] {
        let fx = (x as f32 * scale[0]).min(old_dims[0] as f32 - 1.0);
        let x0 = fx.floor() as usize;
        let x1 = (x0 + 1).min(old_dims[0] - 1);
        let dx = fx - x0 as f32;
        for y in 0..new_dims[1] {
            let fy = (y as f32 * scale[1]).min(old_dims[1] as f32 - 1.0);
            let y0 = fy.floor() as usize;
            let y1 = (y0 + 1).min(old_dims[1] - 1);
            let dy = fy - y0 as f32;
            for z in 0..new_dims[2] {
                let fz = (z as f32 * scale[2]).min(old_dims[2] as f32 - 1.0);
                let z0 = fz.floor() as usize;
                let z1 = (z0 + 1).min(old_dims[2] - 1);
                let dz = fz - z0 as f32;

                let c000 = src[[x0, y0, z0]];
                let c100 = src[[x1, y0, z0]];
                let c010 = src[[x0, y1, z0]];
                let c110 = src[[x1, y1, z0]];
                let c001 = src[[x0, y0, z1]];
                let c101 = src[[x1, y0, z1]];
                let c011 = src[[x0, y1, z1]];
                let c111 = src[[x1, y1, z1]];

                let c00 = c000 * (1.0 - dx) + c100 * dx;
                let c10 = c010 * (1.0 - dx) + c110 * dx;
                let c01 = c001 * (1.0 - dx) + c101 * dx;
                let c11 = c011 * (1.0 - dx) + c111 * dx;
                let c0 = c00 * (1.0 - dy) + c10 * dy;
                let c1 = c01 * (1.0 - dy) + c11 * dy;
                out[[x, y, z]] = c0 * (1.0 - dz) + c1 * dz;
            }
        }
    }

    // direction columns keep their orientation, scaled to the new spacing
    let mut affine = volume.meta.affine;
    for j in 0..3 {
        let norm = spacing[j].max(f32::EPSILON);
        for i in 0..3 {
            affine[i][j] = affine[i][j] / norm * target_spacing[j];
        }
    }

    Volume {
        data: out,
        meta: VolumeMeta {
            affine,
            spacing: target_spacing,
            orientation: volume.meta.orientation,
            header: volume.meta.header.clone(),
        },
    }
}

// ============================================================================
// REORIENTATION
// ============================================================================

/// Reorient a volume to the target axis code (e.g. `['R','A','I']`) by
/// permuting and flipping axes.
pub fn reorient(volume: &Volume, target: [char; 3]) -> Volume {
    let current = orientation_from_affine(&volume.meta.affine);

    let mut perm = [0usize; 3];
    let mut flip = [false; 3];
    for j in 0..3 {
        let family = letter_family(target[j]);
        let source = (0..3)
            .find(|&i| letter_family(current[i]) == family)
            .unwrap_or(j);
        perm[j] = source;
        flip[j] = current[source] == opposite(target[j]);
    }

    if perm == [0, 1, 2] && !flip.iter().any(|&f| f) {
        return volume.clone();
    }

    let mut data = volume.data.clone().permuted_axes(perm);
    for (j, &f) in flip.iter().enumerate() {
        if f {
            data.invert_axis(Axis(j));
        }
    }
    let data = data.as_standard_layout().to_owned();

    // permute affine columns, negating flipped ones and shifting the
    // translation to the former last voxel
    let old = &volume.meta.affine;
    let shape = data.dim();
    let dims = [shape.0, shape.1, shape.2];
    let mut affine = [[0.0f32; 4]; 4];
    affine[3][3] = 1.0;
    for i in 0..3 {
        affine[i][3] = old[i][3];
    }
    for j in 0..3 {
        let src = perm[j];
        for i in 0..3 {
            affine[i][j] = if flip[j] { -old[i][src] } else { old[i][src] };
        }
        if flip[j] {
            for i in 0..3 {
                affine[i][3] += old[i][src] * (dims[j] as f32 - 1.0);
            }
        }
    }

    let spacing = [
        volume.meta.spacing[perm[0]],
        volume.meta.spacing[perm[1]],
        volume.meta.spacing[perm[2]],
    ];

    Volume {
        data,
        meta: VolumeMeta {
            affine,
            spacing,
            orientation: orientation_from_affine(&affine),
            header: volume.meta.header.clone(),
        },
    }
}

// ============================================================================
// INTENSITY
// ============================================================================

/// Clip to `[a_min, a_max]` then remap linearly to `[b_min, b_max]`.
pub fn scale_intensity_range(
    data: &mut Array3<f32>,
    a_min: f32,
    a_max: f32,
    b_min: f32,
    b_max: f32,
) {
    let span = (a_max - a_min).max(f32::EPSILON);
    data.mapv_inplace(|v| {
        let clipped = v.clamp(a_min, a_max);
        (clipped - a_min) / span * (b_max - b_min) + b_min
    });
}

// ============================================================================
// CROPPING / RESIZING
// ============================================================================

/// Inclusive-exclusive bounding box of strictly positive voxels with a
/// margin, clamped to the volume. A volume without foreground yields
/// the full extent.
pub fn foreground_bbox(data: &Array3<f32>, margin: usize) -> [(usize, usize); 3] {
    let shape = data.dim();
    let dims = [shape.0, shape.1, shape.2];
    let mut lo = [usize::MAX; 3];
    let mut hi = [0usize; 3];
    let mut any = false;

    for ((x, y, z), &v) in data.indexed_iter() {
        if v > 0.0 {
            any = true;
            let idx = [x, y, z];
            for axis in 0..3 {
                lo[axis] = lo[axis].min(idx[axis]);
                hi[axis] = hi[axis].max(idx[axis]);
            }
        }
    }

    if !any {
        return [(0, dims[0]), (0, dims[1]), (0, dims[2])];
    }

    let mut bbox = [(0usize, 0usize); 3];
    for axis in 0..3 {
        let start = lo[axis].saturating_sub(margin);
        let end = (hi[axis] + 1 + margin).min(dims[axis]);
        bbox[axis] = (start, end);
    }
    bbox
}

/// Extract the bounding box region.
pub fn crop(data: &Array3<f32>, bbox: [(usize, usize); 3]) -> Array3<f32> {
    data.slice(s![
        bbox[0].0..bbox[0].1,
        bbox[1].0..bbox[1].1,
        bbox[2].0..bbox[2].1
    ])
    .to_owned()
}

/// Center-crop or symmetrically zero-pad each axis to the target shape.
pub fn resize_with_pad_or_crop(data: &Array3<f32>, target: [usize; 3]) -> Array3<f32> {
    let shape = data.dim();
    let dims = [shape.0, shape.1, shape.2];

    if dims == target {
        return data.clone();
    }

    let mut src_start = [0usize; 3];
    let mut dst_start = [0usize; 3];
    let mut copy_len = [0usize; 3];
    for axis in 0..3 {
        if dims[axis] >= target[axis] {
            src_start[axis] = (dims[axis] - target[axis]) / 2;
            dst_start[axis] = 0;
            copy_len[axis] = target[axis];
        } else {
            src_start[axis] = 0;
            dst_start[axis] = (target[axis] - dims[axis]) / 2;
            copy_len[axis] = dims[axis];
        }
    }

    let mut out = Array3::<f32>::zeros((target[0], target[1], target[2]));
    let src = data.slice(s![
        src_start[0]..src_start[0] + copy_len[0],
        src_start[1]..src_start[1] + copy_len[1],
        src_start[2]..src_start[2] + copy_len[2]
    ]);
    out.slice_mut(s![
        dst_start[0]..dst_start[0] + copy_len[0],
        dst_start[1]..dst_start[1] + copy_len[1],
        dst_start[2]..dst_start[2] + copy_len[2]
    ])
    .assign(&src);
    out
}

// ============================================================================
// TESTS
// ============================================================================
