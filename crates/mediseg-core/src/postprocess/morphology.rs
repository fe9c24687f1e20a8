//! Binary morphology over 3-D masks
//!
//! Erosion, dilation, hole filling and connected-component labeling
//! with 6-connectivity (face neighbors). Out-of-volume neighbors count
//! as background, so erosion shrinks masks touching the border.

use ndarray::Array3;

/// Face-neighbor offsets (6-connectivity).
const NEIGHBORS: [[isize; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

fn neighbor(
    idx: (usize, usize, usize),
    offset: [isize; 3],
    dims: (usize, usize, usize),
) -> Option<(usize, usize, usize)> {
    let x = idx.0 as isize + offset[0];
    let y = idx.1 as isize + offset[1];
    let z = idx.2 as isize + offset[2];
    if x < 0
        || y < 0
        || z < 0
        || x >= dims.0 as isize
        || y >= dims.1 as isize
        || z >= dims.2 as isize
    {
        return None;
    }
    Some((x as usize, y as usize, z as usize))
}

/// One erosion pass: a voxel survives iff it and all face neighbors are set.
fn erode_once(mask: &Array3<bool>) -> Array3<bool> {
    let dims = mask.dim();
    let mut out = Array3::from_elem(dims, false);
    for (idx, &set) in mask.indexed_iter() {
        if !set {
            continue;
        }
        let keep = NEIGHBORS.iter().all(|&offset| {
            neighbor(idx, offset, dims)
                .map(|n| mask[n])
                .unwrap_or(false)
        });
        if keep {
            out[idx] = true;
        }
    }
    out
}

/// One dilation pass: a voxel is set iff it or any face neighbor is set.
fn dilate_once(mask: &Array3<bool>) -> Array3<bool> {
    let dims = mask.dim();
    let mut out = mask.clone();
    for (idx, &set) in mask.indexed_iter() {
        if !set {
            continue;
        }
        for &offset in &NEIGHBORS {
            if let Some(n) = neighbor(idx, offset, dims) {
                out[n] = true;
            }
        }
    }
    out
}

/// Binary opening: erosion then dilation, `iterations` passes each.
/// Removes speckle smaller than the structuring element.
pub fn binary_opening(mask: &Array3<bool>, iterations: usize) -> Array3<bool> {
    let mut current = mask.clone();
    for _ in 0..iterations {
        current = erode_once(&current);
    }
    for _ in 0..iterations {
        current = dilate_once(&current);
    }
    current
}

/// Fill interior holes: background regions with no path to the volume
/// border become foreground.
pub fn fill_holes(mask: &Array3<bool>) -> Array3<bool> {
    let dims = mask.dim();
    let mut reachable = Array3::from_elem(dims, false);
    let mut queue = std::collections::VecDeque::new();

    // seed the flood fill with every background voxel on the border
    for (idx, &set) in mask.indexed_iter() {
        let on_border = idx.0 == 0
            || idx.1 == 0
            || idx.2 == 0
            || idx.0 == dims.0 - 1
            || idx.1 == dims.1 - 1
            || idx.2 == dims.2 - 1;
        if on_border && !set {
            reachable[idx] = true;
            queue.push_back(idx);
        }
    }

    while let Some(idx) = queue.pop_front() {
        for &offset in &NEIGHBORS {
            if let Some(n) = neighbor(idx, offset, dims) {
                if !mask[n] && !reachable[n] {
                    reachable[n] = true;
                    queue.push_back(n);
                }
            }
        }
    }

    let mut out = mask.clone();
    for (idx, r) in reachable.indexed_iter() {
        if !mask[idx] && !r {
            out[idx] = true;
        }
    }
    out
}

/// Label connected components. Returns the label volume (0 = background,
/// components numbered from 1) and the component count.
pub fn label_components(mask: &Array3<bool>) -> (Array3<u32>, u32) {
    let dims = mask.dim();
    let mut labels = Array3::<u32>::zeros(dims);
    let mut next = 0u32;
    let mut queue = std::collections::VecDeque::new();

    for (idx, &set) in mask.indexed_iter() {
        if !set || labels[idx] != 0 {
            continue;
        }
        next += 1;
        labels[idx] = next;
        queue.push_back(idx);
        while let Some(current) = queue.pop_front() {
            for &offset in &NEIGHBORS {
                if let Some(n) = neighbor(current, offset, dims) {
                    if mask[n] && labels[n] == 0 {
                        labels[n] = next;
                        queue.push_back(n);
                    }
                }
            }
        }
    }

    (labels, next)
}

/// Drop components smaller than `min_size` voxels. A component of
/// exactly `min_size` survives.
pub fn remove_small_components(mask: &Array3<bool>, min_size: usize) -> Array3<bool> {
    let (labels, count) = label_components(mask);
    if count == 0 {
        return mask.clone();
    }

    let mut sizes = vec![0usize; count as usize + 1];
    for &label in labels.iter() {
        sizes[label as usize] += 1;
    }

    let mut out = mask.clone();
    for (idx, &label) in labels.indexed_iter() {
        if label != 0 && sizes[label as usize] < min_size {
            out[idx] = false;
        }
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================
