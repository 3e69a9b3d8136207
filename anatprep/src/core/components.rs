//! 6-connected component labelling of binary volumes.

use std::collections::VecDeque;

use ndarray::Array3;

/// Face-adjacent neighbour offsets.
const NEIGHBOURS: [(isize, isize, isize); 6] = [
    (-1, 0, 0),
    (1, 0, 0),
    (0, -1, 0),
    (0, 1, 0),
    (0, 0, -1),
    (0, 0, 1),
];

/// Label the 6-connected components of `mask`.
///
/// Returns the label volume (0 = background, labels start at 1 in scan
/// order) and the voxel count of each component, indexed by `label - 1`.
pub fn label_components(mask: &Array3<bool>) -> (Array3<usize>, Vec<usize>) {
    let (nx, ny, nz) = mask.dim();
    let mut labels = Array3::<usize>::zeros((nx, ny, nz));
    let mut sizes = Vec::new();
    let mut queue = VecDeque::new();

    for i in 0..nx {
        for j in 0..ny {
            for k in 0..nz {
                if !mask[[i, j, k]] || labels[[i, j, k]] != 0 {
                    continue;
                }
                let label = sizes.len() + 1;
                let mut size = 0usize;
                labels[[i, j, k]] = label;
                queue.push_back((i, j, k));
                while let Some((ci, cj, ck)) = queue.pop_front() {
                    size += 1;
                    for (di, dj, dk) in NEIGHBOURS {
                        let Some(ni) = ci.checked_add_signed(di) else {
                            continue;
                        };
                        let Some(nj) = cj.checked_add_signed(dj) else {
                            continue;
                        };
                        let Some(nk) = ck.checked_add_signed(dk) else {
                            continue;
                        };
                        if ni >= nx || nj >= ny || nk >= nz {
                            continue;
                        }
                        if mask[[ni, nj, nk]] && labels[[ni, nj, nk]] == 0 {
                            labels[[ni, nj, nk]] = label;
                            queue.push_back((ni, nj, nk));
                        }
                    }
                }
                sizes.push(size);
            }
        }
    }
    (labels, sizes)
}

/// Keep only the largest component. Ties go to the component found first in
/// scan order. An empty mask is returned unchanged.
pub fn largest_component(mask: &Array3<bool>) -> Array3<bool> {
    let (labels, sizes) = label_components(mask);
    let mut best: Option<(usize, usize)> = None;
    for (idx, &size) in sizes.iter().enumerate() {
        if best.is_none_or(|(_, best_size)| size > best_size) {
            best = Some((idx, size));
        }
    }
    match best {
        Some((idx, _)) => {
            let keep = idx + 1;
            labels.mapv(|label| label == keep)
        }
        None => mask.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagonal_voxels_are_separate_components() {
        let mut mask = Array3::from_elem((3, 3, 3), false);
        mask[[0, 0, 0]] = true;
        mask[[1, 1, 0]] = true;
        mask[[1, 0, 0]] = true;
        mask[[2, 2, 2]] = true;
        let (_, sizes) = label_components(&mask);
        assert_eq!(sizes, vec![3, 1]);
    }

    #[test]
    fn checkerboard_labels_every_voxel_separately() {
        let mask = Array3::from_shape_fn((40, 40, 40), |(i, j, k)| (i + j + k) % 2 == 0);
        let (labels, sizes) = label_components(&mask);
        assert_eq!(sizes.len(), 32_000);
        assert!(sizes.iter().all(|&size| size == 1));
        assert_eq!(labels.iter().copied().max(), Some(32_000));
        assert_eq!(labels[[0, 0, 0]], 1);
        assert_eq!(labels[[0, 0, 1]], 0);
    }

    #[test]
    fn largest_component_keeps_first_on_tie() {
        let mut mask = Array3::from_elem((5, 1, 1), false);
        mask[[0, 0, 0]] = true;
        mask[[1, 0, 0]] = true;
        mask[[3, 0, 0]] = true;
        mask[[4, 0, 0]] = true;
        let kept = largest_component(&mask);
        assert!(kept[[0, 0, 0]] && kept[[1, 0, 0]]);
        assert!(!kept[[3, 0, 0]] && !kept[[4, 0, 0]]);
    }

    #[test]
    fn empty_mask_has_no_components() {
        let mask = Array3::from_elem((2, 2, 2), false);
        let (_, sizes) = label_components(&mask);
        assert!(sizes.is_empty());
        assert_eq!(largest_component(&mask), mask);
    }
}
