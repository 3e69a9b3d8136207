//! Sinus exclusion mask derivation.
//!
//! Produces a first-pass binary segmentation of the superior dural venous
//! sinus from a reference T1-weighted volume, optionally refined by a
//! co-registered secondary contrast (FLAIR) and a brain mask. The result
//! seeds manual correction in the viewer.
//!
//! The pipeline:
//! 1. anatomical ROI = midline band ∩ superior slab
//! 2. statistics region = ROI ∩ brain mask; mean and std of the reference
//! 3. candidates = ROI voxels above `mean + k·std`, relaxed once when sparse
//! 4. drop candidates that are bright on the secondary contrast
//! 5. apply the brain mask
//! 6. keep the largest 6-connected component when the candidate set is large
//!
//! Everything here is pure; reading and writing volumes lives in
//! [`crate::io::nifti_io`].

use ndarray::{Array3, Zip};
use serde::{Deserialize, Serialize};

use crate::core::components::largest_component;
use crate::core::stats::{mean_std, percentile};

/// Tunable constants of the deriver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinusParams {
    /// Half-width in voxels of the midline band.
    pub midline_half_width: usize,
    /// Top fraction of the vertical axis that forms the superior slab.
    pub superior_fraction: f64,
    /// Axis along which the midline band is centred (left-right).
    pub lateral_axis: usize,
    /// Axis whose high indices are superior.
    pub vertical_axis: usize,
    pub threshold_sd: f64,
    /// Multiplier used once when the first pass yields too few candidates.
    pub relaxed_threshold_sd: f64,
    pub min_candidates: usize,
    /// Percentile of the secondary contrast above which candidates are dropped.
    pub secondary_percentile: f64,
    /// Candidate count from which only the largest component is kept.
    pub component_filter_min: usize,
}

impl Default for SinusParams {
    fn default() -> Self {
        Self {
            midline_half_width: 7,
            superior_fraction: 0.4,
            lateral_axis: 0,
            vertical_axis: 2,
            threshold_sd: 1.5,
            relaxed_threshold_sd: 1.0,
            min_candidates: 50,
            secondary_percentile: 90.0,
            component_filter_min: 100,
        }
    }
}

impl SinusParams {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.superior_fraction > 0.0 && self.superior_fraction <= 1.0) {
            return Err(format!(
                "sinus.superior_fraction must be in (0, 1], got {}",
                self.superior_fraction
            ));
        }
        if self.lateral_axis > 2 || self.vertical_axis > 2 {
            return Err("sinus axes must be 0, 1 or 2".to_string());
        }
        if self.lateral_axis == self.vertical_axis {
            return Err("sinus.lateral_axis and sinus.vertical_axis must differ".to_string());
        }
        if !(0.0..=100.0).contains(&self.secondary_percentile) {
            return Err(format!(
                "sinus.secondary_percentile must be in [0, 100], got {}",
                self.secondary_percentile
            ));
        }
        if self.threshold_sd < 0.0 || self.relaxed_threshold_sd < 0.0 {
            return Err("sinus threshold multipliers must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Volumes fed to the deriver. All arrays must share the reference's shape.
#[derive(Debug, Clone, Copy)]
pub struct SinusInputs<'a> {
    pub reference: &'a Array3<f32>,
    /// Secondary contrast already resampled into the reference space.
    pub secondary: Option<&'a Array3<f32>>,
    pub brain_mask: Option<&'a Array3<bool>>,
}

/// Why no mask was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The reference volume is zero everywhere.
    EmptyReference,
    /// ROI ∩ brain mask contains no voxels.
    EmptyStatsRegion,
}

impl AbortReason {
    pub fn describe(self) -> &'static str {
        match self {
            AbortReason::EmptyReference => "reference volume is all zero",
            AbortReason::EmptyStatsRegion => "ROI and brain mask do not overlap",
        }
    }
}

/// Counts and thresholds gathered along the way, for logging.
#[derive(Debug, Clone, PartialEq)]
pub struct SinusReport {
    pub roi_voxels: usize,
    pub stats_voxels: usize,
    pub mean: f64,
    pub std: f64,
    /// Multiplier that produced the candidate set.
    pub threshold_sd: f64,
    pub threshold: f64,
    pub candidates: usize,
    /// Cutoff applied to the secondary contrast, when one was used.
    pub secondary_cutoff: Option<f64>,
    pub after_secondary: usize,
    pub after_brain_mask: usize,
    /// True when only the largest component was kept.
    pub component_filtered: bool,
    pub final_voxels: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinusOutcome {
    /// A mask aligned with the reference. May be empty; check
    /// `report.final_voxels`.
    Mask {
        mask: Array3<bool>,
        report: SinusReport,
    },
    Aborted(AbortReason),
}

/// Run the full derivation.
///
/// Errors only when input shapes disagree. Degenerate but well-formed input
/// yields [`SinusOutcome::Aborted`] or an empty mask instead.
pub fn derive_sinus_mask(
    inputs: SinusInputs<'_>,
    params: &SinusParams,
) -> Result<SinusOutcome, String> {
    let shape = inputs.reference.dim();
    if let Some(secondary) = inputs.secondary {
        if secondary.dim() != shape {
            return Err(format!(
                "secondary contrast shape {:?} does not match reference {:?}",
                secondary.dim(),
                shape
            ));
        }
    }
    if let Some(mask) = inputs.brain_mask {
        if mask.dim() != shape {
            return Err(format!(
                "brain mask shape {:?} does not match reference {:?}",
                mask.dim(),
                shape
            ));
        }
    }

    if inputs.reference.iter().all(|&v| v == 0.0) {
        return Ok(SinusOutcome::Aborted(AbortReason::EmptyReference));
    }

    let roi = anatomical_roi(shape, params);
    let roi_voxels = count(&roi);

    let stats_region = match inputs.brain_mask {
        Some(mask) => and(&roi, mask),
        None => roi.clone(),
    };
    let samples: Vec<f32> = Zip::from(inputs.reference)
        .and(&stats_region)
        .fold(Vec::new(), |mut acc, &value, &inside| {
            if inside {
                acc.push(value);
            }
            acc
        });
    let Some((mean, std)) = mean_std(&samples) else {
        return Ok(SinusOutcome::Aborted(AbortReason::EmptyStatsRegion));
    };

    let (mut candidates, mut threshold_sd) = (
        threshold_candidates(inputs.reference, &roi, mean, std, params.threshold_sd),
        params.threshold_sd,
    );
    if count(&candidates) < params.min_candidates {
        candidates =
            threshold_candidates(inputs.reference, &roi, mean, std, params.relaxed_threshold_sd);
        threshold_sd = params.relaxed_threshold_sd;
    }
    let threshold = mean + threshold_sd * std;
    let candidate_count = count(&candidates);

    let mut secondary_cutoff = None;
    if let Some(secondary) = inputs.secondary {
        if let Some(cutoff) = secondary_cutoff_value(secondary, &roi, params.secondary_percentile)
        {
            Zip::from(&mut candidates)
                .and(secondary)
                .for_each(|keep, &value| {
                    if f64::from(value) > cutoff {
                        *keep = false;
                    }
                });
            secondary_cutoff = Some(cutoff);
        }
    }
    let after_secondary = count(&candidates);

    if let Some(mask) = inputs.brain_mask {
        candidates = and(&candidates, mask);
    }
    let after_brain_mask = count(&candidates);

    let (mask, component_filtered) = filter_components(&candidates, params.component_filter_min);
    let final_voxels = count(&mask);

    Ok(SinusOutcome::Mask {
        mask,
        report: SinusReport {
            roi_voxels,
            stats_voxels: samples.len(),
            mean,
            std,
            threshold_sd,
            threshold,
            candidates: candidate_count,
            secondary_cutoff,
            after_secondary,
            after_brain_mask,
            component_filtered,
            final_voxels,
        },
    })
}

/// Midline band (`|i - n/2| <= half_width` on the lateral axis) intersected
/// with the superior slab (`k >= floor((1 - fraction) * n)` on the vertical
/// axis).
pub fn anatomical_roi(shape: (usize, usize, usize), params: &SinusParams) -> Array3<bool> {
    let dims = [shape.0, shape.1, shape.2];
    let centre = dims[params.lateral_axis] / 2;
    let n_vertical = dims[params.vertical_axis];
    let superior_start = ((1.0 - params.superior_fraction) * n_vertical as f64).floor() as usize;
    Array3::from_shape_fn(shape, |(i, j, k)| {
        let idx = [i, j, k];
        let lateral = idx[params.lateral_axis];
        idx[params.vertical_axis] >= superior_start
            && lateral.abs_diff(centre) <= params.midline_half_width
    })
}

/// ROI voxels whose intensity exceeds `mean + k * std`.
pub fn threshold_candidates(
    reference: &Array3<f32>,
    roi: &Array3<bool>,
    mean: f64,
    std: f64,
    k: f64,
) -> Array3<bool> {
    let threshold = mean + k * std;
    let mut out = Array3::from_elem(reference.dim(), false);
    Zip::from(&mut out)
        .and(reference)
        .and(roi)
        .for_each(|o, &value, &inside| *o = inside && f64::from(value) > threshold);
    out
}

/// Keep only the largest 6-connected component when the candidate count
/// reaches `min_total`; below that the candidates are returned as they are.
///
/// The flag reports whether filtering was applied.
pub fn filter_components(candidates: &Array3<bool>, min_total: usize) -> (Array3<bool>, bool) {
    let total = count(candidates);
    if total == 0 || total < min_total {
        return (candidates.clone(), false);
    }
    (largest_component(candidates), true)
}

fn secondary_cutoff_value(secondary: &Array3<f32>, roi: &Array3<bool>, q: f64) -> Option<f64> {
    let values: Vec<f32> = Zip::from(secondary)
        .and(roi)
        .fold(Vec::new(), |mut acc, &value, &inside| {
            if inside && value != 0.0 {
                acc.push(value);
            }
            acc
        });
    percentile(&values, q)
}

fn and(a: &Array3<bool>, b: &Array3<bool>) -> Array3<bool> {
    let mut out = a.clone();
    Zip::from(&mut out).and(b).for_each(|o, &m| *o = *o && m);
    out
}

fn count(mask: &Array3<bool>) -> usize {
    mask.iter().filter(|&&v| v).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    const N: usize = 32;

    fn params() -> SinusParams {
        SinusParams::default()
    }

    /// Fill a box `[lo, hi)` on every axis.
    fn fill_box(mask: &mut Array3<bool>, lo: [usize; 3], hi: [usize; 3]) {
        for i in lo[0]..hi[0] {
            for j in lo[1]..hi[1] {
                for k in lo[2]..hi[2] {
                    mask[[i, j, k]] = true;
                }
            }
        }
    }

    fn count_true(mask: &Array3<bool>) -> usize {
        mask.iter().filter(|&&v| v).count()
    }

    /// Reference volume with a 150-voxel bright block inside the ROI.
    fn bright_block() -> (Array3<f32>, Array3<bool>) {
        let mut region = Array3::from_elem((N, N, N), false);
        fill_box(&mut region, [14, 10, 24], [19, 16, 29]);
        let reference = region.mapv(|inside| if inside { 100.0 } else { 0.0 });
        (reference, region)
    }

    #[test]
    fn roi_is_midline_band_in_superior_slab() {
        let roi = anatomical_roi((N, N, N), &params());
        // i in 9..=23 (15), all j (32), k >= floor(0.6 * 32) = 19 (13)
        assert_eq!(count_true(&roi), 15 * 32 * 13);
        assert!(roi[[9, 0, 19]]);
        assert!(roi[[23, 31, 31]]);
        assert!(!roi[[8, 0, 31]]);
        assert!(!roi[[24, 0, 31]]);
        assert!(!roi[[16, 0, 18]]);
    }

    #[test]
    fn roi_follows_configured_axes() {
        let custom = SinusParams {
            lateral_axis: 1,
            vertical_axis: 0,
            midline_half_width: 0,
            superior_fraction: 0.5,
            ..SinusParams::default()
        };
        let roi = anatomical_roi((4, 6, 2), &custom);
        assert_eq!(count_true(&roi), 2 * 2);
        assert!(roi[[2, 3, 0]]);
        assert!(!roi[[1, 3, 0]]);
    }

    #[test]
    fn bright_block_inside_roi_is_exactly_the_candidate_set() {
        let (reference, region) = bright_block();
        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: None,
            },
            &params(),
        )
        .expect("derive");
        let SinusOutcome::Mask { mask, report } = outcome else {
            panic!("expected a mask");
        };
        assert_eq!(report.candidates, 150);
        assert!((report.threshold_sd - 1.5).abs() < f64::EPSILON);
        assert!(report.component_filtered);
        assert_eq!(mask, region);
    }

    #[test]
    fn sparse_candidates_relax_threshold_once() {
        // 30 bright voxels at 100 and 60 mid voxels at 9: the 1.5 sd cut (~11.0)
        // keeps only the 30, the relaxed 1.0 sd cut (~7.5) keeps all 90.
        let mut reference = Array3::<f32>::zeros((N, N, N));
        for j in 0..30 {
            reference[[16, j, 30]] = 100.0;
        }
        for j in 0..30 {
            reference[[15, j, 30]] = 9.0;
            reference[[17, j, 30]] = 9.0;
        }
        let roi = anatomical_roi((N, N, N), &params());
        let samples: Vec<f32> = reference
            .iter()
            .zip(roi.iter())
            .filter(|(_, inside)| **inside)
            .map(|(v, _)| *v)
            .collect();
        let (mean, std) = mean_std(&samples).expect("stats");
        assert_eq!(
            count_true(&threshold_candidates(&reference, &roi, mean, std, 1.5)),
            30
        );

        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: None,
            },
            &params(),
        )
        .expect("derive");
        let SinusOutcome::Mask { report, .. } = outcome else {
            panic!("expected a mask");
        };
        assert!((report.threshold_sd - 1.0).abs() < f64::EPSILON);
        assert_eq!(report.candidates, 90);
    }

    #[test]
    fn component_filter_keeps_largest_region() {
        let mut candidates = Array3::from_elem((N, N, N), false);
        let mut small = candidates.clone();
        let mut medium = candidates.clone();
        let mut large = candidates.clone();
        fill_box(&mut small, [0, 0, 0], [2, 4, 5]); // 40
        fill_box(&mut medium, [5, 0, 0], [8, 5, 10]); // 150
        fill_box(&mut large, [12, 0, 0], [16, 5, 10]); // 200
        for part in [&small, &medium, &large] {
            Zip::from(&mut candidates)
                .and(part)
                .for_each(|c, &p| *c = *c || p);
        }
        assert_eq!(count_true(&candidates), 390);

        let (filtered, applied) = filter_components(&candidates, 100);
        assert!(applied);
        assert_eq!(filtered, large);
    }

    #[test]
    fn small_candidate_set_is_preserved() {
        let mut candidates = Array3::from_elem((N, N, N), false);
        fill_box(&mut candidates, [0, 0, 0], [2, 3, 5]);
        candidates[[20, 20, 20]] = true;
        assert_eq!(count_true(&candidates), 31);

        let (filtered, applied) = filter_components(&candidates, 100);
        assert!(!applied);
        assert_eq!(filtered, candidates);
    }

    #[test]
    fn secondary_contrast_removes_bright_voxels() {
        let (reference, region) = bright_block();
        // secondary: whole ROI at 10, one slab of the block at 50 (above p90)
        let roi = anatomical_roi((N, N, N), &params());
        let mut secondary = roi.mapv(|inside| if inside { 10.0f32 } else { 0.0 });
        for i in 14..19 {
            for j in 10..16 {
                secondary[[i, j, 24]] = 50.0;
            }
        }
        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: Some(&secondary),
                brain_mask: None,
            },
            &params(),
        )
        .expect("derive");
        let SinusOutcome::Mask { mask, report } = outcome else {
            panic!("expected a mask");
        };
        assert_eq!(report.secondary_cutoff, Some(10.0));
        assert_eq!(report.after_secondary, 120);
        assert!(!mask[[16, 12, 24]]);
        assert!(mask[[16, 12, 25]]);
        assert_eq!(count_true(&mask), count_true(&region) - 30);
    }

    #[test]
    fn brain_mask_restricts_statistics_and_candidates() {
        let (reference, _) = bright_block();
        let mut brain = Array3::from_elem((N, N, N), false);
        fill_box(&mut brain, [0, 0, 0], [N, N, 27]);
        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: Some(&brain),
            },
            &params(),
        )
        .expect("derive");
        let SinusOutcome::Mask { mask, report } = outcome else {
            panic!("expected a mask");
        };
        assert_eq!(report.stats_voxels, 15 * 32 * 8);
        // block k in 24..27 survives the mask: 5 * 6 * 3
        assert_eq!(report.after_brain_mask, 90);
        assert!(!report.component_filtered);
        assert!(!mask[[16, 12, 27]]);
    }

    #[test]
    fn all_zero_reference_with_disjoint_mask_aborts() {
        let reference = Array3::<f32>::zeros((N, N, N));
        let mut brain = Array3::from_elem((N, N, N), false);
        fill_box(&mut brain, [0, 0, 0], [4, 4, 4]);
        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: Some(&brain),
            },
            &params(),
        )
        .expect("derive");
        assert!(matches!(outcome, SinusOutcome::Aborted(_)));
    }

    #[test]
    fn disjoint_brain_mask_aborts_on_stats_region() {
        let (reference, _) = bright_block();
        let mut brain = Array3::from_elem((N, N, N), false);
        fill_box(&mut brain, [0, 0, 0], [4, 4, 4]);
        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: Some(&brain),
            },
            &params(),
        )
        .expect("derive");
        assert_eq!(outcome, SinusOutcome::Aborted(AbortReason::EmptyStatsRegion));
    }

    #[test]
    fn uniform_roi_yields_empty_mask_without_error() {
        let reference = Array3::<f32>::from_elem((N, N, N), 5.0);
        let outcome = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: None,
            },
            &params(),
        )
        .expect("derive");
        let SinusOutcome::Mask { mask, report } = outcome else {
            panic!("expected a mask");
        };
        assert_eq!(report.final_voxels, 0);
        assert_eq!(count_true(&mask), 0);
    }

    #[test]
    fn shape_mismatch_is_an_error() {
        let reference = Array3::<f32>::zeros((4, 4, 4));
        let brain = Array3::from_elem((4, 4, 5), true);
        let err = derive_sinus_mask(
            SinusInputs {
                reference: &reference,
                secondary: None,
                brain_mask: Some(&brain),
            },
            &params(),
        )
        .unwrap_err();
        assert!(err.contains("brain mask shape"));
    }

    #[test]
    fn params_validation_rejects_bad_values() {
        let bad = SinusParams {
            superior_fraction: 0.0,
            ..SinusParams::default()
        };
        assert!(bad.validate().is_err());
        let bad = SinusParams {
            lateral_axis: 2,
            ..SinusParams::default()
        };
        assert!(bad.validate().is_err());
        assert!(SinusParams::default().validate().is_ok());
    }
}
