//! MP2RAGE background suppression.
//!
//! UNI images have salt-and-pepper noise outside the head. Scaling by the
//! normalised second inversion damps it without touching brain contrast:
//!
//! ```text
//! inv2n = inv2 / max(inv2)
//! out   = t1w · mask · mean(inv2n[mask]) + t1w · inv2n · (1 − mask)
//! ```

use ndarray::{Array3, Zip};

/// Apply the background-removal formula.
///
/// Errors when shapes differ or the INV2 volume has a non-positive maximum.
/// An empty mask uses a scale of 1.0 inside (nothing is inside).
pub fn remove_background(
    t1w: &Array3<f32>,
    mask: &Array3<bool>,
    inv2: &Array3<f32>,
) -> Result<Array3<f32>, String> {
    if t1w.dim() != mask.dim() || t1w.dim() != inv2.dim() {
        return Err(format!(
            "volume shapes differ: T1w {:?}, mask {:?}, INV2 {:?}",
            t1w.dim(),
            mask.dim(),
            inv2.dim()
        ));
    }
    let inv2_max = inv2.iter().fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    if inv2_max <= 0.0 || !inv2_max.is_finite() {
        return Err("INV2 image has max intensity 0; cannot denoise".to_string());
    }
    let inv2_max = f64::from(inv2_max);

    let (sum, n) = Zip::from(inv2)
        .and(mask)
        .fold((0.0f64, 0usize), |(sum, n), &value, &inside| {
            if inside {
                (sum + f64::from(value) / inv2_max, n + 1)
            } else {
                (sum, n)
            }
        });
    let mean_inside = if n == 0 { 1.0 } else { sum / n as f64 };

    let mut out = Array3::<f32>::zeros(t1w.dim());
    Zip::from(&mut out)
        .and(t1w)
        .and(mask)
        .and(inv2)
        .for_each(|o, &t, &inside, &i2| {
            let t = f64::from(t);
            let value = if inside {
                t * mean_inside
            } else {
                t * f64::from(i2) / inv2_max
            };
            *o = value as f32;
        });
    Ok(out)
}
