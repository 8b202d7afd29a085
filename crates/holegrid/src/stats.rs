//! Robust statistics: median/MADN cutoffs and local-region intensity stats.

use ndarray::Array2;

use crate::error::{EngineError, EngineResult};
use crate::DetectedPoint;

/// Median of a sample; averages the two central values for even counts.
pub(crate) fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Median absolute deviation scaled to estimate a normal-distribution SD.
pub(crate) fn madn(values: &[f32], med: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let deviations: Vec<f32> = values.iter().map(|&v| (v - med).abs()).collect();
    1.4826 * median(&deviations)
}

/// Cutoff interval computed from one sample and reusable on another.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CutoffRange {
    /// Values below this are outliers; `None` when the criterion is disabled.
    pub low: Option<f32>,
    /// Values above this are outliers; `None` when the criterion is disabled.
    pub high: Option<f32>,
}

/// Counts of points removed on each side of the cutoff interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct OutlierCounts {
    /// Points removed below the low cutoff.
    pub below: usize,
    /// Points removed above the high cutoff.
    pub above: usize,
}

/// Compute median/MADN cutoffs for a sample. Passing zero for a criterion
/// disables that side.
pub fn compute_cutoffs(values: &[f32], negative_criterion: f32, positive_criterion: f32) -> CutoffRange {
    let med = median(values);
    let spread = madn(values, med);
    let low = (negative_criterion > 0.0).then(|| med - negative_criterion * spread);
    let high = (positive_criterion > 0.0).then(|| med + positive_criterion * spread);
    CutoffRange { low, high }
}

/// Remove points whose paired value falls outside a cutoff interval.
///
/// `points` and `values` must be index-aligned; both are filtered together.
pub fn apply_cutoffs(
    points: &mut Vec<DetectedPoint>,
    values: &mut Vec<f32>,
    cutoffs: &CutoffRange,
) -> OutlierCounts {
    debug_assert_eq!(points.len(), values.len());
    let mut counts = OutlierCounts::default();
    let mut keep = Vec::with_capacity(points.len());
    for &v in values.iter() {
        let below = cutoffs.low.is_some_and(|c| v < c);
        let above = cutoffs.high.is_some_and(|c| v > c);
        if below {
            counts.below += 1;
        } else if above {
            counts.above += 1;
        }
        keep.push(!below && !above);
    }
    let mut it = keep.iter();
    points.retain(|_| *it.next().expect("keep mask aligned"));
    let mut it = keep.iter();
    values.retain(|_| *it.next().expect("keep mask aligned"));
    counts
}

/// Compute cutoffs from the sample itself and remove the outliers.
///
/// Returns the cutoffs so a caller can cache and reapply them to another
/// point set (montage tiles reuse the full-image cutoffs this way).
pub fn remove_outliers(
    points: &mut Vec<DetectedPoint>,
    values: &mut Vec<f32>,
    negative_criterion: f32,
    positive_criterion: f32,
) -> (CutoffRange, OutlierCounts) {
    let cutoffs = compute_cutoffs(values, negative_criterion, positive_criterion);
    let counts = apply_cutoffs(points, values, &cutoffs);
    (cutoffs, counts)
}

/// Reapply previously computed cutoffs, failing when none exist yet.
pub(crate) fn reapply_cutoffs(
    cached: Option<&CutoffRange>,
    points: &mut Vec<DetectedPoint>,
    values: &mut Vec<f32>,
) -> EngineResult<OutlierCounts> {
    let cutoffs = cached.ok_or(EngineError::NoCutoffsAvailable)?;
    Ok(apply_cutoffs(points, values, cutoffs))
}

/// Local-region intensity statistics around one point.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RegionStats {
    /// Mean intensity over the sampled disc.
    pub mean: f32,
    /// Intensity standard deviation over the sampled disc.
    pub sd: f32,
    /// Fraction of disc pixels below the supplied dark threshold.
    pub dark_frac: f32,
}

/// Intensity statistics over a disc of `radius` centered at `(cx, cy)` in
/// working-image coordinates. Pixels outside the image are skipped.
pub(crate) fn region_stats(
    image: &Array2<f32>,
    cx: f32,
    cy: f32,
    radius: f32,
    dark_threshold: f32,
) -> RegionStats {
    let (h, w) = image.dim();
    let r = radius.max(1.0);
    let x0 = (cx - r).floor().max(0.0) as usize;
    let x1 = (cx + r).ceil().min(w as f32 - 1.0) as usize;
    let y0 = (cy - r).floor().max(0.0) as usize;
    let y1 = (cy + r).ceil().min(h as f32 - 1.0) as usize;
    let r2 = r * r;

    let mut n = 0usize;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut dark = 0usize;
    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            if dx * dx + dy * dy > r2 {
                continue;
            }
            let v = image[[y, x]];
            n += 1;
            sum += v as f64;
            sum_sq += (v as f64) * (v as f64);
            if v < dark_threshold {
                dark += 1;
            }
        }
    }
    if n == 0 {
        return RegionStats {
            mean: 0.0,
            sd: 0.0,
            dark_frac: 0.0,
        };
    }
    let mean = sum / n as f64;
    let var = (sum_sq / n as f64 - mean * mean).max(0.0);
    RegionStats {
        mean: mean as f32,
        sd: var.sqrt() as f32,
        dark_frac: dark as f32 / n as f32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice_points(n: usize) -> Vec<DetectedPoint> {
        (0..n)
            .map(|i| DetectedPoint {
                x: (i % 4) as f64 * 30.0,
                y: (i / 4) as f64 * 30.0,
                peak: 1.0,
            })
            .collect()
    }

    #[test]
    fn median_handles_even_and_odd_counts() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), 2.5);
    }

    #[test]
    fn single_extreme_value_is_the_only_removal() {
        // Twelve points with tightly clustered values and one extreme bright
        // region value; criteria 4.5/4.5 must flag exactly that point.
        let mut points = lattice_points(12);
        let mut values: Vec<f32> = (0..12).map(|i| 100.0 + (i % 5) as f32 * 0.8).collect();
        values[7] = 500.0;
        let (_, counts) = remove_outliers(&mut points, &mut values, 4.5, 4.5);
        assert_eq!(counts, OutlierCounts { below: 0, above: 1 });
        assert_eq!(points.len(), 11);
        assert!(values.iter().all(|&v| v < 200.0));
    }

    #[test]
    fn single_dark_value_is_flagged_on_the_negative_side() {
        let mut points = lattice_points(12);
        let mut values: Vec<f32> = (0..12).map(|i| 100.0 + (i % 5) as f32 * 0.8).collect();
        values[3] = 2.0;
        let (_, counts) = remove_outliers(&mut points, &mut values, 4.5, 4.5);
        assert_eq!(counts, OutlierCounts { below: 1, above: 0 });
    }

    #[test]
    fn zero_criterion_disables_that_side() {
        let mut points = lattice_points(12);
        let mut values: Vec<f32> = (0..12).map(|i| 100.0 + (i % 5) as f32 * 0.8).collect();
        values[3] = 2.0;
        let (cutoffs, counts) = remove_outliers(&mut points, &mut values, 0.0, 4.5);
        assert_eq!(cutoffs.low, None);
        assert_eq!(counts, OutlierCounts::default());
        assert_eq!(points.len(), 12);
    }

    #[test]
    fn cached_cutoffs_apply_to_a_second_set() {
        let mut points = lattice_points(12);
        let mut values: Vec<f32> = (0..12).map(|i| 100.0 + (i % 5) as f32 * 0.8).collect();
        let (cutoffs, _) = remove_outliers(&mut points, &mut values, 4.5, 4.5);

        let mut tile_points = lattice_points(3);
        let mut tile_values = vec![101.0f32, 99.5, 700.0];
        let counts = reapply_cutoffs(Some(&cutoffs), &mut tile_points, &mut tile_values).unwrap();
        assert_eq!(counts.above, 1);
        assert_eq!(tile_points.len(), 2);
    }

    #[test]
    fn reuse_without_cutoffs_is_an_error() {
        let mut points = lattice_points(2);
        let mut values = vec![1.0f32, 2.0];
        let err = reapply_cutoffs(None, &mut points, &mut values).unwrap_err();
        assert_eq!(err, EngineError::NoCutoffsAvailable);
    }

    #[test]
    fn region_stats_sees_a_dark_disc() {
        let mut img = Array2::<f32>::from_elem((40, 40), 200.0);
        for y in 0..40 {
            for x in 0..40 {
                let dx = x as f32 - 20.0;
                let dy = y as f32 - 20.0;
                if dx * dx + dy * dy <= 36.0 {
                    img[[y, x]] = 20.0;
                }
            }
        }
        let stats = region_stats(&img, 20.0, 20.0, 5.0, 100.0);
        assert!(stats.mean < 60.0, "mean {} should be dark", stats.mean);
        assert!(stats.dark_frac > 0.8, "dark_frac {}", stats.dark_frac);
    }
}
