//! FFT cross-correlation template matching over a scanned range of radii.
//!
//! Templates (synthetic double-ring annuli or averaged patches) are embedded
//! in the padded frame centered on the origin with wraparound, so each
//! correlation peak lands directly on a candidate hole center.

mod peaks;
mod scan;

pub(crate) use peaks::{find_spaced_peaks, point_in_polygon, Peak};
pub(crate) use scan::scan_radii;
pub use scan::RadiusScanReport;

use ndarray::Array2;
use rustfft::num_complex::Complex;

use crate::buffer::try_array2;
use crate::config::PruneParams;
use crate::error::EngineResult;
use crate::stats::{self, region_stats};
use crate::DetectedPoint;

/// Result of one circle search, in original-image coordinates.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CircleFinding {
    /// Parabolically interpolated best radius.
    pub best_radius: f32,
    /// Accepted candidate centers, strongest first.
    pub points: Vec<DetectedPoint>,
    /// Per-point alternate detection from the runner-up radius, if one lies
    /// close enough to substitute during lattice analysis.
    pub alternates: Vec<Option<DetectedPoint>>,
    /// Radius-walk accounting.
    pub report: RadiusScanReport,
}

/// Gaussian profile sigma of each synthetic ring.
const RING_PROFILE_SIGMA: f32 = 1.0;

/// Synthetic double-ring annulus of `radius` and edge separation `width`,
/// embedded at the origin of the padded frame with wraparound, zero-mean
/// and unit L2 norm.
pub(crate) fn ring_template(
    pad: (usize, usize),
    radius: f32,
    width: f32,
) -> EngineResult<Array2<f32>> {
    let (ny, nx) = pad;
    let mut t = try_array2(ny, nx)?;
    let hw = 0.5 * width.max(0.0);
    let reach = (radius + hw + 3.0 * RING_PROFILE_SIGMA).ceil() as isize;
    let inv_2s2 = 1.0 / (2.0 * RING_PROFILE_SIGMA * RING_PROFILE_SIGMA);
    for dy in -reach..=reach {
        for dx in -reach..=reach {
            let d = ((dx * dx + dy * dy) as f32).sqrt();
            let inner = d - (radius - hw);
            let outer = d - (radius + hw);
            let v = (-inner * inner * inv_2s2).exp() + (-outer * outer * inv_2s2).exp();
            if v > 1e-6 {
                let y = dy.rem_euclid(ny as isize) as usize;
                let x = dx.rem_euclid(nx as isize) as usize;
                t[[y, x]] = v;
            }
        }
    }
    normalize_template(&mut t);
    Ok(t)
}

/// Embed a centered patch at the origin of the padded frame with wraparound.
/// The patch center pixel is `(h/2, w/2)`.
pub(crate) fn embed_centered(patch: &Array2<f32>, pad: (usize, usize)) -> EngineResult<Array2<f32>> {
    let (ny, nx) = pad;
    let (bh, bw) = patch.dim();
    let cy = (bh / 2) as isize;
    let cx = (bw / 2) as isize;
    let mut t = try_array2(ny, nx)?;
    for y in 0..bh {
        for x in 0..bw {
            let py = (y as isize - cy).rem_euclid(ny as isize) as usize;
            let px = (x as isize - cx).rem_euclid(nx as isize) as usize;
            t[[py, px]] = patch[[y, x]];
        }
    }
    normalize_template(&mut t);
    Ok(t)
}

fn normalize_template(t: &mut Array2<f32>) {
    let n = t.len() as f32;
    let mean = t.iter().sum::<f32>() / n;
    t.mapv_inplace(|v| v - mean);
    let norm = t.iter().map(|&v| v * v).sum::<f32>().sqrt();
    if norm > 1e-12 {
        t.mapv_inplace(|v| v / norm);
    }
}

/// Embed the working-size image at the top-left of the padded frame,
/// subtracting `baseline` so the padding carries no step.
pub(crate) fn embed_image(
    data: &Array2<f32>,
    pad: (usize, usize),
    baseline: f32,
) -> EngineResult<Array2<f32>> {
    let (ny, nx) = pad;
    let (h, w) = data.dim();
    let mut out = try_array2(ny, nx)?;
    for y in 0..h {
        for x in 0..w {
            out[[y, x]] = data[[y, x]] - baseline;
        }
    }
    Ok(out)
}

/// One retained ring-template spectrum.
struct RingEntry {
    radius: f32,
    width: f32,
    spectrum: Array2<Complex<f32>>,
}

/// Small cache of ring-template spectra, keyed by (radius, width) within a
/// tolerance. Only searches that ask for retention populate it; the engine
/// evicts everything when the padded image size changes.
pub(crate) struct TemplateCache {
    entries: Vec<RingEntry>,
    capacity: usize,
}

impl TemplateCache {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            capacity: 16,
        }
    }

    pub(crate) fn lookup(&self, radius: f32, width: f32) -> Option<&Array2<Complex<f32>>> {
        self.entries
            .iter()
            .find(|e| {
                (e.radius - radius).abs() <= 0.02 * radius.max(1.0)
                    && (e.width - width).abs() <= 1e-3
            })
            .map(|e| &e.spectrum)
    }

    pub(crate) fn insert(&mut self, radius: f32, width: f32, spectrum: Array2<Complex<f32>>) {
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push(RingEntry {
            radius,
            width,
            spectrum,
        });
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Statistical candidate pruning, run when enough candidates remain.
///
/// Local-region intensity outliers (mean on both sides, SD on the bright
/// side) are removed first. The weak-ring pass then discards candidates
/// whose combined peak/contrast score falls far below the strongest ones,
/// unless that would discard too large a fraction.
pub(crate) fn prune_candidates(
    peaks: &mut Vec<Peak>,
    work: &Array2<f32>,
    radius: f32,
    prune: &PruneParams,
    dark_threshold: f32,
) {
    if peaks.len() < prune.min_candidates {
        return;
    }

    let stats_of = |p: &Peak| region_stats(work, p.x, p.y, radius * 0.8, dark_threshold);

    // Mean outlier pass.
    if prune.mean_neg_criterion > 0.0 || prune.mean_pos_criterion > 0.0 {
        let means: Vec<f32> = peaks.iter().map(|p| stats_of(p).mean).collect();
        let cutoffs =
            stats::compute_cutoffs(&means, prune.mean_neg_criterion, prune.mean_pos_criterion);
        retain_by_value(peaks, &means, |v| {
            !cutoffs.low.is_some_and(|c| v < c) && !cutoffs.high.is_some_and(|c| v > c)
        });
    }

    // SD outlier pass (bright side only: wildly contrasty regions).
    if prune.sd_pos_criterion > 0.0 && peaks.len() >= prune.min_candidates {
        let sds: Vec<f32> = peaks.iter().map(|p| stats_of(p).sd).collect();
        let cutoffs = stats::compute_cutoffs(&sds, 0.0, prune.sd_pos_criterion);
        retain_by_value(peaks, &sds, |v| !cutoffs.high.is_some_and(|c| v > c));
    }

    // Weak-ring pass.
    if peaks.len() >= prune.min_candidates && prune.weak_score_floor_ratio > 0.0 {
        let peak_top = peaks
            .iter()
            .map(|p| p.strength)
            .fold(f32::MIN, f32::max)
            .max(1e-12);
        let sds: Vec<f32> = peaks.iter().map(|p| stats_of(p).sd).collect();
        let sd_top = sds.iter().cloned().fold(f32::MIN, f32::max).max(1e-12);
        let scores: Vec<f32> = peaks
            .iter()
            .zip(sds.iter())
            .map(|(p, &sd)| p.strength / peak_top + sd / sd_top)
            .collect();
        let mut top_scores = scores.clone();
        top_scores.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
        let top_mean =
            top_scores.iter().take(3).sum::<f32>() / top_scores.len().min(3).max(1) as f32;
        let floor = top_mean / prune.weak_score_floor_ratio;
        let n_below = scores.iter().filter(|&&s| s < floor).count();
        if n_below > 0 && (n_below as f32) <= prune.max_weak_discard_frac * peaks.len() as f32 {
            retain_by_value(peaks, &scores, |s| s >= floor);
        }
    }
}

fn retain_by_value(peaks: &mut Vec<Peak>, values: &[f32], keep: impl Fn(f32) -> bool) {
    debug_assert_eq!(peaks.len(), values.len());
    let mut it = values.iter();
    peaks.retain(|_| keep(*it.next().expect("values aligned with peaks")));
}

/// For each best-radius peak, the nearest runner-up-radius peak within
/// `max_dist`, usable as an alternate detection during lattice analysis.
pub(crate) fn match_alternates(
    best: &[Peak],
    runner_up: &[Peak],
    max_dist: f32,
) -> Vec<Option<Peak>> {
    let d2 = max_dist * max_dist;
    best.iter()
        .map(|p| {
            runner_up
                .iter()
                .map(|q| {
                    let dx = q.x - p.x;
                    let dy = q.y - p.y;
                    (dx * dx + dy * dy, q)
                })
                .filter(|(dist, _)| *dist <= d2)
                .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(_, q)| *q)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_template_is_zero_mean_unit_norm() {
        let t = ring_template((48, 60), 8.0, 2.0).unwrap();
        let mean: f32 = t.iter().sum::<f32>() / t.len() as f32;
        let norm: f32 = t.iter().map(|&v| v * v).sum::<f32>().sqrt();
        assert!(mean.abs() < 1e-5, "mean {}", mean);
        assert!((norm - 1.0).abs() < 1e-4, "norm {}", norm);
        // Energy concentrates near the two rings around the origin.
        assert!(t[[0, 9]] > t[[0, 20]]);
    }

    #[test]
    fn template_cache_tolerates_small_radius_drift() {
        let mut cache = TemplateCache::new();
        let spec = Array2::from_elem((4, 4), Complex::new(1.0f32, 0.0));
        cache.insert(10.0, 2.0, spec);
        assert!(cache.lookup(10.1, 2.0).is_some());
        assert!(cache.lookup(11.0, 2.0).is_none());
        assert!(cache.lookup(10.0, 3.0).is_none());
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn weak_ring_pass_respects_the_discard_cap() {
        let work = Array2::<f32>::from_elem((64, 64), 100.0);
        // Ten identical flat-region candidates: SD contributes nothing, and
        // every strength is far below none; nothing may be discarded.
        let mut peaks: Vec<Peak> = (0..10)
            .map(|i| Peak {
                x: 5.0 + 5.0 * i as f32,
                y: 30.0,
                strength: 1.0,
            })
            .collect();
        let prune = PruneParams::default();
        prune_candidates(&mut peaks, &work, 4.0, &prune, 0.0);
        assert_eq!(peaks.len(), 10);
    }

    #[test]
    fn alternates_match_within_distance_only() {
        let best = [
            Peak {
                x: 10.0,
                y: 10.0,
                strength: 1.0,
            },
            Peak {
                x: 50.0,
                y: 50.0,
                strength: 0.9,
            },
        ];
        let runner = [Peak {
            x: 11.0,
            y: 10.5,
            strength: 0.7,
        }];
        let alts = match_alternates(&best, &runner, 3.0);
        assert!(alts[0].is_some());
        assert!(alts[1].is_none());
    }
}
