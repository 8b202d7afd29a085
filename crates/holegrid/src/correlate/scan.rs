//! Outward radius walk with monotonic stopping and bisection refinement.
//!
//! The search starts at the middle of the configured radius range and walks
//! one radius at a time in each direction, scoring each radius by the sum of
//! its top peak strengths. A direction stops extending after two consecutive
//! decreasing scores. The best grid radius is then refined by bisection and
//! a final parabolic interpolation.

use crate::error::EngineResult;

use super::peaks::Peak;

/// Accounting for one radius scan, exposed for termination diagnostics.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RadiusScanReport {
    /// Every evaluated radius with its final score, in evaluation order.
    pub evaluated: Vec<(f32, f32)>,
    /// Number of grid radii evaluated during the outward walk.
    pub walk_evaluations: usize,
    /// Number of continuous radii evaluated during bisection refinement.
    pub bisection_evaluations: usize,
}

/// Result of a full radius scan.
#[derive(Debug, Clone)]
pub(crate) struct ScanOutcome {
    /// Parabolically interpolated best radius.
    pub best_radius: f32,
    /// Best evaluated radius (the one whose peaks are returned).
    pub best_evaluated_radius: f32,
    /// Peaks at the best evaluated radius, strongest first.
    pub best_peaks: Vec<Peak>,
    /// Peaks at the second-best evaluated radius, for alternate matching.
    pub runner_up_peaks: Vec<Peak>,
    pub report: RadiusScanReport,
}

/// Number of top peaks summed into a radius score:
/// `min(max_count / 4, min_count / 2)`, never below one.
fn top_count(counts: &[usize]) -> usize {
    let max_count = counts.iter().copied().max().unwrap_or(0);
    let min_count = counts.iter().copied().min().unwrap_or(0);
    (max_count / 4).min(min_count / 2).max(1)
}

/// Sum of the strongest `k` peak strengths (peaks are sorted descending).
fn score_top(peaks: &[Peak], k: usize) -> f32 {
    peaks.iter().take(k).map(|p| p.strength).sum()
}

/// Drive the walk + bisection over `radii`, calling `eval` at most once per
/// grid radius.
pub(crate) fn scan_radii<F>(
    radii: &[f32],
    increment: f32,
    max_bisections: usize,
    mut eval: F,
) -> EngineResult<ScanOutcome>
where
    F: FnMut(f32) -> EngineResult<Vec<Peak>>,
{
    assert!(!radii.is_empty());
    let n = radii.len();
    let mut grid: Vec<Option<Vec<Peak>>> = vec![None; n];
    let mut walk_evaluations = 0usize;

    let mid = n / 2;
    grid[mid] = Some(eval(radii[mid])?);
    walk_evaluations += 1;

    // Running score for index `i` given everything evaluated so far.
    let running_score = |grid: &[Option<Vec<Peak>>], i: usize| -> f32 {
        let counts: Vec<usize> = grid
            .iter()
            .filter_map(|e| e.as_ref().map(Vec::len))
            .collect();
        let k = top_count(&counts);
        score_top(grid[i].as_ref().expect("scored radius was evaluated"), k)
    };

    for dir in [-1isize, 1] {
        let mut prev = running_score(&grid, mid);
        let mut decreasing = 0u32;
        let mut i = mid as isize;
        loop {
            i += dir;
            if i < 0 || i >= n as isize {
                break;
            }
            let iu = i as usize;
            if grid[iu].is_none() {
                grid[iu] = Some(eval(radii[iu])?);
                walk_evaluations += 1;
            }
            let s = running_score(&grid, iu);
            if s < prev {
                decreasing += 1;
                if decreasing >= 2 {
                    break;
                }
            } else {
                decreasing = 0;
            }
            prev = s;
        }
    }

    // Final scores with the settled top count.
    let counts: Vec<usize> = grid
        .iter()
        .filter_map(|e| e.as_ref().map(Vec::len))
        .collect();
    let k = top_count(&counts);

    let mut evaluated: Vec<(f32, Vec<Peak>, f32)> = Vec::new();
    for (i, entry) in grid.into_iter().enumerate() {
        if let Some(peaks) = entry {
            let s = score_top(&peaks, k);
            evaluated.push((radii[i], peaks, s));
        }
    }

    let mut best = 0usize;
    for i in 1..evaluated.len() {
        if evaluated[i].2 > evaluated[best].2 {
            best = i;
        }
    }
    let mut best_radius = evaluated[best].0;
    let mut best_score = evaluated[best].2;

    // Bisection refinement around the best grid radius.
    let mut bisection_evaluations = 0usize;
    let mut step = increment * 0.5;
    for _ in 0..max_bisections {
        for candidate in [best_radius - step, best_radius + step] {
            if candidate <= 1.0 {
                continue;
            }
            if evaluated
                .iter()
                .any(|(r, _, _)| (r - candidate).abs() < 1e-4)
            {
                continue;
            }
            let peaks = eval(candidate)?;
            bisection_evaluations += 1;
            let s = score_top(&peaks, k);
            evaluated.push((candidate, peaks, s));
            if s > best_score {
                best_score = s;
                best_radius = candidate;
            }
        }
        step *= 0.5;
        if step < 0.05 {
            break;
        }
    }

    let interpolated = parabolic_vertex(&evaluated, best_radius).unwrap_or(best_radius);

    let best_entry = evaluated
        .iter()
        .position(|(r, _, _)| *r == best_radius)
        .expect("best radius was evaluated");
    let runner_up = runner_up_index(&evaluated, best_entry);

    let report = RadiusScanReport {
        evaluated: evaluated.iter().map(|(r, _, s)| (*r, *s)).collect(),
        walk_evaluations,
        bisection_evaluations,
    };
    let runner_up_peaks = runner_up
        .map(|i| evaluated[i].1.clone())
        .unwrap_or_default();
    let (r, peaks, _) = evaluated.swap_remove(best_entry);

    Ok(ScanOutcome {
        best_radius: interpolated,
        best_evaluated_radius: r,
        best_peaks: peaks,
        runner_up_peaks,
        report,
    })
}

fn runner_up_index(evaluated: &[(f32, Vec<Peak>, f32)], best: usize) -> Option<usize> {
    let mut runner: Option<usize> = None;
    for i in 0..evaluated.len() {
        if i == best {
            continue;
        }
        if runner.map_or(true, |r| evaluated[i].2 > evaluated[r].2) {
            runner = Some(i);
        }
    }
    runner
}

/// Quadratic vertex through the best radius and its nearest evaluated
/// neighbors on each side; `None` when a side is missing or the fit is
/// degenerate.
fn parabolic_vertex(evaluated: &[(f32, Vec<Peak>, f32)], best_radius: f32) -> Option<f32> {
    let mut left: Option<(f32, f32)> = None;
    let mut right: Option<(f32, f32)> = None;
    let mut center_score = 0.0;
    for &(r, _, s) in evaluated {
        if (r - best_radius).abs() < 1e-6 {
            center_score = s;
        } else if r < best_radius {
            if left.map_or(true, |(lr, _)| r > lr) {
                left = Some((r, s));
            }
        } else if right.map_or(true, |(rr, _)| r < rr) {
            right = Some((r, s));
        }
    }
    let (rl, sl) = left?;
    let (rr, sr) = right?;
    let (rc, sc) = (best_radius, center_score);

    let denom = rl * (sc - sr) + rc * (sr - sl) + rr * (sl - sc);
    if denom.abs() < 1e-12 {
        return None;
    }
    let vertex = 0.5
        * (rl * rl * (sc - sr) + rc * rc * (sr - sl) + rr * rr * (sl - sc))
        / denom;
    if vertex.is_finite() {
        Some(vertex.clamp(rl, rr))
    } else {
        None
    }
}
