//! Lattice step-vector estimation from pairwise connection angles.

use crate::config::LatticeParams;

use super::{LatticeGeometry, NeighborConnection, StepVector};

/// Histogram bin count over the folded 0..90 degree range.
const ANGLE_BINS: usize = 9;
/// Half-width of the angular window used for iterative refinement and
/// family membership, in degrees.
const ANGLE_WINDOW_DEG: f32 = 12.5;

fn fold90(deg: f32) -> f32 {
    deg.rem_euclid(90.0)
}

fn diff90(a: f32, b: f32) -> f32 {
    (a - b + 45.0).rem_euclid(90.0) - 45.0
}

fn diff180(a: f32, b: f32) -> f32 {
    (a - b + 90.0).rem_euclid(180.0) - 90.0
}

fn median_of(mut values: Vec<f32>) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}

/// Connections within the angular window of `center_deg` (in 180-space).
fn family<'a>(
    conns: &'a [NeighborConnection],
    center_deg: f32,
) -> impl Iterator<Item = (&'a NeighborConnection, f32)> {
    conns.iter().filter_map(move |c| {
        let a180 = c.angle.to_degrees().rem_euclid(180.0);
        let d = diff180(a180, center_deg);
        (d.abs() <= ANGLE_WINDOW_DEG).then_some((c, d))
    })
}

fn refined_angle(conns: &[NeighborConnection], center_deg: f32) -> Option<f32> {
    let diffs: Vec<f32> = family(conns, center_deg).map(|(_, d)| d).collect();
    if diffs.is_empty() {
        return None;
    }
    Some(center_deg + diffs.iter().sum::<f32>() / diffs.len() as f32)
}

fn family_lengths(conns: &[NeighborConnection], center_deg: f32) -> Vec<f32> {
    family(conns, center_deg).map(|(c, _)| c.length).collect()
}

/// Estimate the two dominant lattice step vectors.
///
/// A coarse 9-bin histogram of angles folded into 0..90 degrees seeds an
/// iterative windowed-mean refinement; the primary and orthogonal families
/// are then refined separately in 180-space. When the diagonal direction
/// carries more and markedly shorter connections than the orthogonal pair,
/// the lattice was locked onto its diagonal and the 45-degree directions
/// take over.
pub(crate) fn estimate_geometry(
    conns: &[NeighborConnection],
    params: &LatticeParams,
) -> LatticeGeometry {
    let fallback_len = (params.max_spacing / 1.5).max(1.0);
    if conns.is_empty() {
        let step = StepVector {
            length: fallback_len,
            angle: 0.0,
        };
        return LatticeGeometry {
            primary: step,
            secondary: StepVector {
                angle: std::f32::consts::FRAC_PI_2,
                ..step
            },
        };
    }

    // Coarse peak over folded angles.
    let mut counts = [0usize; ANGLE_BINS];
    for c in conns {
        let af = fold90(c.angle.to_degrees());
        let bin = ((af / 90.0 * ANGLE_BINS as f32) as usize).min(ANGLE_BINS - 1);
        counts[bin] += 1;
    }
    let peak_bin = (0..ANGLE_BINS)
        .max_by_key(|&b| counts[b])
        .expect("bins are non-empty");
    let mut est = (peak_bin as f32 + 0.5) * (90.0 / ANGLE_BINS as f32);

    // Iterative windowed mean in the folded space.
    for _ in 0..5 {
        let diffs: Vec<f32> = conns
            .iter()
            .map(|c| diff90(fold90(c.angle.to_degrees()), est))
            .filter(|d| d.abs() <= ANGLE_WINDOW_DEG)
            .collect();
        if diffs.is_empty() {
            break;
        }
        est = fold90(est + diffs.iter().sum::<f32>() / diffs.len() as f32);
    }

    let build = |primary_deg: f32| -> Option<LatticeGeometry> {
        let ang_a = refined_angle(conns, primary_deg);
        let ang_b = refined_angle(conns, primary_deg + 90.0);
        let len_a = median_of(family_lengths(conns, primary_deg));
        let len_b = median_of(family_lengths(conns, primary_deg + 90.0));
        match (ang_a, ang_b) {
            (Some(a), Some(b)) => Some(LatticeGeometry {
                primary: StepVector {
                    length: len_a,
                    angle: a.to_radians(),
                },
                secondary: StepVector {
                    length: len_b,
                    angle: b.to_radians(),
                },
            }),
            (Some(a), None) => Some(LatticeGeometry {
                primary: StepVector {
                    length: len_a,
                    angle: a.to_radians(),
                },
                secondary: StepVector {
                    length: len_a,
                    angle: (a + 90.0).to_radians(),
                },
            }),
            (None, Some(b)) => Some(LatticeGeometry {
                primary: StepVector {
                    length: len_b,
                    angle: (b - 90.0).to_radians(),
                },
                secondary: StepVector {
                    length: len_b,
                    angle: b.to_radians(),
                },
            }),
            (None, None) => None,
        }
    };

    let mut geometry = build(est).unwrap_or(LatticeGeometry {
        primary: StepVector {
            length: fallback_len,
            angle: 0.0,
        },
        secondary: StepVector {
            length: fallback_len,
            angle: std::f32::consts::FRAC_PI_2,
        },
    });

    // Diagonal override: more and markedly shorter connections at 45
    // degrees mean the folded peak locked onto the lattice diagonal.
    let count_a = family(conns, est).count();
    let count_b = family(conns, est + 90.0).count();
    let diag: Vec<f32> = family_lengths(conns, est + 45.0)
        .into_iter()
        .chain(family_lengths(conns, est + 135.0))
        .collect();
    if diag.len() >= params.min_group {
        let med_diag = median_of(diag.clone());
        let avg_len = 0.5 * (geometry.primary.length + geometry.secondary.length);
        let stronger = count_a.max(count_b) as f32;
        if diag.len() as f32 > params.diagonal_count_ratio * stronger
            && med_diag < params.diagonal_length_ratio * std::f32::consts::SQRT_2 * avg_len
        {
            if let Some(diag_geometry) = build(fold90(est + 45.0)) {
                tracing::debug!(
                    diag_connections = diag.len(),
                    med_diag,
                    "diagonal direction replaces the orthogonal pair"
                );
                geometry = diag_geometry;
            }
        }
    }

    geometry
}
