//! Neighbor-graph lattice inference over detected hole centers.
//!
//! The analyzer estimates the two dominant lattice step vectors from the
//! pairwise connection angles, propagates integer grid coordinates by
//! breadth-first traversal over connections that fit the lattice, predicts
//! positions for empty or misplaced cells by local robust regression, and
//! reports predicted-but-missing positions.

mod angles;
mod grid;

use crate::config::LatticeParams;
use crate::DetectedPoint;

pub(crate) use angles::estimate_geometry;

/// One lattice step vector.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StepVector {
    /// Step length in original-image pixels.
    pub length: f32,
    /// Step direction in radians.
    pub angle: f32,
}

/// The two step vectors shared by the whole point set.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LatticeGeometry {
    /// Step along the dominant direction.
    pub primary: StepVector,
    /// Step along the complementary direction.
    pub secondary: StepVector,
}

impl LatticeGeometry {
    /// Mean step length, the "true spacing" of the hole pattern.
    pub fn spacing(&self) -> f32 {
        0.5 * (self.primary.length + self.secondary.length)
    }
}

/// A pair of points closer than the maximum spacing, with the error of the
/// best lattice-edge fit. Recomputed on every analysis call.
#[derive(Debug, Clone, Copy)]
pub struct NeighborConnection {
    /// Index of the first endpoint.
    pub a: usize,
    /// Index of the second endpoint.
    pub b: usize,
    /// Distance between the endpoints.
    pub length: f32,
    /// Direction from `a` to `b` in radians.
    pub angle: f32,
    /// Distance between the connection and the best-fitting lattice edge,
    /// allowing alternate endpoint positions.
    pub fitted_error: f32,
    /// Grid step from `a` to `b` implied by the best fit.
    pub(crate) step: (i32, i32),
}

/// Output of [`analyze_neighbors`].
#[derive(Debug, Clone)]
pub struct LatticeAnalysis {
    /// Accepted points after grid rejection and substitution.
    pub points: Vec<DetectedPoint>,
    /// Integer grid coordinate per accepted point (arbitrary origin per
    /// connected component); `None` in geometry-only mode.
    pub grid: Vec<Option<(i32, i32)>>,
    /// Shared lattice step vectors.
    pub geometry: LatticeGeometry,
    /// Predicted positions of lattice nodes with no acceptable detection.
    pub missing: Vec<[f64; 2]>,
    /// Number of points rejected because their connected group was too
    /// small, plus points dropped against the lattice prediction.
    pub rejected: usize,
}

/// Build all point-pair connections within `max_spacing`.
fn build_connections(points: &[DetectedPoint], max_spacing: f32) -> Vec<NeighborConnection> {
    let mut conns = Vec::new();
    let max2 = (max_spacing as f64) * (max_spacing as f64);
    for a in 0..points.len() {
        for b in (a + 1)..points.len() {
            let dx = points[b].x - points[a].x;
            let dy = points[b].y - points[a].y;
            let d2 = dx * dx + dy * dy;
            if d2 > max2 || d2 <= 0.0 {
                continue;
            }
            conns.push(NeighborConnection {
                a,
                b,
                length: d2.sqrt() as f32,
                angle: dy.atan2(dx) as f32,
                fitted_error: 0.0,
                step: (0, 0),
            });
        }
    }
    conns
}

/// Median nearest-neighbor distance, the spacing seed for geometry-only
/// estimation.
fn nearest_neighbor_median(points: &[DetectedPoint]) -> f32 {
    let mut nearest = Vec::with_capacity(points.len());
    for a in 0..points.len() {
        let mut best = f64::INFINITY;
        for b in 0..points.len() {
            if a == b {
                continue;
            }
            let dx = points[b].x - points[a].x;
            let dy = points[b].y - points[a].y;
            let d2 = dx * dx + dy * dy;
            if d2 < best {
                best = d2;
            }
        }
        if best.is_finite() {
            nearest.push(best.sqrt() as f32);
        }
    }
    crate::stats::median(&nearest)
}

/// Analyze the neighbor structure of a point set.
///
/// With `params.max_spacing > 0`, returns refined points, their integer grid
/// coordinates, and the missing-position predictions. With
/// `params.max_spacing <= 0`, estimates the lattice geometry only (seeded by
/// the median nearest-neighbor distance) and returns the points unchanged;
/// this mode accepts point sets in arbitrary units.
pub fn analyze_neighbors(
    points: &[DetectedPoint],
    alternates: &[Option<DetectedPoint>],
    params: &LatticeParams,
) -> LatticeAnalysis {
    if params.max_spacing <= 0.0 {
        let seed = nearest_neighbor_median(points);
        let conns = build_connections(points, seed * 1.5);
        let geometry = estimate_geometry(&conns, params);
        return LatticeAnalysis {
            points: points.to_vec(),
            grid: vec![None; points.len()],
            geometry,
            missing: Vec::new(),
            rejected: 0,
        };
    }

    let mut conns = build_connections(points, params.max_spacing);
    let geometry = estimate_geometry(&conns, params);
    grid::fit_connection_errors(&mut conns, points, alternates, &geometry);

    let outcome = grid::propagate_and_refine(points, alternates, &conns, &geometry, params);

    tracing::debug!(
        accepted = outcome.points.len(),
        missing = outcome.missing.len(),
        rejected = outcome.rejected,
        spacing = geometry.spacing(),
        "lattice analysis complete"
    );

    LatticeAnalysis {
        points: outcome.points,
        grid: outcome.grid,
        geometry,
        missing: outcome.missing,
        rejected: outcome.rejected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_lattice(rows: usize, cols: usize, spacing: f64, origin: [f64; 2]) -> Vec<DetectedPoint> {
        let mut pts = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                pts.push(DetectedPoint {
                    x: origin[0] + c as f64 * spacing,
                    y: origin[1] + r as f64 * spacing,
                    peak: 1.0,
                });
            }
        }
        pts
    }

    #[test]
    fn geometry_only_mode_estimates_spacing_from_arbitrary_units() {
        let pts = square_lattice(5, 5, 0.04, [0.0, 0.0]);
        let params = LatticeParams::default(); // max_spacing == 0
        let analysis = analyze_neighbors(&pts, &[], &params);
        assert_eq!(analysis.points.len(), 25);
        assert!(analysis.grid.iter().all(Option::is_none));
        assert!(
            (analysis.geometry.spacing() - 0.04).abs() < 0.004,
            "spacing {}",
            analysis.geometry.spacing()
        );
        assert!(analysis.missing.is_empty());
    }

    #[test]
    fn perfect_lattice_is_fully_accepted_with_consistent_grid() {
        let pts = square_lattice(4, 6, 32.0, [10.0, 20.0]);
        let params = LatticeParams::from_spacing(32.0, 3.0);
        let analysis = analyze_neighbors(&pts, &[], &params);
        assert_eq!(analysis.points.len(), 24);
        assert!(analysis.missing.is_empty(), "missing: {:?}", analysis.missing);
        assert!((analysis.geometry.spacing() - 32.0).abs() < 0.5);

        // Grid coordinates must be affinely consistent with positions.
        let g0 = analysis.grid[0].expect("assigned");
        for (i, p) in analysis.points.iter().enumerate() {
            let g = analysis.grid[i].expect("assigned");
            let dgx = (g.0 - g0.0) as f64;
            let dgy = (g.1 - g0.1) as f64;
            let expected_d2 = (dgx * dgx + dgy * dgy) * 32.0 * 32.0;
            let dx = p.x - analysis.points[0].x;
            let dy = p.y - analysis.points[0].y;
            let d2 = dx * dx + dy * dy;
            assert!(
                (d2.sqrt() - expected_d2.sqrt()).abs() < 3.0,
                "grid {:?} inconsistent with position for point {}",
                g,
                i
            );
        }
    }

    #[test]
    fn deleted_interior_point_is_predicted_as_missing() {
        let mut pts = square_lattice(5, 5, 30.0, [0.0, 0.0]);
        // Remove the center point (row 2, col 2).
        let removed = pts.remove(2 * 5 + 2);
        let params = LatticeParams::from_spacing(30.0, 3.0);
        let analysis = analyze_neighbors(&pts, &[], &params);
        assert_eq!(analysis.points.len(), 24);
        assert_eq!(analysis.missing.len(), 1, "missing: {:?}", analysis.missing);
        let m = analysis.missing[0];
        let err = ((m[0] - removed.x).powi(2) + (m[1] - removed.y).powi(2)).sqrt();
        assert!(err <= 3.0, "prediction off by {} px", err);
    }

    #[test]
    fn displaced_point_is_replaced_by_a_fitting_alternate() {
        let mut pts = square_lattice(5, 5, 30.0, [0.0, 0.0]);
        let idx = 2 * 5 + 2;
        let true_pos = (pts[idx].x, pts[idx].y);
        pts[idx].x += 9.0; // beyond max_error
        let mut alternates = vec![None; pts.len()];
        alternates[idx] = Some(DetectedPoint {
            x: true_pos.0 + 0.5,
            y: true_pos.1,
            peak: 0.6,
        });
        let params = LatticeParams::from_spacing(30.0, 3.0);
        let analysis = analyze_neighbors(&pts, &alternates, &params);
        assert_eq!(analysis.points.len(), 25);
        assert!(analysis.missing.is_empty());
        let substituted = analysis
            .points
            .iter()
            .find(|p| (p.x - (true_pos.0 + 0.5)).abs() < 1e-6)
            .expect("alternate substituted");
        assert_eq!(substituted.peak, 0.6);
    }

    #[test]
    fn displaced_point_without_alternate_is_dropped_and_reported_missing() {
        let mut pts = square_lattice(5, 5, 30.0, [0.0, 0.0]);
        let idx = 2 * 5 + 2;
        let true_pos = (pts[idx].x, pts[idx].y);
        pts[idx].x += 9.0;
        pts[idx].y -= 8.0;
        let params = LatticeParams::from_spacing(30.0, 3.0);
        let analysis = analyze_neighbors(&pts, &[], &params);
        assert_eq!(analysis.points.len(), 24);
        assert_eq!(analysis.missing.len(), 1);
        let m = analysis.missing[0];
        let err = ((m[0] - true_pos.0).powi(2) + (m[1] - true_pos.1).powi(2)).sqrt();
        assert!(err <= 3.0, "prediction off by {} px", err);
    }

    #[test]
    fn tiny_groups_are_grid_rejected() {
        let mut pts = square_lattice(4, 4, 30.0, [0.0, 0.0]);
        // Two stray points far away, connected only to each other.
        pts.push(DetectedPoint {
            x: 500.0,
            y: 500.0,
            peak: 1.0,
        });
        pts.push(DetectedPoint {
            x: 530.0,
            y: 500.0,
            peak: 1.0,
        });
        let params = LatticeParams::from_spacing(30.0, 3.0);
        let analysis = analyze_neighbors(&pts, &[], &params);
        assert_eq!(analysis.points.len(), 16);
        assert!(analysis.rejected >= 2);
    }

    #[test]
    fn rotated_lattice_recovers_its_angle() {
        let angle = 0.3f64;
        let (s, c) = angle.sin_cos();
        let mut pts = Vec::new();
        for r in 0..5 {
            for col in 0..5 {
                let x = col as f64 * 28.0;
                let y = r as f64 * 28.0;
                pts.push(DetectedPoint {
                    x: 300.0 + x * c - y * s,
                    y: 300.0 + x * s + y * c,
                    peak: 1.0,
                });
            }
        }
        let params = LatticeParams::from_spacing(28.0, 3.0);
        let analysis = analyze_neighbors(&pts, &[], &params);
        assert_eq!(analysis.points.len(), 25);
        let got = analysis.geometry.primary.angle.rem_euclid(std::f32::consts::FRAC_PI_2);
        let want = (angle as f32).rem_euclid(std::f32::consts::FRAC_PI_2);
        assert!(
            (got - want).abs() < 0.03,
            "angle {} vs expected {}",
            got,
            want
        );
    }
}
