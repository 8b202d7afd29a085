//! Integer grid propagation and robust cell-position prediction.

use std::collections::{HashMap, VecDeque};

use nalgebra::{Matrix3, Vector3};

use crate::config::LatticeParams;
use crate::DetectedPoint;

use super::{LatticeGeometry, NeighborConnection};

/// Fill in each connection's best lattice-edge fit: the minimum, over the
/// two step vectors, both signs, and any alternate endpoint positions, of
/// the law-of-cosines distance between the connection and the expected edge.
pub(super) fn fit_connection_errors(
    conns: &mut [NeighborConnection],
    points: &[DetectedPoint],
    alternates: &[Option<DetectedPoint>],
    geometry: &LatticeGeometry,
) {
    let steps = [
        (geometry.primary, (1i32, 0i32)),
        (geometry.secondary, (0i32, 1i32)),
    ];
    for conn in conns.iter_mut() {
        let mut best = f32::INFINITY;
        let mut best_step = (0i32, 0i32);
        for pa in endpoint_candidates(points, alternates, conn.a) {
            for pb in endpoint_candidates(points, alternates, conn.b) {
                let dx = pb[0] - pa[0];
                let dy = pb[1] - pa[1];
                let len = (dx * dx + dy * dy).sqrt() as f32;
                let ang = dy.atan2(dx) as f32;
                for (vec, base) in steps {
                    let cos_d = (ang - vec.angle).cos();
                    let along = 2.0 * len * vec.length * cos_d;
                    let base_err = len * len + vec.length * vec.length;
                    for (sign, err2) in [(1, base_err - along), (-1, base_err + along)] {
                        if err2 < best {
                            best = err2;
                            best_step = (base.0 * sign, base.1 * sign);
                        }
                    }
                }
            }
        }
        conn.fitted_error = best.max(0.0).sqrt();
        conn.step = best_step;
    }
}

fn endpoint_candidates(
    points: &[DetectedPoint],
    alternates: &[Option<DetectedPoint>],
    index: usize,
) -> Vec<[f64; 2]> {
    let mut out = vec![[points[index].x, points[index].y]];
    if let Some(Some(alt)) = alternates.get(index) {
        out.push([alt.x, alt.y]);
    }
    out
}

pub(super) struct RefineOutcome {
    pub points: Vec<DetectedPoint>,
    pub grid: Vec<Option<(i32, i32)>>,
    pub missing: Vec<[f64; 2]>,
    pub rejected: usize,
}

/// Breadth-first grid assignment followed by the prediction/refinement pass.
pub(super) fn propagate_and_refine(
    points: &[DetectedPoint],
    alternates: &[Option<DetectedPoint>],
    conns: &[NeighborConnection],
    geometry: &LatticeGeometry,
    params: &LatticeParams,
) -> RefineOutcome {
    let n = points.len();
    let error_limit = params.connection_error_slack * params.max_error;

    // Adjacency over connections that fit the lattice.
    let mut adj: Vec<Vec<(usize, (i32, i32))>> = vec![Vec::new(); n];
    for c in conns {
        if c.fitted_error > error_limit {
            continue;
        }
        adj[c.a].push((c.b, c.step));
        adj[c.b].push((c.a, (-c.step.0, -c.step.1)));
    }

    // BFS components: each propagation step composes the edge's grid step
    // into the neighbor's coordinate. Conflicting re-assignments keep the
    // first value.
    let mut coords: Vec<Option<(i32, i32)>> = vec![None; n];
    let mut component: Vec<Option<usize>> = vec![None; n];
    let mut component_sizes: Vec<usize> = Vec::new();
    for seed in 0..n {
        if component[seed].is_some() || adj[seed].is_empty() {
            continue;
        }
        let id = component_sizes.len();
        let mut size = 0usize;
        let mut queue = VecDeque::new();
        component[seed] = Some(id);
        coords[seed] = Some((0, 0));
        queue.push_back(seed);
        while let Some(i) = queue.pop_front() {
            size += 1;
            let (gx, gy) = coords[i].expect("queued point has coords");
            for &(j, step) in &adj[i] {
                if component[j].is_none() {
                    component[j] = Some(id);
                    coords[j] = Some((gx + step.0, gy + step.1));
                    queue.push_back(j);
                }
            }
        }
        component_sizes.push(size);
    }

    // Classify: a point survives grid rejection when its component has at
    // least `min_group` members.
    let keep_component = |i: usize| -> bool {
        component[i].is_some_and(|c| component_sizes[c] >= params.min_group)
    };

    let mut kept: Vec<bool> = (0..n).map(keep_component).collect();
    let mut positions: Vec<[f64; 2]> = points.iter().map(|p| [p.x, p.y]).collect();
    let mut peaks: Vec<f32> = points.iter().map(|p| p.peak).collect();
    let mut missing: Vec<[f64; 2]> = Vec::new();
    let mut adopted: Vec<(usize, (i32, i32), [f64; 2], f32)> = Vec::new();

    for (comp_id, &comp_size) in component_sizes.iter().enumerate() {
        if comp_size < params.min_group {
            continue;
        }
        let mut occupancy: HashMap<(i32, i32), usize> = HashMap::new();
        for i in 0..n {
            if component[i] == Some(comp_id) {
                if let Some(c) = coords[i] {
                    occupancy.insert(c, i);
                }
            }
        }

        // Occupied-cell residual check, decided against the original
        // occupancy and applied afterwards.
        let mut drops: Vec<(usize, Option<[f64; 2]>)> = Vec::new();
        let mut substitutions: Vec<(usize, [f64; 2], f32)> = Vec::new();
        let mut occupied: Vec<((i32, i32), usize)> =
            occupancy.iter().map(|(&c, &i)| (c, i)).collect();
        occupied.sort_by_key(|&((gx, gy), _)| (gy, gx));
        for (cell, i) in occupied {
            let Some(pred) = predict_cell(&occupancy, &positions, cell, Some(i), params) else {
                continue;
            };
            let err = dist(positions[i], pred);
            if err <= params.max_error as f64 {
                continue;
            }
            let alt = alternates.get(i).copied().flatten();
            match alt {
                Some(alt) if dist([alt.x, alt.y], pred) <= params.max_error as f64 => {
                    substitutions.push((i, [alt.x, alt.y], alt.peak));
                }
                _ => drops.push((i, Some(pred))),
            }
        }
        for (i, pos, peak) in substitutions {
            positions[i] = pos;
            peaks[i] = peak;
        }
        let mut handled: Vec<(i32, i32)> = Vec::new();
        for (i, pred) in drops {
            kept[i] = false;
            if let Some(c) = coords[i] {
                occupancy.remove(&c);
                handled.push(c);
            }
            if let Some(p) = pred {
                push_missing(&mut missing, p, params);
            }
        }

        // Empty cells with enough direct or skip-one neighbors get a
        // predicted position; a nearby unplaced detection or alternate is
        // adopted, otherwise the position is reported missing.
        let (min_x, max_x, min_y, max_y) = bounding_box(&occupancy);
        for gy in min_y..=max_y {
            for gx in min_x..=max_x {
                let cell = (gx, gy);
                if occupancy.contains_key(&cell) || handled.contains(&cell) {
                    continue;
                }
                if count_axis_neighbors(&occupancy, cell) < 3 {
                    continue;
                }
                let Some(pred) = predict_cell(&occupancy, &positions, cell, None, params) else {
                    continue;
                };
                if let Some((idx, pos, peak)) =
                    rescue_candidate(points, alternates, &kept, pred, params.max_error as f64)
                {
                    adopted.push((idx, cell, pos, peak));
                } else {
                    push_missing(&mut missing, pred, params);
                }
            }
        }
    }

    // Assemble the refined set in stable index order.
    let mut out_points = Vec::new();
    let mut out_grid = Vec::new();
    let mut rejected = 0usize;
    for i in 0..n {
        if kept[i] {
            out_points.push(DetectedPoint {
                x: positions[i][0],
                y: positions[i][1],
                peak: peaks[i],
            });
            out_grid.push(coords[i]);
        } else if let Some(&(_, cell, pos, peak)) = adopted.iter().find(|(idx, ..)| *idx == i) {
            out_points.push(DetectedPoint {
                x: pos[0],
                y: pos[1],
                peak,
            });
            out_grid.push(Some(cell));
        } else {
            rejected += 1;
        }
    }

    RefineOutcome {
        points: out_points,
        grid: out_grid,
        missing,
        rejected,
    }
}

fn dist(a: [f64; 2], b: [f64; 2]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    (dx * dx + dy * dy).sqrt()
}

fn push_missing(missing: &mut Vec<[f64; 2]>, pred: [f64; 2], params: &LatticeParams) {
    if let Some([x0, y0, x1, y1]) = params.extent {
        if pred[0] < x0 || pred[0] > x1 || pred[1] < y0 || pred[1] > y1 {
            return;
        }
    }
    missing.push(pred);
}

fn bounding_box(occupancy: &HashMap<(i32, i32), usize>) -> (i32, i32, i32, i32) {
    let mut min_x = i32::MAX;
    let mut max_x = i32::MIN;
    let mut min_y = i32::MAX;
    let mut max_y = i32::MIN;
    for &(gx, gy) in occupancy.keys() {
        min_x = min_x.min(gx);
        max_x = max_x.max(gx);
        min_y = min_y.min(gy);
        max_y = max_y.max(gy);
    }
    (min_x, max_x, min_y, max_y)
}

/// Occupied neighbors at the direct and skip-one axis positions.
fn count_axis_neighbors(occupancy: &HashMap<(i32, i32), usize>, cell: (i32, i32)) -> usize {
    const OFFSETS: [(i32, i32); 8] = [
        (1, 0),
        (-1, 0),
        (0, 1),
        (0, -1),
        (2, 0),
        (-2, 0),
        (0, 2),
        (0, -2),
    ];
    OFFSETS
        .iter()
        .filter(|&&(dx, dy)| occupancy.contains_key(&(cell.0 + dx, cell.1 + dy)))
        .count()
}

/// Predict the pixel position of `cell` from a local planar fit of position
/// against grid offset over a 5x5 window.
///
/// The window is centered on whichever candidate center (the cell or one of
/// its direct neighbors) covers the most already-placed points. With enough
/// support the fit is an iteratively reweighted robust regression.
fn predict_cell(
    occupancy: &HashMap<(i32, i32), usize>,
    positions: &[[f64; 2]],
    cell: (i32, i32),
    exclude: Option<usize>,
    params: &LatticeParams,
) -> Option<[f64; 2]> {
    const CENTERS: [(i32, i32); 5] = [(0, 0), (1, 0), (-1, 0), (0, 1), (0, -1)];

    let gather = |center: (i32, i32)| -> Vec<(f64, f64, usize)> {
        let mut support = Vec::new();
        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                let c = (center.0 + dx, center.1 + dy);
                if c == cell {
                    continue;
                }
                if let Some(&i) = occupancy.get(&c) {
                    if exclude == Some(i) {
                        continue;
                    }
                    support.push(((c.0 - cell.0) as f64, (c.1 - cell.1) as f64, i));
                }
            }
        }
        support
    };

    // First-listed center wins ties, so the cell's own window is preferred.
    let mut support: Vec<(f64, f64, usize)> = Vec::new();
    for &off in &CENTERS {
        let candidate = gather((cell.0 + off.0, cell.1 + off.1));
        if candidate.len() > support.len() {
            support = candidate;
        }
    }
    if support.len() < 3 {
        return None;
    }

    let mut weights = vec![1.0f64; support.len()];
    let robust = support.len() >= params.robust_min_support;
    let iterations = if robust { 3 } else { 1 };
    let mut prediction = None;
    for iter in 0..iterations {
        let fit_x = weighted_planar_fit(&support, positions, &weights, 0)?;
        let fit_y = weighted_planar_fit(&support, positions, &weights, 1)?;
        prediction = Some([fit_x[0], fit_y[0]]);

        if iter + 1 == iterations {
            break;
        }
        // Reweight by residual against the current fit.
        let mut residuals = Vec::with_capacity(support.len());
        for &(dgx, dgy, i) in &support {
            let rx = positions[i][0] - (fit_x[0] + fit_x[1] * dgx + fit_x[2] * dgy);
            let ry = positions[i][1] - (fit_y[0] + fit_y[1] * dgx + fit_y[2] * dgy);
            residuals.push((rx * rx + ry * ry).sqrt());
        }
        let mut sorted = residuals.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let scale = (1.4826 * sorted[sorted.len() / 2]).max(1e-3);
        for (w, r) in weights.iter_mut().zip(residuals.iter()) {
            let t = r / (2.0 * scale);
            *w = 1.0 / (1.0 + t * t);
        }
    }
    prediction
}

/// Weighted least-squares fit of `position[axis] = a + b*dgx + c*dgy`,
/// returning `[a, b, c]`.
fn weighted_planar_fit(
    support: &[(f64, f64, usize)],
    positions: &[[f64; 2]],
    weights: &[f64],
    axis: usize,
) -> Option<[f64; 3]> {
    let mut m = Matrix3::<f64>::zeros();
    let mut rhs = Vector3::<f64>::zeros();
    for (&(dgx, dgy, i), &w) in support.iter().zip(weights.iter()) {
        let row = Vector3::new(1.0, dgx, dgy);
        m += w * row * row.transpose();
        rhs += w * positions[i][axis] * row;
    }
    let solution = m.lu().solve(&rhs)?;
    Some([solution[0], solution[1], solution[2]])
}

/// A detection usable for a predicted empty cell: an unplaced point, or any
/// point's alternate, within `max_error` of the prediction.
fn rescue_candidate(
    points: &[DetectedPoint],
    alternates: &[Option<DetectedPoint>],
    kept: &[bool],
    pred: [f64; 2],
    max_error: f64,
) -> Option<(usize, [f64; 2], f32)> {
    let mut best: Option<(f64, usize, [f64; 2], f32)> = None;
    for i in 0..points.len() {
        if kept[i] {
            continue;
        }
        let d = dist([points[i].x, points[i].y], pred);
        if d <= max_error && best.map_or(true, |(bd, ..)| d < bd) {
            best = Some((d, i, [points[i].x, points[i].y], points[i].peak));
        }
        if let Some(Some(alt)) = alternates.get(i) {
            let d = dist([alt.x, alt.y], pred);
            if d <= max_error && best.map_or(true, |(bd, ..)| d < bd) {
                best = Some((d, i, [alt.x, alt.y], alt.peak));
            }
        }
    }
    best.map(|(_, i, pos, peak)| (i, pos, peak))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::StepVector;

    fn unit_geometry(spacing: f32) -> LatticeGeometry {
        LatticeGeometry {
            primary: StepVector {
                length: spacing,
                angle: 0.0,
            },
            secondary: StepVector {
                length: spacing,
                angle: std::f32::consts::FRAC_PI_2,
            },
        }
    }

    #[test]
    fn connection_error_is_zero_on_an_exact_edge() {
        let points = [
            DetectedPoint {
                x: 0.0,
                y: 0.0,
                peak: 1.0,
            },
            DetectedPoint {
                x: 30.0,
                y: 0.0,
                peak: 1.0,
            },
        ];
        let mut conns = vec![NeighborConnection {
            a: 0,
            b: 1,
            length: 30.0,
            angle: 0.0,
            fitted_error: 0.0,
            step: (0, 0),
        }];
        fit_connection_errors(&mut conns, &points, &[], &unit_geometry(30.0));
        assert!(conns[0].fitted_error < 1e-3);
        assert_eq!(conns[0].step, (1, 0));
    }

    #[test]
    fn reversed_edge_gets_the_negative_step() {
        let points = [
            DetectedPoint {
                x: 30.0,
                y: 0.0,
                peak: 1.0,
            },
            DetectedPoint {
                x: 0.0,
                y: 0.0,
                peak: 1.0,
            },
        ];
        let mut conns = vec![NeighborConnection {
            a: 0,
            b: 1,
            length: 30.0,
            angle: std::f32::consts::PI,
            fitted_error: 0.0,
            step: (0, 0),
        }];
        fit_connection_errors(&mut conns, &points, &[], &unit_geometry(30.0));
        assert_eq!(conns[0].step, (-1, 0));
    }

    #[test]
    fn diagonal_connection_has_large_error() {
        let points = [
            DetectedPoint {
                x: 0.0,
                y: 0.0,
                peak: 1.0,
            },
            DetectedPoint {
                x: 30.0,
                y: 30.0,
                peak: 1.0,
            },
        ];
        let mut conns = vec![NeighborConnection {
            a: 0,
            b: 1,
            length: 42.43,
            angle: std::f32::consts::FRAC_PI_4,
            fitted_error: 0.0,
            step: (0, 0),
        }];
        fit_connection_errors(&mut conns, &points, &[], &unit_geometry(30.0));
        // Distance from the diagonal endpoint to either lattice edge is the
        // full spacing.
        assert!(
            (conns[0].fitted_error - 30.0).abs() < 0.5,
            "error {}",
            conns[0].fitted_error
        );
    }
}
