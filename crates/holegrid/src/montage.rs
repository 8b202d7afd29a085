//! Reconciliation of per-tile detections into one global point set.
//!
//! Montage tiles overlap, so the same hole can be detected by two adjacent
//! tiles and by the full-mosaic analysis. Reconciliation runs in three
//! phases: duplicate removal between adjacent tiles, tile-to-global
//! substitution or addition gated by overlap-zone geometry, and residual
//! tile assignment for every remaining global point.

use crate::config::MontageParams;
use crate::DetectedPoint;

/// Per-tile detection record: point list in tile coordinates plus the
/// tile's placement in the mosaic.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MontagePiece {
    /// Detected points in tile pixel coordinates.
    pub points: Vec<DetectedPoint>,
    /// Tile origin in mosaic pixels.
    pub x_offset: f64,
    /// Tile origin in mosaic pixels.
    pub y_offset: f64,
    /// Tile width in pixels.
    pub width: f64,
    /// Tile height in pixels.
    pub height: f64,
}

impl MontagePiece {
    fn extent(&self) -> [f64; 4] {
        [
            self.x_offset,
            self.y_offset,
            self.x_offset + self.width,
            self.y_offset + self.height,
        ]
    }

    /// Distance from a mosaic-coordinate point to the nearest tile edge;
    /// negative outside the tile.
    fn edge_distance(&self, xy: [f64; 2]) -> f64 {
        let [x0, y0, x1, y1] = self.extent();
        (xy[0] - x0)
            .min(x1 - xy[0])
            .min(xy[1] - y0)
            .min(y1 - xy[1])
    }

    fn contains(&self, xy: [f64; 2]) -> bool {
        self.edge_distance(xy) >= 0.0
    }
}

/// Merged global result of [`resolve_piece_positions`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MontageResolution {
    /// Global points in mosaic coordinates.
    pub points: Vec<DetectedPoint>,
    /// Tile each point is assigned to.
    pub piece_index: Vec<Option<usize>>,
    /// Point position in its assigned tile's pixel coordinates.
    pub piece_coords: Vec<Option<[f64; 2]>>,
}

struct TilePoint {
    piece: usize,
    mosaic: [f64; 2],
    peak: f32,
    alive: bool,
}

struct GlobalPoint {
    point: DetectedPoint,
    piece: Option<usize>,
}

/// Penetration of a point into the overlap zones of its own tile:
/// `(distance past the zone boundary, fraction of the way across)`,
/// maximal over all zones containing the point. `None` when the point lies
/// in no overlap zone.
fn overlap_penetration(
    pieces: &[MontagePiece],
    own: usize,
    xy: [f64; 2],
) -> Option<(f64, f64)> {
    let [ax0, ay0, ax1, ay1] = pieces[own].extent();
    let mut worst: Option<(f64, f64)> = None;
    for (qi, q) in pieces.iter().enumerate() {
        if qi == own {
            continue;
        }
        let [bx0, by0, bx1, by1] = q.extent();
        let zx0 = ax0.max(bx0);
        let zy0 = ay0.max(by0);
        let zx1 = ax1.min(bx1);
        let zy1 = ay1.min(by1);
        if zx0 >= zx1 || zy0 >= zy1 {
            continue;
        }
        if xy[0] < zx0 || xy[0] > zx1 || xy[1] < zy0 || xy[1] > zy1 {
            continue;
        }
        // Measure along each axis where the neighbor is genuinely offset,
        // from the zone boundary nearest this tile's interior.
        let a_cx = 0.5 * (ax0 + ax1);
        let a_cy = 0.5 * (ay0 + ay1);
        let b_cx = 0.5 * (bx0 + bx1);
        let b_cy = 0.5 * (by0 + by1);
        let mut zone_best: Option<(f64, f64)> = None;
        if (b_cx - a_cx).abs() > 1e-9 {
            let (dist, width) = if b_cx > a_cx {
                (xy[0] - zx0, zx1 - zx0)
            } else {
                (zx1 - xy[0], zx1 - zx0)
            };
            zone_best = Some((dist, dist / width.max(1e-9)));
        }
        if (b_cy - a_cy).abs() > 1e-9 {
            let (dist, width) = if b_cy > a_cy {
                (xy[1] - zy0, zy1 - zy0)
            } else {
                (zy1 - xy[1], zy1 - zy0)
            };
            let frac = dist / width.max(1e-9);
            if zone_best.map_or(true, |(_, f)| frac > f) {
                zone_best = Some((dist, frac));
            }
        }
        if let Some(candidate) = zone_best {
            if worst.map_or(true, |(_, f)| candidate.1 > f) {
                worst = Some(candidate);
            }
        }
    }
    worst
}

/// Merge per-tile detections with the global point set.
///
/// `missing` and `weak_candidates` are pruned in place: entries made
/// redundant by a newly added point are removed.
pub fn resolve_piece_positions(
    pieces: &[MontagePiece],
    global_points: &[DetectedPoint],
    missing: &mut Vec<[f64; 2]>,
    weak_candidates: &mut Vec<DetectedPoint>,
    params: &MontageParams,
) -> MontageResolution {
    let mut tile_points: Vec<TilePoint> = Vec::new();
    for (pi, piece) in pieces.iter().enumerate() {
        for p in &piece.points {
            tile_points.push(TilePoint {
                piece: pi,
                mosaic: [p.x + piece.x_offset, p.y + piece.y_offset],
                peak: p.peak,
                alive: true,
            });
        }
    }

    phase1_dedup(pieces, &mut tile_points, params);

    let mut globals: Vec<GlobalPoint> = global_points
        .iter()
        .map(|&point| GlobalPoint { point, piece: None })
        .collect();
    phase2_reconcile(
        pieces,
        &tile_points,
        &mut globals,
        missing,
        weak_candidates,
        params,
    );
    phase3_assign(pieces, &mut globals);

    let mut points = Vec::with_capacity(globals.len());
    let mut piece_index = Vec::with_capacity(globals.len());
    let mut piece_coords = Vec::with_capacity(globals.len());
    for g in globals {
        points.push(g.point);
        piece_index.push(g.piece);
        piece_coords.push(g.piece.map(|pi| {
            [
                g.point.x - pieces[pi].x_offset,
                g.point.y - pieces[pi].y_offset,
            ]
        }));
    }
    tracing::info!(
        merged = points.len(),
        remaining_missing = missing.len(),
        "montage reconciliation complete"
    );
    MontageResolution {
        points,
        piece_index,
        piece_coords,
    }
}

/// Intra-tile dedup: of two points on adjacent tiles describing the same
/// hole, keep whichever sits farther from its own tile's edge. The
/// same-hole test runs in a frame rotated to the lattice axis.
fn phase1_dedup(pieces: &[MontagePiece], tile_points: &mut [TilePoint], params: &MontageParams) {
    let threshold = (params.pc_to_pc_same_frac * params.spacing) as f64;
    let (sin_a, cos_a) = (params.lattice_angle as f64).sin_cos();
    for i in 0..tile_points.len() {
        if !tile_points[i].alive {
            continue;
        }
        for j in (i + 1)..tile_points.len() {
            if !tile_points[j].alive || tile_points[i].piece == tile_points[j].piece {
                continue;
            }
            let dx = tile_points[j].mosaic[0] - tile_points[i].mosaic[0];
            let dy = tile_points[j].mosaic[1] - tile_points[i].mosaic[1];
            let du = cos_a * dx + sin_a * dy;
            let dv = -sin_a * dx + cos_a * dy;
            if du.abs() >= threshold || dv.abs() >= threshold {
                continue;
            }
            let di = pieces[tile_points[i].piece].edge_distance(tile_points[i].mosaic);
            let dj = pieces[tile_points[j].piece].edge_distance(tile_points[j].mosaic);
            if di >= dj {
                tile_points[j].alive = false;
            } else {
                tile_points[i].alive = false;
                break;
            }
        }
    }
}

/// Tile-to-global reconciliation: substitute matched global points when the
/// tile point sits just inside an overlap zone, or add unmatched tile
/// points that are not too deep into a zone.
fn phase2_reconcile(
    pieces: &[MontagePiece],
    tile_points: &[TilePoint],
    globals: &mut Vec<GlobalPoint>,
    missing: &mut Vec<[f64; 2]>,
    weak_candidates: &mut Vec<DetectedPoint>,
    params: &MontageParams,
) {
    let same_dist = (params.pc_to_full_same_frac * params.spacing) as f64;
    let radius = params.radius as f64;
    let min_edge = params.use_piece_edge_dist_frac as f64 * radius;

    for tp in tile_points.iter().filter(|tp| tp.alive) {
        let edge_dist = pieces[tp.piece].edge_distance(tp.mosaic);
        let penetration = overlap_penetration(pieces, tp.piece, tp.mosaic);

        let nearest_global = globals
            .iter()
            .enumerate()
            .map(|(gi, g)| (g.point.distance_to_xy(tp.mosaic), gi))
            .filter(|(d, _)| *d <= same_dist)
            .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, gi)| gi);

        match nearest_global {
            Some(gi) => {
                let deep_enough = penetration.is_some_and(|(dist, frac)| {
                    dist < params.subst_overlap_dist_frac as f64 * radius && frac < 0.5
                });
                if deep_enough && edge_dist > min_edge {
                    globals[gi].point = DetectedPoint {
                        x: tp.mosaic[0],
                        y: tp.mosaic[1],
                        peak: tp.peak,
                    };
                    globals[gi].piece = Some(tp.piece);
                }
            }
            None => {
                let too_deep = penetration
                    .is_some_and(|(_, frac)| frac > params.add_overlap_frac as f64);
                if too_deep || edge_dist <= min_edge {
                    continue;
                }
                let added = DetectedPoint {
                    x: tp.mosaic[0],
                    y: tp.mosaic[1],
                    peak: tp.peak,
                };
                missing.retain(|&m| added.distance_to_xy(m) > same_dist);
                weak_candidates.retain(|w| added.distance_to(w) > same_dist);
                globals.push(GlobalPoint {
                    point: added,
                    piece: Some(tp.piece),
                });
            }
        }
    }
}

/// Assign every remaining global point to the tile containing it with the
/// least overlap-zone penetration, or failing containment, to the tile with
/// the greatest distance from its edge.
fn phase3_assign(pieces: &[MontagePiece], globals: &mut [GlobalPoint]) {
    for g in globals.iter_mut() {
        if g.piece.is_some() {
            continue;
        }
        let xy = [g.point.x, g.point.y];
        let mut best_containing: Option<(f64, usize)> = None;
        for pi in 0..pieces.len() {
            if !pieces[pi].contains(xy) {
                continue;
            }
            let frac = overlap_penetration(pieces, pi, xy).map_or(0.0, |(_, f)| f);
            if best_containing.map_or(true, |(bf, _)| frac < bf) {
                best_containing = Some((frac, pi));
            }
        }
        g.piece = match best_containing {
            Some((_, pi)) => Some(pi),
            None => (0..pieces.len())
                .max_by(|&a, &b| {
                    pieces[a]
                        .edge_distance(xy)
                        .partial_cmp(&pieces[b].edge_distance(xy))
                        .unwrap_or(std::cmp::Ordering::Equal)
                }),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lattice_in(extent: [f64; 4], origin: [f64; 2], spacing: f64, rows: usize, cols: usize) -> Vec<[f64; 2]> {
        let mut out = Vec::new();
        for r in 0..rows {
            for c in 0..cols {
                let x = origin[0] + c as f64 * spacing;
                let y = origin[1] + r as f64 * spacing;
                if x >= extent[0] && x < extent[2] && y >= extent[1] && y < extent[3] {
                    out.push([x, y]);
                }
            }
        }
        out
    }

    fn piece_with_points(extent: [f64; 4], centers: &[[f64; 2]]) -> MontagePiece {
        MontagePiece {
            points: centers
                .iter()
                .map(|c| DetectedPoint {
                    x: c[0] - extent[0],
                    y: c[1] - extent[1],
                    peak: 1.0,
                })
                .collect(),
            x_offset: extent[0],
            y_offset: extent[1],
            width: extent[2] - extent[0],
            height: extent[3] - extent[1],
        }
    }

    fn params() -> MontageParams {
        MontageParams {
            spacing: 30.0,
            radius: 8.0,
            ..MontageParams::default()
        }
    }

    #[test]
    fn two_overlapping_tiles_merge_without_duplication_or_loss() {
        // 5x7 lattice across a 240x180 mosaic split into two tiles
        // overlapping over x in [100, 140].
        let full = lattice_in([0.0, 0.0, 240.0, 180.0], [15.0, 15.0], 30.0, 5, 7);
        assert_eq!(full.len(), 35);
        let left_extent = [0.0, 0.0, 140.0, 180.0];
        let right_extent = [100.0, 0.0, 240.0, 180.0];
        let left = piece_with_points(
            left_extent,
            &lattice_in(left_extent, [15.0, 15.0], 30.0, 5, 7),
        );
        let right = piece_with_points(
            right_extent,
            &lattice_in(right_extent, [15.0, 15.0], 30.0, 5, 7),
        );
        // Points in the overlap are detected by both tiles.
        assert!(left.points.len() + right.points.len() > 35);

        let mut missing = Vec::new();
        let mut weak = Vec::new();
        let resolution = resolve_piece_positions(
            &[left, right],
            &[],
            &mut missing,
            &mut weak,
            &params(),
        );

        assert_eq!(resolution.points.len(), 35, "merged point count");
        for expected in &full {
            let found = resolution
                .points
                .iter()
                .any(|p| p.distance_to_xy(*expected) < 1e-6);
            assert!(found, "lost lattice point {:?}", expected);
        }
        // Every point carries a tile assignment and in-tile coordinates.
        for (idx, pi) in resolution.piece_index.iter().enumerate() {
            assert!(pi.is_some(), "point {} unassigned", idx);
            assert!(resolution.piece_coords[idx].is_some());
        }
    }

    #[test]
    fn overlap_duplicate_keeps_the_point_farther_from_its_edge() {
        let left_extent = [0.0, 0.0, 140.0, 180.0];
        let right_extent = [100.0, 0.0, 240.0, 180.0];
        // The same hole at mosaic x=105: 35 px inside the left tile but
        // only 5 px inside the right one.
        let left = piece_with_points(left_extent, &[[105.0, 90.0]]);
        let mut right = piece_with_points(right_extent, &[[105.0, 90.0]]);
        right.points[0].x += 1.0; // slight disagreement
        right.points[0].peak = 0.5;

        let mut missing = Vec::new();
        let mut weak = Vec::new();
        let resolution = resolve_piece_positions(
            &[left, right],
            &[],
            &mut missing,
            &mut weak,
            &params(),
        );
        assert_eq!(resolution.points.len(), 1);
        assert_eq!(resolution.piece_index[0], Some(0));
        assert!((resolution.points[0].x - 105.0).abs() < 1e-6);
        assert_eq!(resolution.points[0].peak, 1.0);
    }

    #[test]
    fn tile_point_substitutes_a_matching_global_in_the_overlap() {
        let left_extent = [0.0, 0.0, 140.0, 180.0];
        let right_extent = [100.0, 0.0, 240.0, 180.0];
        // Tile point just inside the left tile's overlap zone.
        let left = piece_with_points(left_extent, &[[106.0, 90.0]]);
        let right = piece_with_points(right_extent, &[]);
        let global = [DetectedPoint {
            x: 104.0,
            y: 91.0,
            peak: 0.3,
        }];

        let mut missing = Vec::new();
        let mut weak = Vec::new();
        let resolution = resolve_piece_positions(
            &[left, right],
            &global,
            &mut missing,
            &mut weak,
            &params(),
        );
        assert_eq!(resolution.points.len(), 1);
        assert!((resolution.points[0].x - 106.0).abs() < 1e-6, "not substituted");
        assert_eq!(resolution.points[0].peak, 1.0);
        assert_eq!(resolution.piece_index[0], Some(0));
    }

    #[test]
    fn added_point_clears_nearby_missing_and_weak_entries() {
        let extent = [0.0, 0.0, 200.0, 200.0];
        let piece = piece_with_points(extent, &[[80.0, 80.0]]);
        let mut missing = vec![[82.0, 80.0], [150.0, 150.0]];
        let mut weak = vec![DetectedPoint {
            x: 79.0,
            y: 81.0,
            peak: 0.1,
        }];
        let resolution = resolve_piece_positions(
            &[piece],
            &[],
            &mut missing,
            &mut weak,
            &params(),
        );
        assert_eq!(resolution.points.len(), 1);
        assert_eq!(missing, vec![[150.0, 150.0]]);
        assert!(weak.is_empty());
    }

    #[test]
    fn unmatched_global_point_is_assigned_to_the_least_penetrating_tile() {
        let left_extent = [0.0, 0.0, 140.0, 180.0];
        let right_extent = [100.0, 0.0, 240.0, 180.0];
        let left = piece_with_points(left_extent, &[]);
        let right = piece_with_points(right_extent, &[]);
        let global = [
            DetectedPoint {
                x: 105.0,
                y: 90.0,
                peak: 1.0,
            },
            DetectedPoint {
                x: 200.0,
                y: 90.0,
                peak: 1.0,
            },
        ];
        let mut missing = Vec::new();
        let mut weak = Vec::new();
        let resolution = resolve_piece_positions(
            &[left, right],
            &global,
            &mut missing,
            &mut weak,
            &params(),
        );
        // x=105 penetrates the right tile's zone by 5/40 but the left
        // tile's by 35/40: the left tile owns it.
        assert_eq!(resolution.piece_index[0], Some(0));
        assert_eq!(resolution.piece_index[1], Some(1));
        assert_eq!(
            resolution.piece_coords[1],
            Some([100.0, 90.0])
        );
    }
}
