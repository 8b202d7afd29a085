//! Block-based extraction of well-separated correlation maxima.

use ndarray::Array2;
use rayon::prelude::*;

/// A correlation peak in working-image coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Peak {
    pub x: f32,
    pub y: f32,
    pub strength: f32,
}

/// Find local maxima of the correlation surface separated by at least
/// `min_spacing`, restricted to the unpadded working region.
///
/// The surface is tiled into `min_spacing`-sized blocks; each block maximum
/// is kept only if no larger value lies within `min_spacing` (ties go to the
/// smaller row-major index). Block results are merged in block order so the
/// output is deterministic regardless of worker count.
pub(crate) fn find_spaced_peaks(
    corr: &Array2<f32>,
    work_dims: (usize, usize),
    min_spacing: f32,
) -> Vec<Peak> {
    let (wh, ww) = work_dims;
    let spacing = min_spacing.max(1.0);
    let block = spacing.floor().max(1.0) as usize;
    let blocks_x = ww.div_ceil(block);
    let blocks_y = wh.div_ceil(block);

    let candidates: Vec<Peak> = (0..blocks_y * blocks_x)
        .into_par_iter()
        .filter_map(|bi| {
            let by = bi / blocks_x;
            let bx = bi % blocks_x;
            let y0 = by * block;
            let x0 = bx * block;
            let y1 = (y0 + block).min(wh);
            let x1 = (x0 + block).min(ww);

            let mut best: Option<(usize, usize, f32)> = None;
            for y in y0..y1 {
                for x in x0..x1 {
                    let v = corr[[y, x]];
                    if v > 0.0 && best.map_or(true, |b| v > b.2) {
                        best = Some((y, x, v));
                    }
                }
            }
            let (py, px, pv) = best?;
            is_spaced_maximum(corr, work_dims, py, px, pv, spacing).then(|| {
                let (sx, sy) = subpixel_offset(corr, py, px);
                Peak {
                    x: px as f32 + sx,
                    y: py as f32 + sy,
                    strength: pv,
                }
            })
        })
        .collect();

    let mut peaks = candidates;
    peaks.sort_by(|a, b| b.strength.partial_cmp(&a.strength).unwrap_or(std::cmp::Ordering::Equal));
    peaks
}

fn is_spaced_maximum(
    corr: &Array2<f32>,
    work_dims: (usize, usize),
    py: usize,
    px: usize,
    pv: f32,
    spacing: f32,
) -> bool {
    let (wh, ww) = work_dims;
    let r = spacing.ceil() as isize;
    let idx = py * ww + px;
    let y_lo = (py as isize - r).max(0) as usize;
    let y_hi = ((py as isize + r) as usize).min(wh - 1);
    let x_lo = (px as isize - r).max(0) as usize;
    let x_hi = ((px as isize + r) as usize).min(ww - 1);
    let r2 = spacing * spacing;
    for y in y_lo..=y_hi {
        for x in x_lo..=x_hi {
            let dy = y as f32 - py as f32;
            let dx = x as f32 - px as f32;
            if dy * dy + dx * dx > r2 {
                continue;
            }
            let v = corr[[y, x]];
            if v > pv || (v == pv && y * ww + x < idx) {
                return false;
            }
        }
    }
    true
}

/// Parabolic sub-pixel vertex offset along each axis, clamped to half a
/// pixel.
fn subpixel_offset(corr: &Array2<f32>, py: usize, px: usize) -> (f32, f32) {
    let (h, w) = corr.dim();
    let axis = |l: f32, c: f32, r: f32| -> f32 {
        let denom = l + r - 2.0 * c;
        if denom.abs() < 1e-12 {
            0.0
        } else {
            ((l - r) / (2.0 * denom)).clamp(-0.5, 0.5)
        }
    };
    let sx = if px > 0 && px + 1 < w {
        axis(corr[[py, px - 1]], corr[[py, px]], corr[[py, px + 1]])
    } else {
        0.0
    };
    let sy = if py > 0 && py + 1 < h {
        axis(corr[[py - 1, px]], corr[[py, px]], corr[[py + 1, px]])
    } else {
        0.0
    };
    (sx, sy)
}

/// Even-odd test for a point inside a polygon (original-image coordinates).
pub(crate) fn point_in_polygon(x: f64, y: f64, polygon: &[[f64; 2]]) -> bool {
    let n = polygon.len();
    if n < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = n - 1;
    for i in 0..n {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
            inside = !inside;
        }
        j = i;
    }
    inside
}
