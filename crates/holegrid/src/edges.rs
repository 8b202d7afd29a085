//! Canny-style edge classification over the working image.
//!
//! Smoothing, gradient, and non-maximum suppression are data-parallel maps
//! over rows: each output row reads a fixed neighborhood of the input only,
//! so correctness does not depend on worker count. Strong-edge seeds are
//! collected after the parallel region in row-major order so the hysteresis
//! queue is deterministic.

use ndarray::Array2;
use rayon::prelude::*;

use crate::buffer::{gaussian_smooth, try_array2};
use crate::error::EngineResult;

/// Per-pixel edge classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EdgeClass {
    /// Not an edge.
    None = 0,
    /// Below the high threshold but locally maximal.
    Weak = 1,
    /// Above the high threshold or linked to a strong pixel.
    Strong = 2,
}

/// Classified edge image. The gradient-direction map is consumed during
/// suppression and not retained.
#[derive(Debug, Clone)]
pub(crate) struct EdgeMap {
    pub(crate) class: Array2<u8>,
    pub(crate) border: usize,
}

impl EdgeMap {
    /// Edge mask as floats: strong pixels are 1, weak optionally included.
    pub(crate) fn mask(&self, include_weak: bool) -> Array2<f32> {
        self.class.mapv(|c| {
            if c == EdgeClass::Strong as u8 || (include_weak && c == EdgeClass::Weak as u8) {
                1.0
            } else {
                0.0
            }
        })
    }
}

/// Summary of one edge-detection call.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EdgeStats {
    /// Strong pixels after hysteresis.
    pub strong: usize,
    /// Weak pixels remaining after hysteresis.
    pub weak: usize,
    /// Gradient-magnitude value of the low cut.
    pub low_threshold: f32,
    /// Gradient-magnitude value of the high cut.
    pub high_threshold: f32,
}

/// Smoothed-image cache keyed by the exact smoothing parameter.
#[derive(Debug, Clone)]
pub(crate) struct SmoothCache {
    key: f32,
    data: Array2<f32>,
}

const HISTOGRAM_BINS: usize = 1000;

/// Detect edges on the working image.
///
/// A positive `sigma_or_iterations` selects a Gaussian of that sigma; a
/// non-positive value selects that many passes of a 3x3 median filter.
/// `low_kept_frac` / `high_kept_frac` are the fractions of all gradient
/// pixels that fall below the low / high magnitude cuts.
pub(crate) fn detect_edges(
    work: &Array2<f32>,
    cache: &mut Option<SmoothCache>,
    sigma_or_iterations: f32,
    low_kept_frac: f32,
    high_kept_frac: f32,
) -> EngineResult<(EdgeMap, EdgeStats)> {
    let smoothed = smoothed_image(work, cache, sigma_or_iterations)?;
    let (h, w) = smoothed.dim();
    let border = smoothing_radius(sigma_or_iterations) + 1;

    let (mag, dir) = gradient(smoothed);

    let (low_threshold, high_threshold) =
        histogram_thresholds(&mag, low_kept_frac, high_kept_frac);

    let mut class = suppress_and_classify(&mag, &dir, w, h, low_threshold, high_threshold);

    clear_border(&mut class, w, h, border);
    link_hysteresis(&mut class, w, h);

    let mut strong = 0usize;
    let mut weak = 0usize;
    for &c in class.iter() {
        if c == EdgeClass::Strong as u8 {
            strong += 1;
        } else if c == EdgeClass::Weak as u8 {
            weak += 1;
        }
    }

    let class = Array2::from_shape_vec((h, w), class).expect("shape matches length");
    Ok((
        EdgeMap { class, border },
        EdgeStats {
            strong,
            weak,
            low_threshold,
            high_threshold,
        },
    ))
}

/// Effective smoothing kernel radius, also the edge-artifact border width.
fn smoothing_radius(sigma_or_iterations: f32) -> usize {
    if sigma_or_iterations > 0.0 {
        (3.0 * sigma_or_iterations).ceil() as usize
    } else {
        median_passes(sigma_or_iterations)
    }
}

fn median_passes(sigma_or_iterations: f32) -> usize {
    (-sigma_or_iterations).round().max(0.0) as usize
}

fn smoothed_image<'a>(
    work: &Array2<f32>,
    cache: &'a mut Option<SmoothCache>,
    sigma_or_iterations: f32,
) -> EngineResult<&'a Array2<f32>> {
    let reuse = cache
        .as_ref()
        .is_some_and(|c| c.key.to_bits() == sigma_or_iterations.to_bits());
    if !reuse {
        let data = if sigma_or_iterations > 0.0 {
            gaussian_smooth(work, sigma_or_iterations)?
        } else {
            let mut data = work.clone();
            for _ in 0..median_passes(sigma_or_iterations) {
                data = median3x3(&data)?;
            }
            data
        };
        *cache = Some(SmoothCache {
            key: sigma_or_iterations,
            data,
        });
    }
    Ok(&cache.as_ref().expect("cache just filled").data)
}

/// One pass of a 3x3 median filter with edge clamping.
fn median3x3(data: &Array2<f32>) -> EngineResult<Array2<f32>> {
    let (h, w) = data.dim();
    let src = data.as_slice().expect("standard layout");
    let mut out = try_array2(h, w)?;
    out.as_slice_mut()
        .expect("standard layout")
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, row)| {
            let mut window = [0f32; 9];
            for (x, out_px) in row.iter_mut().enumerate() {
                let mut k = 0;
                for dy in -1i32..=1 {
                    for dx in -1i32..=1 {
                        let sy = (y as i32 + dy).clamp(0, h as i32 - 1) as usize;
                        let sx = (x as i32 + dx).clamp(0, w as i32 - 1) as usize;
                        window[k] = src[sy * w + sx];
                        k += 1;
                    }
                }
                window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                *out_px = window[4];
            }
        });
    Ok(out)
}

/// 3x3 separable gradient: magnitude and direction quantized to four
/// sectors (0, 45, 90, 135 degrees).
fn gradient(smoothed: &Array2<f32>) -> (Vec<f32>, Vec<u8>) {
    let (h, w) = smoothed.dim();
    let src = smoothed.as_slice().expect("standard layout");
    let mut mag = vec![0f32; h * w];
    let mut dir = vec![0u8; h * w];

    mag.par_chunks_mut(w)
        .zip(dir.par_chunks_mut(w))
        .enumerate()
        .for_each(|(y, (mag_row, dir_row))| {
            if y == 0 || y + 1 >= h {
                return;
            }
            let above = &src[(y - 1) * w..y * w];
            let here = &src[y * w..(y + 1) * w];
            let below = &src[(y + 1) * w..(y + 2) * w];
            for x in 1..w - 1 {
                let gx = (above[x + 1] + 2.0 * here[x + 1] + below[x + 1])
                    - (above[x - 1] + 2.0 * here[x - 1] + below[x - 1]);
                let gy = (below[x - 1] + 2.0 * below[x] + below[x + 1])
                    - (above[x - 1] + 2.0 * above[x] + above[x + 1]);
                mag_row[x] = (gx * gx + gy * gy).sqrt();
                dir_row[x] = quantize_direction(gx, gy);
            }
        });

    (mag, dir)
}

fn quantize_direction(gx: f32, gy: f32) -> u8 {
    let mut angle = gy.atan2(gx).to_degrees();
    if angle < 0.0 {
        angle += 180.0;
    }
    if !(22.5..157.5).contains(&angle) {
        0 // gradient along x
    } else if angle < 67.5 {
        1 // 45 degrees
    } else if angle < 112.5 {
        2 // gradient along y
    } else {
        3 // 135 degrees
    }
}

/// Convert kept fractions into magnitude thresholds via a fixed-bin
/// histogram of all gradient magnitudes.
fn histogram_thresholds(mag: &[f32], low_kept_frac: f32, high_kept_frac: f32) -> (f32, f32) {
    let max_mag = mag.iter().cloned().fold(0.0f32, f32::max);
    if max_mag <= 0.0 {
        return (0.0, 0.0);
    }
    let mut counts = vec![0usize; HISTOGRAM_BINS];
    let scale = (HISTOGRAM_BINS - 1) as f32 / max_mag;
    for &m in mag {
        counts[(m * scale) as usize] += 1;
    }
    let total = mag.len();
    let low_target = (low_kept_frac.clamp(0.0, 1.0) as f64 * total as f64) as usize;
    let high_target = (high_kept_frac.clamp(0.0, 1.0) as f64 * total as f64) as usize;

    let mut cumulative = 0usize;
    let mut low = max_mag;
    let mut high = max_mag;
    let mut low_found = false;
    let mut high_found = false;
    for (bin, &c) in counts.iter().enumerate() {
        cumulative += c;
        let edge = (bin + 1) as f32 / scale;
        if !low_found && cumulative >= low_target {
            low = edge;
            low_found = true;
        }
        if !high_found && cumulative >= high_target {
            high = edge;
            high_found = true;
            break;
        }
    }
    (low.min(high), high)
}

/// Non-maximum suppression plus dual-threshold classification.
fn suppress_and_classify(
    mag: &[f32],
    dir: &[u8],
    w: usize,
    h: usize,
    low: f32,
    high: f32,
) -> Vec<u8> {
    let mut class = vec![EdgeClass::None as u8; w * h];
    class
        .par_chunks_mut(w)
        .enumerate()
        .for_each(|(y, class_row)| {
            if y == 0 || y + 1 >= h {
                return;
            }
            for (x, out) in class_row.iter_mut().enumerate().take(w - 1).skip(1) {
                let idx = y * w + x;
                let m = mag[idx];
                if m <= low {
                    continue;
                }
                let (n1, n2) = match dir[idx] {
                    0 => (mag[idx - 1], mag[idx + 1]),
                    1 => (mag[idx - w - 1], mag[idx + w + 1]),
                    2 => (mag[idx - w], mag[idx + w]),
                    _ => (mag[idx - w + 1], mag[idx + w - 1]),
                };
                if m > n1 && m >= n2 {
                    *out = if m >= high {
                        // Isolated strong pixels are demoted to weak.
                        if has_neighbor_above(mag, w, idx, low) {
                            EdgeClass::Strong as u8
                        } else {
                            EdgeClass::Weak as u8
                        }
                    } else {
                        EdgeClass::Weak as u8
                    };
                }
            }
        });
    class
}

fn has_neighbor_above(mag: &[f32], w: usize, idx: usize, low: f32) -> bool {
    let offsets = [
        idx - w - 1,
        idx - w,
        idx - w + 1,
        idx - 1,
        idx + 1,
        idx + w - 1,
        idx + w,
        idx + w + 1,
    ];
    offsets.iter().any(|&n| mag[n] > low)
}

fn clear_border(class: &mut [u8], w: usize, h: usize, border: usize) {
    let b = border.min(w / 2).min(h / 2);
    for y in 0..h {
        for x in 0..w {
            if y < b || y + b >= h || x < b || x + b >= w {
                class[y * w + x] = EdgeClass::None as u8;
            }
        }
    }
}

/// Work-queue hysteresis: weak pixels 8-connected to a strong pixel are
/// promoted until the queue drains. Seeds are enqueued in row-major order.
fn link_hysteresis(class: &mut [u8], w: usize, h: usize) {
    let mut queue: std::collections::VecDeque<usize> = class
        .iter()
        .enumerate()
        .filter_map(|(i, &c)| (c == EdgeClass::Strong as u8).then_some(i))
        .collect();

    while let Some(idx) = queue.pop_front() {
        let y = idx / w;
        let x = idx % w;
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if dy == 0 && dx == 0 {
                    continue;
                }
                let ny = y as i32 + dy;
                let nx = x as i32 + dx;
                if ny < 0 || nx < 0 || ny >= h as i32 || nx >= w as i32 {
                    continue;
                }
                let nidx = ny as usize * w + nx as usize;
                if class[nidx] == EdgeClass::Weak as u8 {
                    class[nidx] = EdgeClass::Strong as u8;
                    queue.push_back(nidx);
                }
            }
        }
    }
}
