//! Averaged correlation templates built from confidently placed points.
//!
//! After a first synthetic-ring pass has located holes, averaging the image
//! (or edge mask) around the strongest detections yields a sharper kernel
//! for the next correlation pass.

use ndarray::Array2;

use crate::buffer::{bilinear, try_array2};
use crate::error::EngineResult;

/// An averaged real-space patch usable as a correlation kernel.
#[derive(Debug, Clone)]
pub(crate) struct AveragedTemplate {
    /// Square patch, zero-mean and border-tapered.
    pub(crate) data: Array2<f32>,
    /// Hole radius (working pixels) the patch was built around.
    pub(crate) radius: f32,
    /// Whether the patch came from raw intensity rather than the edge mask.
    pub(crate) from_intensity: bool,
    /// Set until the correlator rebuilds the frequency-domain transform.
    pub(crate) dirty: bool,
}

/// Width of the cosine taper applied to the patch border.
const TAPER_MARGIN: usize = 8;

/// Average sub-images of `source` around the strongest `count_to_average`
/// of the supplied working-coordinate points.
///
/// The box edge is about `1.8 * spacing / sqrt(2)`, rounded to an even
/// size and padded by 16 so the taper never eats into the hole itself.
pub(crate) fn build_averaged_template(
    source: &Array2<f32>,
    points: &[(f32, f32, f32)],
    count_to_average: usize,
    nominal_spacing: f32,
    radius: f32,
    from_intensity: bool,
) -> EngineResult<AveragedTemplate> {
    let mut box_size = (1.8 * nominal_spacing / std::f32::consts::SQRT_2).round() as usize;
    box_size += box_size % 2;
    box_size += 16;

    let mut strongest: Vec<&(f32, f32, f32)> = points.iter().collect();
    strongest.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
    strongest.truncate(count_to_average.max(1));

    // Integer center index: the hole center lands exactly on a pixel, so the
    // wraparound embedding of the patch introduces no sub-pixel bias.
    let mut acc = try_array2(box_size, box_size)?;
    let half = (box_size / 2) as f32;
    for &&(cx, cy, _) in &strongest {
        for y in 0..box_size {
            for x in 0..box_size {
                let sx = cx + x as f32 - half;
                let sy = cy + y as f32 - half;
                acc[[y, x]] += bilinear(source, sx, sy);
            }
        }
    }
    let scale = 1.0 / strongest.len() as f32;
    acc.mapv_inplace(|v| v * scale);

    // Zero-mean so the padded correlation carries no DC term.
    let mean = acc.iter().sum::<f32>() / (box_size * box_size) as f32;
    acc.mapv_inplace(|v| v - mean);

    apply_taper(&mut acc);

    Ok(AveragedTemplate {
        data: acc,
        radius,
        from_intensity,
        dirty: true,
    })
}

/// Separable raised-cosine taper toward zero over the border margin,
/// suppressing high-frequency wraparound artifacts.
fn apply_taper(patch: &mut Array2<f32>) {
    let (h, w) = patch.dim();
    let ramp = |i: usize, n: usize| -> f32 {
        let m = TAPER_MARGIN.min(n / 4).max(1);
        let d = i.min(n - 1 - i);
        if d >= m {
            1.0
        } else {
            let t = (d as f32 + 0.5) / m as f32;
            0.5 - 0.5 * (std::f32::consts::PI * t).cos()
        }
    };
    for y in 0..h {
        let wy = ramp(y, h);
        for x in 0..w {
            patch[[y, x]] *= wy * ramp(x, w);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disc_image(w: usize, h: usize, cx: f32, cy: f32, r: f32) -> Array2<f32> {
        let mut img = Array2::<f32>::from_elem((h, w), 200.0);
        for y in 0..h {
            for x in 0..w {
                let dx = x as f32 - cx;
                let dy = y as f32 - cy;
                if (dx * dx + dy * dy).sqrt() <= r {
                    img[[y, x]] = 40.0;
                }
            }
        }
        img
    }

    #[test]
    fn box_size_is_even_plus_padding() {
        let img = disc_image(128, 128, 64.0, 64.0, 8.0);
        let tpl =
            build_averaged_template(&img, &[(64.0, 64.0, 1.0)], 1, 32.0, 8.0, true).unwrap();
        let (h, w) = tpl.data.dim();
        assert_eq!(h, w);
        assert_eq!(h % 2, 0);
        // 1.8 * 32 / sqrt(2) ~= 40.7 -> 41 -> 42 even -> 58 padded.
        assert_eq!(h, 58);
        assert!(tpl.dirty);
    }

    #[test]
    fn taper_pulls_the_border_to_zero() {
        let img = disc_image(128, 128, 64.0, 64.0, 10.0);
        let tpl =
            build_averaged_template(&img, &[(64.0, 64.0, 1.0)], 1, 30.0, 10.0, true).unwrap();
        let (h, w) = tpl.data.dim();
        for x in 0..w {
            assert!(tpl.data[[0, x]].abs() < 1.0, "border not tapered at x={}", x);
            assert!(tpl.data[[h - 1, x]].abs() < 1.0);
        }
        // Interior keeps real contrast.
        let center = tpl.data[[h / 2, w / 2]];
        assert!(center.abs() > 10.0, "center lost contrast: {}", center);
    }

    #[test]
    fn averaging_uses_only_the_strongest_points() {
        let img = disc_image(160, 96, 40.0, 48.0, 8.0);
        // Second point sits on flat background; with count 1 only the
        // strongest (on the disc) contributes.
        let points = [(40.0, 48.0, 5.0), (120.0, 48.0, 1.0)];
        let tpl = build_averaged_template(&img, &points, 1, 24.0, 8.0, true).unwrap();
        let (h, w) = tpl.data.dim();
        let center = tpl.data[[h / 2, w / 2]];
        assert!(center < -40.0, "disc center should be dark: {}", center);
    }
}
