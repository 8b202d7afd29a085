//! Shared synthetic-image helpers for unit tests.
//!
//! Consolidated here so every module draws its test lattices the same way.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::buffer::GraySamples;

/// Render a grid of dark circular holes on a bright background.
///
/// Holes are discs of `radius` at `origin + (col, row) * spacing` with a
/// one-pixel soft edge. `noise` adds uniform noise of the given half-range
/// from a seeded generator, so tests stay reproducible.
pub(crate) fn draw_hole_lattice(
    width: usize,
    height: usize,
    origin: [f32; 2],
    spacing: f32,
    rows: usize,
    cols: usize,
    radius: f32,
    noise: Option<(f32, u64)>,
) -> GraySamples {
    const BG: f32 = 200.0;
    const HOLE: f32 = 40.0;

    let mut data = vec![BG; width * height];
    for r in 0..rows {
        for c in 0..cols {
            let cx = origin[0] + c as f32 * spacing;
            let cy = origin[1] + r as f32 * spacing;
            let x0 = ((cx - radius - 2.0).floor().max(0.0)) as usize;
            let x1 = ((cx + radius + 2.0).ceil().min(width as f32 - 1.0)) as usize;
            let y0 = ((cy - radius - 2.0).floor().max(0.0)) as usize;
            let y1 = ((cy + radius + 2.0).ceil().min(height as f32 - 1.0)) as usize;
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    let d = (dx * dx + dy * dy).sqrt();
                    // Coverage ramps from 1 inside to 0 outside over one pixel.
                    let coverage = (radius + 0.5 - d).clamp(0.0, 1.0);
                    let idx = y * width + x;
                    data[idx] = data[idx].min(BG + (HOLE - BG) * coverage);
                }
            }
        }
    }

    if let Some((amplitude, seed)) = noise {
        let mut rng = StdRng::seed_from_u64(seed);
        for v in data.iter_mut() {
            *v += rng.gen_range(-amplitude..amplitude);
        }
    }

    GraySamples::from_f32(&data, width, height).expect("synthetic image dimensions are valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn holes_are_dark_and_background_bright() {
        let samples = draw_hole_lattice(64, 64, [32.0, 32.0], 64.0, 1, 1, 8.0, None);
        let data = samples.as_slice();
        assert!(data[32 * 64 + 32] < 50.0);
        assert!(data[5 * 64 + 5] > 190.0);
    }

    #[test]
    fn seeded_noise_is_reproducible() {
        let a = draw_hole_lattice(32, 32, [16.0, 16.0], 32.0, 1, 1, 5.0, Some((4.0, 7)));
        let b = draw_hole_lattice(32, 32, [16.0, 16.0], 32.0, 1, 1, 5.0, Some((4.0, 7)));
        assert_eq!(a.as_slice(), b.as_slice());
    }
}
