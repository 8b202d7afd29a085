//! Forward/inverse 2-D spectrum primitive and correlation products.
//!
//! The transform itself is a collaborator, not part of this engine: callers
//! may inject any implementation of [`SpectrumTransform`]. The default,
//! [`RustFftTransform`], decomposes the 2-D transform into row and column
//! passes over `rustfft` plans and parallelizes the independent lines.

use ndarray::Array2;
use rayon::prelude::*;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::{Arc, Mutex};

use crate::error::{EngineError, EngineResult};

/// Injected forward/inverse 2-D transform over padded real arrays.
pub trait SpectrumTransform: Send + Sync {
    /// Forward transform of a padded real array into its complex spectrum.
    fn forward(&self, data: &Array2<f32>) -> EngineResult<Array2<Complex<f32>>>;

    /// Inverse transform back to a real array of the same dimensions.
    fn inverse(&self, spectrum: &Array2<Complex<f32>>) -> EngineResult<Array2<f32>>;
}

/// Default transform backed by `rustfft` row/column plans.
pub struct RustFftTransform {
    planner: Mutex<FftPlanner<f32>>,
}

impl RustFftTransform {
    /// Create a transform with an empty plan cache.
    pub fn new() -> Self {
        Self {
            planner: Mutex::new(FftPlanner::new()),
        }
    }

    fn plan(&self, len: usize, forward: bool) -> Arc<dyn Fft<f32>> {
        let mut planner = self
            .planner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if forward {
            planner.plan_fft_forward(len)
        } else {
            planner.plan_fft_inverse(len)
        }
    }

    fn transform_2d(
        &self,
        mut buf: Vec<Complex<f32>>,
        ny: usize,
        nx: usize,
        forward: bool,
    ) -> EngineResult<Vec<Complex<f32>>> {
        let row_fft = self.plan(nx, forward);
        process_lines(&row_fft, &mut buf, nx);

        let mut transposed = try_complex_vec(nx * ny)?;
        transposed.resize(nx * ny, Complex::new(0.0, 0.0));
        for y in 0..ny {
            for x in 0..nx {
                transposed[x * ny + y] = buf[y * nx + x];
            }
        }

        let col_fft = self.plan(ny, forward);
        process_lines(&col_fft, &mut transposed, ny);

        for x in 0..nx {
            for y in 0..ny {
                buf[y * nx + x] = transposed[x * ny + y];
            }
        }
        Ok(buf)
    }
}

impl Default for RustFftTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumTransform for RustFftTransform {
    fn forward(&self, data: &Array2<f32>) -> EngineResult<Array2<Complex<f32>>> {
        let (ny, nx) = data.dim();
        let mut buf = try_complex_vec(ny * nx)?;
        buf.extend(data.iter().map(|&v| Complex::new(v, 0.0)));
        let buf = self.transform_2d(buf, ny, nx, true)?;
        Ok(Array2::from_shape_vec((ny, nx), buf).expect("shape matches length"))
    }

    fn inverse(&self, spectrum: &Array2<Complex<f32>>) -> EngineResult<Array2<f32>> {
        let (ny, nx) = spectrum.dim();
        let mut buf = try_complex_vec(ny * nx)?;
        buf.extend(spectrum.iter().copied());
        let buf = self.transform_2d(buf, ny, nx, false)?;
        let scale = 1.0 / (ny * nx) as f32;
        let out: Vec<f32> = buf.iter().map(|c| c.re * scale).collect();
        Ok(Array2::from_shape_vec((ny, nx), out).expect("shape matches length"))
    }
}

fn process_lines(fft: &Arc<dyn Fft<f32>>, buf: &mut [Complex<f32>], len: usize) {
    let scratch_len = fft.get_inplace_scratch_len();
    buf.par_chunks_mut(len).for_each_init(
        || vec![Complex::new(0.0f32, 0.0); scratch_len],
        |scratch, line| fft.process_with_scratch(line, scratch),
    );
}

fn try_complex_vec(len: usize) -> EngineResult<Vec<Complex<f32>>> {
    let mut v: Vec<Complex<f32>> = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| EngineError::AllocationFailure {
            requested_bytes: len * std::mem::size_of::<Complex<f32>>(),
        })?;
    Ok(v)
}

/// Conjugate product `image * conj(template)`, the spectrum of the
/// cross-correlation surface.
pub(crate) fn conjugate_product(
    image: &Array2<Complex<f32>>,
    template: &Array2<Complex<f32>>,
) -> Array2<Complex<f32>> {
    let mut out = image.clone();
    out.zip_mut_with(template, |a, &t| *a *= t.conj());
    out
}
