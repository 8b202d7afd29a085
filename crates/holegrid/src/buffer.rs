//! Input conversion, working-image reduction, and padded buffer management.
//!
//! The engine is stateful for exactly one reason: the padded correlation
//! buffers are expensive to allocate and transform, so they are reused across
//! calls and re-allocated only when the image or pad dimensions change.

use ndarray::Array2;

use crate::error::{EngineError, EngineResult};

/// Normalized single-channel input samples.
///
/// Construction converts the supported sample formats (byte, 16-bit integer,
/// float) into `f32`; anything else is rejected with
/// [`EngineError::UnsupportedPixelFormat`].
#[derive(Debug, Clone)]
pub struct GraySamples {
    data: Vec<f32>,
    width: usize,
    height: usize,
}

impl GraySamples {
    fn checked(data: Vec<f32>, width: usize, height: usize) -> EngineResult<Self> {
        if width == 0 || height == 0 || data.len() != width * height {
            return Err(EngineError::InvalidReductionGeometry {
                width,
                height,
                reduction: 1.0,
            });
        }
        Ok(Self {
            data,
            width,
            height,
        })
    }

    /// Build from 8-bit samples.
    pub fn from_bytes(pixels: &[u8], width: usize, height: usize) -> EngineResult<Self> {
        let mut data = try_collect_f32(pixels.len())?;
        data.extend(pixels.iter().map(|&p| p as f32));
        Self::checked(data, width, height)
    }

    /// Build from unsigned 16-bit samples.
    pub fn from_u16(pixels: &[u16], width: usize, height: usize) -> EngineResult<Self> {
        let mut data = try_collect_f32(pixels.len())?;
        data.extend(pixels.iter().map(|&p| p as f32));
        Self::checked(data, width, height)
    }

    /// Build from signed 16-bit samples.
    pub fn from_i16(pixels: &[i16], width: usize, height: usize) -> EngineResult<Self> {
        let mut data = try_collect_f32(pixels.len())?;
        data.extend(pixels.iter().map(|&p| p as f32));
        Self::checked(data, width, height)
    }

    /// Build from float samples.
    pub fn from_f32(pixels: &[f32], width: usize, height: usize) -> EngineResult<Self> {
        let mut data = try_collect_f32(pixels.len())?;
        data.extend_from_slice(pixels);
        Self::checked(data, width, height)
    }

    /// Build from a decoded image, accepting only single-channel variants.
    pub fn from_dynamic(img: &image::DynamicImage) -> EngineResult<Self> {
        use image::DynamicImage;
        match img {
            DynamicImage::ImageLuma8(g) => {
                Self::from_bytes(g.as_raw(), g.width() as usize, g.height() as usize)
            }
            DynamicImage::ImageLuma16(g) => {
                Self::from_u16(g.as_raw(), g.width() as usize, g.height() as usize)
            }
            DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => {
                Err(EngineError::UnsupportedPixelFormat { format: "rgb" })
            }
            DynamicImage::ImageRgb16(_) | DynamicImage::ImageRgba16(_) => {
                Err(EngineError::UnsupportedPixelFormat { format: "rgb16" })
            }
            DynamicImage::ImageLumaA8(_) | DynamicImage::ImageLumaA16(_) => {
                Err(EngineError::UnsupportedPixelFormat { format: "luma+alpha" })
            }
            _ => Err(EngineError::UnsupportedPixelFormat { format: "other" }),
        }
    }

    /// Image width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Image height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    pub(crate) fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

fn try_collect_f32(len: usize) -> EngineResult<Vec<f32>> {
    let mut v: Vec<f32> = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| EngineError::AllocationFailure {
            requested_bytes: len * std::mem::size_of::<f32>(),
        })?;
    Ok(v)
}

/// Allocate a zeroed `f32` array, surfacing failure as a result code.
pub(crate) fn try_array2(ny: usize, nx: usize) -> EngineResult<Array2<f32>> {
    let len = ny * nx;
    let mut v = try_collect_f32(len)?;
    v.resize(len, 0.0);
    Ok(Array2::from_shape_vec((ny, nx), v).expect("shape matches length"))
}

/// Reduced working copy of the input plus its mapping back to original
/// pixel coordinates.
#[derive(Debug, Clone)]
pub struct WorkingImage {
    pub(crate) data: Array2<f32>,
    reduction: f32,
    x_offset: f64,
    y_offset: f64,
}

impl WorkingImage {
    /// Build the working image, optionally reducing with an anti-aliasing
    /// pre-filter when `reduction > 1`.
    pub(crate) fn build(samples: &GraySamples, reduction: f32) -> EngineResult<Self> {
        if !reduction.is_finite() || reduction < 1.0 {
            return Err(EngineError::InvalidReductionGeometry {
                width: samples.width(),
                height: samples.height(),
                reduction,
            });
        }
        let rw = (samples.width() as f32 / reduction).floor() as usize;
        let rh = (samples.height() as f32 / reduction).floor() as usize;
        if rw < 8 || rh < 8 {
            return Err(EngineError::InvalidReductionGeometry {
                width: samples.width(),
                height: samples.height(),
                reduction,
            });
        }

        let mut data = try_array2(samples.height(), samples.width())?;
        data.as_slice_mut()
            .expect("standard layout")
            .copy_from_slice(samples.as_slice());

        if reduction > 1.0 + 1e-6 {
            // Anti-alias before sub-sampling; sigma grows with the factor.
            let sigma = 0.5 * (reduction - 1.0);
            if sigma > 0.05 {
                data = gaussian_smooth(&data, sigma)?;
            }
            let mut reduced = try_array2(rh, rw)?;
            for y in 0..rh {
                for x in 0..rw {
                    let sx = (x as f32 + 0.5) * reduction - 0.5;
                    let sy = (y as f32 + 0.5) * reduction - 0.5;
                    reduced[[y, x]] = bilinear(&data, sx, sy);
                }
            }
            // Centers of reduced pixel (0,0) map back to (reduction-1)/2.
            let off = (reduction as f64 - 1.0) * 0.5;
            Ok(Self {
                data: reduced,
                reduction,
                x_offset: off,
                y_offset: off,
            })
        } else {
            Ok(Self {
                data,
                reduction: 1.0,
                x_offset: 0.0,
                y_offset: 0.0,
            })
        }
    }

    /// Working-image dimensions as `(height, width)`.
    pub fn dims(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// Reduction factor relative to the original image.
    pub fn reduction(&self) -> f32 {
        self.reduction
    }

    /// Map working coordinates to original-image pixels.
    pub fn to_original(&self, x: f64, y: f64) -> [f64; 2] {
        [
            x * self.reduction as f64 + self.x_offset,
            y * self.reduction as f64 + self.y_offset,
        ]
    }

    /// Map original-image pixels to working coordinates.
    pub fn to_working(&self, x: f64, y: f64) -> [f64; 2] {
        [
            (x - self.x_offset) / self.reduction as f64,
            (y - self.y_offset) / self.reduction as f64,
        ]
    }

    /// Original-image extent covered by the working image, `[x0, y0, x1, y1]`.
    pub fn original_extent(&self) -> [f64; 4] {
        let (h, w) = self.dims();
        let lo = self.to_original(-0.5, -0.5);
        let hi = self.to_original(w as f64 - 0.5, h as f64 - 0.5);
        [lo[0], lo[1], hi[0], hi[1]]
    }

    pub(crate) fn mean(&self) -> f32 {
        let n = self.data.len().max(1) as f64;
        (self.data.iter().map(|&v| v as f64).sum::<f64>() / n) as f32
    }
}

/// Bilinear sample with edge clamping.
pub(crate) fn bilinear(data: &Array2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = data.dim();
    let xc = x.clamp(0.0, (w - 1) as f32);
    let yc = y.clamp(0.0, (h - 1) as f32);
    let x0 = xc.floor() as usize;
    let y0 = yc.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = xc - x0 as f32;
    let fy = yc - y0 as f32;
    let top = data[[y0, x0]] * (1.0 - fx) + data[[y0, x1]] * fx;
    let bot = data[[y1, x0]] * (1.0 - fx) + data[[y1, x1]] * fx;
    top * (1.0 - fy) + bot * fy
}

/// Separable Gaussian smoothing with edge clamping.
pub(crate) fn gaussian_smooth(data: &Array2<f32>, sigma: f32) -> EngineResult<Array2<f32>> {
    let (h, w) = data.dim();
    let radius = (3.0 * sigma).ceil().max(1.0) as usize;
    let mut kernel = Vec::with_capacity(2 * radius + 1);
    let s2 = 2.0 * sigma * sigma;
    for i in 0..=2 * radius {
        let d = i as f32 - radius as f32;
        kernel.push((-d * d / s2).exp());
    }
    let norm: f32 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= norm;
    }

    let mut tmp = try_array2(h, w)?;
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (i, &k) in kernel.iter().enumerate() {
                let sx = (x as isize + i as isize - radius as isize).clamp(0, w as isize - 1);
                acc += k * data[[y, sx as usize]];
            }
            tmp[[y, x]] = acc;
        }
    }
    let mut out = try_array2(h, w)?;
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0f32;
            for (i, &k) in kernel.iter().enumerate() {
                let sy = (y as isize + i as isize - radius as isize).clamp(0, h as isize - 1);
                acc += k * tmp[[sy as usize, x]];
            }
            out[[y, x]] = acc;
        }
    }
    Ok(out)
}

/// Smallest 5-smooth integer `>= n`, so the transform stays on fast paths.
pub(crate) fn fft_friendly_size(n: usize) -> usize {
    let mut candidate = n.max(8);
    loop {
        let mut m = candidate;
        for p in [2usize, 3, 5] {
            while m % p == 0 {
                m /= p;
            }
        }
        if m == 1 {
            return candidate;
        }
        candidate += 1;
    }
}

/// Padded dimension for one working axis: room for the largest tested radius
/// on both sides so no correlation wraps around.
pub(crate) fn padded_dim(size: usize, max_radius: f32) -> usize {
    let margin = 2 * (max_radius.ceil() as usize) + 4;
    fft_friendly_size(2 * (size / 2) + margin)
}
