//! The stateful hole-finding engine.
//!
//! [`HoleFinder`] owns every long-lived buffer and cache with explicit
//! invalidation rules: re-initializing with a new image clears everything
//! except the reusable outlier cutoffs (montage tiles share them), a changed
//! image size additionally evicts ring templates, and a smoothing-parameter
//! change clears only the edge-derived caches. One engine instance runs one
//! pipeline at a time; independent instances are fully parallel.

use ndarray::Array2;
use rustfft::num_complex::Complex;

use crate::buffer::{padded_dim, GraySamples, WorkingImage};
use crate::config::{CacheFlags, CircleSearchParams, InitParams};
use crate::correlate::{
    embed_centered, embed_image, find_spaced_peaks, match_alternates, point_in_polygon,
    prune_candidates, ring_template, scan_radii, CircleFinding, Peak, TemplateCache,
};
use crate::edges::{detect_edges, EdgeMap, EdgeStats, SmoothCache};
use crate::error::{EngineError, EngineResult};
use crate::spectrum::{conjugate_product, RustFftTransform, SpectrumTransform};
use crate::stats::{self, region_stats, CutoffRange, OutlierCounts, RegionStats};
use crate::template::{build_averaged_template, AveragedTemplate};
use crate::DetectedPoint;

/// How many dark-side standard deviations below the working-image mean a
/// pixel must sit to count as a dark outlier in region statistics.
const DARK_OUTLIER_SIGMA: f32 = 2.5;

struct EngineState {
    work: WorkingImage,
    source_dims: (usize, usize),
    pad: (usize, usize),
    cache_flags: CacheFlags,
    work_mean: f32,
    work_sd: f32,
    smooth: Option<SmoothCache>,
    edges: Option<EdgeMap>,
    /// Forward transform of the edge mask, keyed by weak-edge inclusion.
    edge_spectrum: Option<(bool, Array2<Complex<f32>>)>,
    /// Forward transform of the mean-subtracted working intensity.
    intensity_spectrum: Option<Array2<Complex<f32>>>,
    templates: TemplateCache,
    averaged: Option<AveragedTemplate>,
    averaged_spectrum: Option<Array2<Complex<f32>>>,
    last_best_radius: Option<f32>,
    cutoffs: Option<CutoffRange>,
}

/// Stateful aperture-detection engine for one image at a time.
pub struct HoleFinder {
    transform: Box<dyn SpectrumTransform>,
    state: Option<EngineState>,
}

impl Default for HoleFinder {
    fn default() -> Self {
        Self::new()
    }
}

impl HoleFinder {
    /// Engine with the default `rustfft`-backed transform.
    pub fn new() -> Self {
        Self::with_transform(Box::new(RustFftTransform::new()))
    }

    /// Engine with a caller-supplied transform primitive.
    pub fn with_transform(transform: Box<dyn SpectrumTransform>) -> Self {
        Self {
            transform,
            state: None,
        }
    }

    /// Prepare the engine for one image: build the reduced working copy and
    /// the padded correlation geometry, reusing buffers where dimensions
    /// allow.
    pub fn initialize(&mut self, samples: &GraySamples, params: &InitParams) -> EngineResult<()> {
        let work = WorkingImage::build(samples, params.reduction)?;
        let (wh, ww) = work.dims();
        let max_radius_working = params.max_radius / work.reduction();
        let pad = (
            padded_dim(wh, max_radius_working),
            padded_dim(ww, max_radius_working),
        );

        let n = (wh * ww).max(1) as f64;
        let mean = work.mean();
        let var = work
            .data
            .iter()
            .map(|&v| {
                let d = (v - mean) as f64;
                d * d
            })
            .sum::<f64>()
            / n;

        // Cutoffs survive re-initialization so montage tiles can reuse the
        // full-image values; templates survive only while the padded size
        // (and with it every template's embedding) is unchanged.
        let previous = self.state.take();
        let (templates, cutoffs) = match previous {
            Some(old) if old.pad == pad => (old.templates, old.cutoffs),
            Some(old) => (TemplateCache::new(), old.cutoffs),
            None => (TemplateCache::new(), None),
        };

        self.state = Some(EngineState {
            source_dims: (samples.height(), samples.width()),
            pad,
            cache_flags: params.cache,
            work_mean: mean,
            work_sd: (var.sqrt()) as f32,
            smooth: None,
            edges: None,
            edge_spectrum: None,
            intensity_spectrum: None,
            templates,
            averaged: None,
            averaged_spectrum: None,
            last_best_radius: None,
            cutoffs,
            work,
        });
        Ok(())
    }

    fn state(&self) -> EngineResult<&EngineState> {
        self.state.as_ref().ok_or(EngineError::NotInitialized)
    }

    fn state_mut(&mut self) -> EngineResult<&mut EngineState> {
        self.state.as_mut().ok_or(EngineError::NotInitialized)
    }

    /// Map working coordinates to original-image pixels.
    pub fn to_original(&self, x: f64, y: f64) -> EngineResult<[f64; 2]> {
        Ok(self.state()?.work.to_original(x, y))
    }

    /// Map original-image pixels to working coordinates.
    pub fn to_working(&self, x: f64, y: f64) -> EngineResult<[f64; 2]> {
        Ok(self.state()?.work.to_working(x, y))
    }

    /// Original-image extent covered by the working image.
    pub fn working_extent(&self) -> EngineResult<[f64; 4]> {
        Ok(self.state()?.work.original_extent())
    }

    /// Reduction factor of the current working image.
    pub fn reduction(&self) -> EngineResult<f32> {
        Ok(self.state()?.work.reduction())
    }

    /// Run edge detection; see [`crate::edges`] for parameter semantics.
    ///
    /// Invalidates the cached edge-mask spectra and any averaged template,
    /// both of which are derived from the edge map.
    pub fn detect_edges(
        &mut self,
        sigma_or_iterations: f32,
        low_kept_frac: f32,
        high_kept_frac: f32,
    ) -> EngineResult<EdgeStats> {
        let state = self.state_mut()?;
        let (map, stats) = detect_edges(
            &state.work.data,
            &mut state.smooth,
            sigma_or_iterations,
            low_kept_frac,
            high_kept_frac,
        )?;
        state.edges = Some(map);
        state.edge_spectrum = None;
        state.averaged = None;
        state.averaged_spectrum = None;
        tracing::debug!(
            sigma = sigma_or_iterations,
            strong = stats.strong,
            weak = stats.weak,
            "edge detection complete"
        );
        Ok(stats)
    }

    /// Search for circular holes over a scanned range of radii.
    ///
    /// Returns the interpolated best radius and the accepted candidate
    /// centers in original-image coordinates. A negative `ring_width`
    /// correlates the previously built averaged template instead of
    /// synthetic annuli.
    pub fn find_circles(
        &mut self,
        params: &CircleSearchParams,
        boundary: Option<&[[f64; 2]]>,
    ) -> EngineResult<CircleFinding> {
        if params.ring_width < 0.0 {
            self.find_circles_averaged(params, boundary)
        } else {
            self.find_circles_synthetic(params, boundary)
        }
    }

    fn find_circles_synthetic(
        &mut self,
        params: &CircleSearchParams,
        boundary: Option<&[[f64; 2]]>,
    ) -> EngineResult<CircleFinding> {
        let transform = &*self.transform;
        let state = self.state.as_mut().ok_or(EngineError::NotInitialized)?;
        if state.edges.is_none() {
            return Err(EngineError::NotInitialized);
        }

        let reduction = state.work.reduction();
        let mid_w = params.mid_radius / reduction;
        let inc_w = (params.radius_increment / reduction).max(0.05);
        let spacing_w = (params.min_spacing / reduction).max(1.0);

        let n = params.num_radii.max(1);
        let radii: Vec<f32> = (0..n)
            .map(|i| mid_w + (i as f32 - (n / 2) as f32) * inc_w)
            .filter(|&r| r > 1.0)
            .collect();
        if radii.is_empty() {
            return Err(EngineError::TemplateParameterMismatch {
                expected_radius: mid_w,
                requested_radius: params.mid_radius,
                num_radii: params.num_radii,
            });
        }

        ensure_edge_spectrum(state, transform, params.use_weak_edges)?;
        let EngineState {
            work,
            pad,
            edge_spectrum,
            templates,
            work_mean,
            work_sd,
            cache_flags,
            last_best_radius,
            source_dims,
            ..
        } = &mut *state;
        let source = &edge_spectrum.as_ref().expect("edge spectrum ensured").1;
        let dark_threshold = *work_mean - DARK_OUTLIER_SIGMA * *work_sd;
        let retain = params.retain_templates && cache_flags.keep_templates;

        // A single-radius search needs no bisection refinement.
        let max_bisections = if radii.len() > 1 { 5 } else { 0 };
        let outcome = scan_radii(&radii, inc_w, max_bisections, |radius_w| {
            let spectrum = match templates.lookup(radius_w, params.ring_width) {
                Some(s) => s.clone(),
                None => {
                    let t = ring_template(*pad, radius_w, params.ring_width / reduction)?;
                    let s = transform.forward(&t)?;
                    if retain {
                        templates.insert(radius_w, params.ring_width, s.clone());
                    }
                    s
                }
            };
            let corr = transform.inverse(&conjugate_product(source, &spectrum))?;
            let mut peaks = find_spaced_peaks(&corr, work.dims(), spacing_w);
            apply_peak_floor(&mut peaks, params.min_peak_frac);
            filter_by_boundary(&mut peaks, work, *source_dims, boundary);
            prune_candidates(&mut peaks, &work.data, radius_w, &params.prune, dark_threshold);
            Ok(peaks)
        })?;

        *last_best_radius = Some(outcome.best_evaluated_radius);
        if !cache_flags.keep_edge_spectrum {
            *edge_spectrum = None;
        }

        let alternates_w =
            match_alternates(&outcome.best_peaks, &outcome.runner_up_peaks, spacing_w * 0.5);
        let mut report = outcome.report;
        for entry in report.evaluated.iter_mut() {
            entry.0 *= reduction;
        }
        let finding = to_original_finding(
            work,
            outcome.best_radius * reduction,
            &outcome.best_peaks,
            &alternates_w,
            report,
        );
        tracing::info!(
            best_radius = finding.best_radius,
            candidates = finding.points.len(),
            "circle search complete"
        );
        Ok(finding)
    }

    fn find_circles_averaged(
        &mut self,
        params: &CircleSearchParams,
        boundary: Option<&[[f64; 2]]>,
    ) -> EngineResult<CircleFinding> {
        let transform = &*self.transform;
        let state = self.state.as_mut().ok_or(EngineError::NotInitialized)?;
        let reduction = state.work.reduction();
        let mid_w = params.mid_radius / reduction;

        let (radius, from_intensity, dirty) = match &state.averaged {
            Some(avg) => (avg.radius, avg.from_intensity, avg.dirty),
            None => return Err(EngineError::NoTemplateAvailable),
        };
        let tolerance = (0.05 * radius).max(1.0);
        if params.num_radii != 1 || (mid_w - radius).abs() > tolerance {
            return Err(EngineError::TemplateParameterMismatch {
                expected_radius: radius * reduction,
                requested_radius: params.mid_radius,
                num_radii: params.num_radii,
            });
        }

        if dirty || state.averaged_spectrum.is_none() {
            let avg = state.averaged.as_mut().expect("averaged checked above");
            let embedded = embed_centered(&avg.data, state.pad)?;
            state.averaged_spectrum = Some(transform.forward(&embedded)?);
            avg.dirty = false;
        }

        let source = if from_intensity {
            ensure_intensity_spectrum(state, transform)?;
            state
                .intensity_spectrum
                .as_ref()
                .expect("intensity spectrum ensured")
        } else {
            if state.edges.is_none() {
                return Err(EngineError::NotInitialized);
            }
            ensure_edge_spectrum(state, transform, params.use_weak_edges)?;
            &state.edge_spectrum.as_ref().expect("edge spectrum ensured").1
        };
        let spectrum = state
            .averaged_spectrum
            .as_ref()
            .expect("averaged spectrum ensured");

        let spacing_w = (params.min_spacing / reduction).max(1.0);
        let corr = transform.inverse(&conjugate_product(source, spectrum))?;
        let mut peaks = find_spaced_peaks(&corr, state.work.dims(), spacing_w);
        apply_peak_floor(&mut peaks, params.min_peak_frac);
        filter_by_boundary(&mut peaks, &state.work, state.source_dims, boundary);
        let dark_threshold = state.work_mean - DARK_OUTLIER_SIGMA * state.work_sd;
        prune_candidates(&mut peaks, &state.work.data, radius, &params.prune, dark_threshold);

        let report = crate::correlate::RadiusScanReport {
            evaluated: vec![(
                radius * reduction,
                peaks.iter().map(|p| p.strength).sum::<f32>(),
            )],
            walk_evaluations: 1,
            bisection_evaluations: 0,
        };
        Ok(to_original_finding(
            &state.work,
            radius * reduction,
            &peaks,
            &vec![None; peaks.len()],
            report,
        ))
    }

    /// Build an averaged template around the strongest supplied points.
    ///
    /// The template inherits the radius of the last circle search and is
    /// marked dirty so its transform is rebuilt on next use.
    pub fn build_template(
        &mut self,
        points: &[DetectedPoint],
        count_to_average: usize,
        nominal_spacing: f32,
        use_raw_intensity: bool,
    ) -> EngineResult<()> {
        let state = self.state_mut()?;
        let reduction = state.work.reduction();
        let spacing_w = nominal_spacing / reduction;
        let radius = state
            .last_best_radius
            .unwrap_or(spacing_w * 0.25);

        let points_w: Vec<(f32, f32, f32)> = points
            .iter()
            .map(|p| {
                let [x, y] = state.work.to_working(p.x, p.y);
                (x as f32, y as f32, p.peak)
            })
            .collect();

        let source_storage;
        let source: &Array2<f32> = if use_raw_intensity {
            &state.work.data
        } else {
            let edges = state.edges.as_ref().ok_or(EngineError::NotInitialized)?;
            source_storage = edges.mask(false);
            &source_storage
        };

        state.averaged = Some(build_averaged_template(
            source,
            &points_w,
            count_to_average,
            spacing_w,
            radius,
            use_raw_intensity,
        )?);
        state.averaged_spectrum = None;
        Ok(())
    }

    /// Local-region intensity statistics for each point, sampled over a disc
    /// of `radius` (original-image pixels).
    pub fn point_region_stats(
        &self,
        points: &[DetectedPoint],
        radius: f32,
    ) -> EngineResult<Vec<RegionStats>> {
        let state = self.state()?;
        let reduction = state.work.reduction();
        let dark_threshold = state.work_mean - DARK_OUTLIER_SIGMA * state.work_sd;
        Ok(points
            .iter()
            .map(|p| {
                let [x, y] = state.work.to_working(p.x, p.y);
                region_stats(
                    &state.work.data,
                    x as f32,
                    y as f32,
                    radius / reduction,
                    dark_threshold,
                )
            })
            .collect())
    }

    /// Remove outliers and cache the computed cutoffs for later reuse.
    pub fn remove_outliers_caching(
        &mut self,
        points: &mut Vec<DetectedPoint>,
        values: &mut Vec<f32>,
        negative_criterion: f32,
        positive_criterion: f32,
    ) -> EngineResult<OutlierCounts> {
        let state = self.state_mut()?;
        let (cutoffs, counts) =
            stats::remove_outliers(points, values, negative_criterion, positive_criterion);
        state.cutoffs = Some(cutoffs);
        Ok(counts)
    }

    /// Reapply the cached cutoffs to a different point set, so per-tile
    /// filtering matches the full-image pass.
    pub fn reapply_cutoffs(
        &mut self,
        points: &mut Vec<DetectedPoint>,
        values: &mut Vec<f32>,
    ) -> EngineResult<OutlierCounts> {
        let state = self.state_mut()?;
        stats::reapply_cutoffs(state.cutoffs.as_ref(), points, values)
    }

    /// Cutoffs from the most recent outlier pass, if any.
    pub fn cached_cutoffs(&self) -> Option<CutoffRange> {
        self.state.as_ref().and_then(|s| s.cutoffs)
    }
}

fn ensure_edge_spectrum(
    state: &mut EngineState,
    transform: &dyn SpectrumTransform,
    include_weak: bool,
) -> EngineResult<()> {
    let stale = match &state.edge_spectrum {
        Some((weak, _)) => *weak != include_weak,
        None => true,
    };
    if stale {
        let edges = state.edges.as_ref().ok_or(EngineError::NotInitialized)?;
        let mask = edges.mask(include_weak);
        let embedded = embed_image(&mask, state.pad, 0.0)?;
        state.edge_spectrum = Some((include_weak, transform.forward(&embedded)?));
    }
    Ok(())
}

fn ensure_intensity_spectrum(
    state: &mut EngineState,
    transform: &dyn SpectrumTransform,
) -> EngineResult<()> {
    if state.intensity_spectrum.is_none() {
        let embedded = embed_image(&state.work.data, state.pad, state.work_mean)?;
        state.intensity_spectrum = Some(transform.forward(&embedded)?);
    }
    Ok(())
}

/// Discard peaks below a fraction of the strongest peak.
fn apply_peak_floor(peaks: &mut Vec<Peak>, min_frac: f32) {
    if let Some(top) = peaks.first().map(|p| p.strength) {
        let floor = top * min_frac.clamp(0.0, 1.0);
        peaks.retain(|p| p.strength >= floor);
    }
}

/// Discard peaks outside the boundary polygon, or outside the original
/// (unpadded) image when no polygon is given.
fn filter_by_boundary(
    peaks: &mut Vec<Peak>,
    work: &WorkingImage,
    source_dims: (usize, usize),
    boundary: Option<&[[f64; 2]]>,
) {
    peaks.retain(|p| {
        let [ox, oy] = work.to_original(p.x as f64, p.y as f64);
        match boundary {
            Some(polygon) => point_in_polygon(ox, oy, polygon),
            None => {
                ox >= 0.0
                    && oy >= 0.0
                    && ox < source_dims.1 as f64
                    && oy < source_dims.0 as f64
            }
        }
    });
}

fn to_original_finding(
    work: &WorkingImage,
    best_radius_original: f32,
    peaks: &[Peak],
    alternates: &[Option<Peak>],
    report: crate::correlate::RadiusScanReport,
) -> CircleFinding {
    let points = peaks
        .iter()
        .map(|p| {
            let [x, y] = work.to_original(p.x as f64, p.y as f64);
            DetectedPoint {
                x,
                y,
                peak: p.strength,
            }
        })
        .collect();
    let alternates = alternates
        .iter()
        .map(|a| {
            a.map(|p| {
                let [x, y] = work.to_original(p.x as f64, p.y as f64);
                DetectedPoint {
                    x,
                    y,
                    peak: p.strength,
                }
            })
        })
        .collect();
    CircleFinding {
        best_radius: best_radius_original,
        points,
        alternates,
        report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequenceParams;
    use crate::test_utils::draw_hole_lattice;

    fn lattice_samples() -> GraySamples {
        // 7x5 grid, spacing 32, radius 8, inside a 288x224 image.
        draw_hole_lattice(288, 224, [48.0, 48.0], 32.0, 5, 7, 8.0, None)
    }

    fn init_params() -> InitParams {
        InitParams {
            reduction: 1.0,
            max_radius: 16.0,
            cache: CacheFlags::default(),
        }
    }

    fn search_params() -> CircleSearchParams {
        CircleSearchParams {
            mid_radius: 9.0,
            radius_increment: 1.0,
            ring_width: 2.0,
            num_radii: 5,
            min_spacing: SequenceParams::from_spacing_and_diameter(32.0, 16.0).min_spacing(),
            ..CircleSearchParams::default()
        }
    }

    fn run_detection(finder: &mut HoleFinder) -> CircleFinding {
        finder
            .detect_edges(1.0, 0.90, 0.97)
            .expect("edge detection");
        finder
            .find_circles(&search_params(), None)
            .expect("circle search")
    }

    #[test]
    fn operations_before_initialize_fail() {
        let mut finder = HoleFinder::new();
        assert_eq!(
            finder.detect_edges(1.0, 0.9, 0.97).unwrap_err(),
            EngineError::NotInitialized
        );
        assert_eq!(
            finder.find_circles(&search_params(), None).unwrap_err(),
            EngineError::NotInitialized
        );
        assert_eq!(finder.working_extent().unwrap_err(), EngineError::NotInitialized);
    }

    #[test]
    fn synthetic_lattice_is_recovered() {
        let samples = lattice_samples();
        let mut finder = HoleFinder::new();
        finder.initialize(&samples, &init_params()).unwrap();
        let finding = run_detection(&mut finder);

        // Radius within 5% of the true 8.0.
        assert!(
            (finding.best_radius - 8.0).abs() <= 0.4,
            "radius {}",
            finding.best_radius
        );
        // All 35 holes found, each within 1.5 px of its true center.
        assert_eq!(finding.points.len(), 35, "points: {:?}", finding.points.len());
        for p in &finding.points {
            let gx = ((p.x - 48.0) / 32.0).round();
            let gy = ((p.y - 48.0) / 32.0).round();
            let tx = 48.0 + gx * 32.0;
            let ty = 48.0 + gy * 32.0;
            let err = ((p.x - tx).powi(2) + (p.y - ty).powi(2)).sqrt();
            assert!(err < 1.5, "point ({}, {}) off by {}", p.x, p.y, err);
        }
    }

    #[test]
    fn noisy_lattice_is_still_recovered() {
        let samples =
            draw_hole_lattice(288, 224, [48.0, 48.0], 32.0, 5, 7, 8.0, Some((10.0, 42)));
        let mut finder = HoleFinder::new();
        finder.initialize(&samples, &init_params()).unwrap();
        let finding = run_detection(&mut finder);
        assert!(
            (33..=36).contains(&finding.points.len()),
            "found {} points under noise",
            finding.points.len()
        );
        assert!(
            (finding.best_radius - 8.0).abs() <= 0.4,
            "radius {}",
            finding.best_radius
        );
    }

    #[test]
    fn reinitialization_is_bit_identical() {
        let samples = lattice_samples();
        let mut finder = HoleFinder::new();
        finder.initialize(&samples, &init_params()).unwrap();
        let first = run_detection(&mut finder);
        finder.initialize(&samples, &init_params()).unwrap();
        let second = run_detection(&mut finder);

        assert_eq!(first.points.len(), second.points.len());
        for (a, b) in first.points.iter().zip(second.points.iter()) {
            assert_eq!(a.x.to_bits(), b.x.to_bits());
            assert_eq!(a.y.to_bits(), b.y.to_bits());
            assert_eq!(a.peak.to_bits(), b.peak.to_bits());
        }
        assert_eq!(first.best_radius.to_bits(), second.best_radius.to_bits());
    }

    #[test]
    fn detected_points_round_trip_through_working_coordinates() {
        let samples = lattice_samples();
        let mut finder = HoleFinder::new();
        finder
            .initialize(
                &samples,
                &InitParams {
                    reduction: 2.0,
                    ..init_params()
                },
            )
            .unwrap();
        let finding = run_detection(&mut finder);
        assert!(!finding.points.is_empty());
        for p in &finding.points {
            let [wx, wy] = finder.to_working(p.x, p.y).unwrap();
            let [bx, by] = finder.to_original(wx, wy).unwrap();
            assert!((bx - p.x).abs() < 1e-9 && (by - p.y).abs() < 1e-9);
        }
    }

    #[test]
    fn boundary_polygon_filters_candidates() {
        let samples = lattice_samples();
        let mut finder = HoleFinder::new();
        finder.initialize(&samples, &init_params()).unwrap();
        finder.detect_edges(1.0, 0.90, 0.97).unwrap();
        // Polygon covering only the left half of the image.
        let polygon = [[0.0, 0.0], [144.0, 0.0], [144.0, 224.0], [0.0, 224.0]];
        let finding = finder
            .find_circles(&search_params(), Some(&polygon))
            .unwrap();
        assert!(!finding.points.is_empty());
        for p in &finding.points {
            assert!(p.x < 144.0, "point at x={} escaped the polygon", p.x);
        }
    }

    #[test]
    fn averaged_template_requires_prior_build_and_matching_radius() {
        let samples = lattice_samples();
        let mut finder = HoleFinder::new();
        finder.initialize(&samples, &init_params()).unwrap();
        finder.detect_edges(1.0, 0.90, 0.97).unwrap();

        let mut averaged = search_params();
        averaged.ring_width = -1.0;
        averaged.num_radii = 1;
        assert_eq!(
            finder.find_circles(&averaged, None).unwrap_err(),
            EngineError::NoTemplateAvailable
        );

        let finding = finder.find_circles(&search_params(), None).unwrap();
        finder
            .build_template(&finding.points, 16, 32.0, false)
            .unwrap();

        // Wrong radius: rejected.
        let mut wrong = averaged.clone();
        wrong.mid_radius = finding.best_radius * 2.0;
        assert!(matches!(
            finder.find_circles(&wrong, None).unwrap_err(),
            EngineError::TemplateParameterMismatch { .. }
        ));

        // Multiple radii with an averaged template: rejected.
        let mut multi = averaged.clone();
        multi.mid_radius = finding.best_radius;
        multi.num_radii = 3;
        assert!(matches!(
            finder.find_circles(&multi, None).unwrap_err(),
            EngineError::TemplateParameterMismatch { .. }
        ));

        // Matching parameters: the averaged pass still finds the lattice.
        averaged.mid_radius = finding.best_radius;
        let refined = finder.find_circles(&averaged, None).unwrap();
        assert!(
            refined.points.len() >= 33,
            "averaged pass found {} points",
            refined.points.len()
        );
    }

    #[test]
    fn radius_walk_terminates_with_bounded_evaluations() {
        let samples = lattice_samples();
        let mut finder = HoleFinder::new();
        finder.initialize(&samples, &init_params()).unwrap();
        finder.detect_edges(1.0, 0.90, 0.97).unwrap();
        let mut params = search_params();
        params.num_radii = 9;
        params.mid_radius = 8.0;
        let finding = finder.find_circles(&params, None).unwrap();
        // Each grid radius at most once, plus at most two evaluations per
        // bisection halving.
        assert!(finding.report.walk_evaluations <= 9);
        assert!(finding.report.bisection_evaluations <= 10);
        let mut radii: Vec<f32> = finding.report.evaluated.iter().map(|e| e.0).collect();
        radii.sort_by(|a, b| a.partial_cmp(b).unwrap());
        radii.dedup_by(|a, b| (*a - *b).abs() < 1e-6);
        assert_eq!(radii.len(), finding.report.evaluated.len());
    }
}
