//! The parameter-scan state machine driving the full pipeline.
//!
//! One call to [`HoleSequence::step`] runs exactly one smoothing/threshold
//! combination, so a caller can yield between steps. When the scan loops
//! exhaust, a finalizing step re-runs the best combination, rescues
//! weak-edge detections against the missing-position list, and applies the
//! final outlier pass. There is no recovery inside a combination; the
//! sequence's resilience is trying the next one.

use crate::config::{CircleSearchParams, LatticeParams, SequenceParams};
use crate::engine::HoleFinder;
use crate::error::{EngineError, EngineResult};
use crate::lattice::{analyze_neighbors, LatticeGeometry};
use crate::stats::OutlierCounts;
use crate::DetectedPoint;

/// Progress of one sequence step.
#[derive(Debug, Clone)]
pub enum SequenceProgress {
    /// A combination was scanned; call `step` again.
    InProgress(ComboSummary),
    /// The sequence finished; further calls return the same outcome.
    Finished(SequenceOutcome),
}

/// Summary of one scanned combination.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ComboSummary {
    /// Smoothing parameter of this combination.
    pub sigma: f32,
    /// High kept-fraction threshold of this combination.
    pub threshold: f32,
    /// Lattice-accepted point count.
    pub accepted: usize,
    /// Predicted-but-missing position count.
    pub missing: usize,
    /// Interpolated best radius of this combination.
    pub best_radius: f32,
}

/// Final result of a completed sequence.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SequenceOutcome {
    /// Accepted hole centers in original-image coordinates.
    pub points: Vec<DetectedPoint>,
    /// Lattice positions still missing after the weak-edge rescue.
    pub missing: Vec<[f64; 2]>,
    /// Interpolated best radius.
    pub best_radius: f32,
    /// Mean lattice step length.
    pub true_spacing: f32,
    /// Primary lattice angle in radians.
    pub lattice_angle: f32,
    /// Smoothing parameter of the winning combination.
    pub sigma: f32,
    /// Threshold of the winning combination.
    pub threshold: f32,
    /// Points promoted by the weak-edge rescue.
    pub rescued: usize,
    /// Points removed by the final outlier pass.
    pub outliers_removed: OutlierCounts,
}

#[derive(Clone)]
struct ComboResult {
    points: Vec<DetectedPoint>,
    missing: Vec<[f64; 2]>,
    geometry: LatticeGeometry,
    best_radius: f32,
}

enum SequenceState {
    Scanning {
        sigma_index: usize,
        threshold_index: usize,
    },
    Finalizing,
    Done(SequenceOutcome),
}

/// Resumable scan over every (sigma, threshold) combination.
pub struct HoleSequence {
    params: SequenceParams,
    state: SequenceState,
    best: Option<BestCombo>,
    last_scanned: Option<(usize, usize)>,
}

struct BestCombo {
    sigma_index: usize,
    threshold_index: usize,
    summary: ComboSummary,
    combo: ComboResult,
}

impl HoleSequence {
    /// Create a sequence; empty parameter lists fall back to the defaults.
    pub fn new(mut params: SequenceParams) -> Self {
        if params.sigmas.is_empty() {
            params.sigmas = SequenceParams::default().sigmas;
        }
        if params.thresholds.is_empty() {
            params.thresholds = SequenceParams::default().thresholds;
        }
        Self {
            params,
            state: SequenceState::Scanning {
                sigma_index: 0,
                threshold_index: 0,
            },
            best: None,
            last_scanned: None,
        }
    }

    /// Run one state-machine step against the engine.
    pub fn step(&mut self, finder: &mut HoleFinder) -> EngineResult<SequenceProgress> {
        match &self.state {
            SequenceState::Scanning {
                sigma_index,
                threshold_index,
            } => {
                let (si, ti) = (*sigma_index, *threshold_index);
                let sigma = self.params.sigmas[si];
                let threshold = self.params.thresholds[ti];
                let combo = self.run_combo(finder, sigma, threshold)?;
                let summary = ComboSummary {
                    sigma,
                    threshold,
                    accepted: combo.points.len(),
                    missing: combo.missing.len(),
                    best_radius: combo.best_radius,
                };
                tracing::info!(
                    sigma,
                    threshold,
                    accepted = summary.accepted,
                    missing = summary.missing,
                    "scanned combination"
                );

                let better = match &self.best {
                    None => true,
                    Some(b) => {
                        summary.accepted > b.summary.accepted
                            || (summary.accepted == b.summary.accepted
                                && summary.missing < b.summary.missing)
                    }
                };
                if better {
                    self.best = Some(BestCombo {
                        sigma_index: si,
                        threshold_index: ti,
                        summary,
                        combo,
                    });
                }
                self.last_scanned = Some((si, ti));

                self.state = if ti + 1 < self.params.thresholds.len() {
                    SequenceState::Scanning {
                        sigma_index: si,
                        threshold_index: ti + 1,
                    }
                } else if si + 1 < self.params.sigmas.len() {
                    SequenceState::Scanning {
                        sigma_index: si + 1,
                        threshold_index: 0,
                    }
                } else {
                    SequenceState::Finalizing
                };
                Ok(SequenceProgress::InProgress(summary))
            }
            SequenceState::Finalizing => {
                let outcome = self.finalize(finder)?;
                self.state = SequenceState::Done(outcome.clone());
                Ok(SequenceProgress::Finished(outcome))
            }
            SequenceState::Done(outcome) => Ok(SequenceProgress::Finished(outcome.clone())),
        }
    }

    fn circle_params(&self, mid_radius: f32, increment: f32) -> CircleSearchParams {
        CircleSearchParams {
            mid_radius,
            radius_increment: increment,
            ring_width: self.params.ring_width,
            num_radii: self.params.num_radii,
            retain_templates: true,
            min_spacing: self.params.min_spacing(),
            use_weak_edges: false,
            prune: self.params.prune,
            ..CircleSearchParams::default()
        }
    }

    fn lattice_params(&self, finder: &HoleFinder) -> EngineResult<LatticeParams> {
        let mut lattice = LatticeParams::from_spacing(self.params.spacing, self.params.max_error);
        lattice.extent = Some(finder.working_extent()?);
        Ok(lattice)
    }

    /// Edge detection, the (optionally narrowed) multi-radius circle search,
    /// the averaged-template refinement, and the lattice rebuild for one
    /// combination.
    fn run_combo(
        &self,
        finder: &mut HoleFinder,
        sigma: f32,
        threshold: f32,
    ) -> EngineResult<ComboResult> {
        let low = (threshold - self.params.low_frac_margin).clamp(0.05, threshold);
        finder.detect_edges(sigma, low, threshold)?;

        let boundary = self.params.boundary.as_deref();
        let mut mid = self.params.mid_radius;
        let mut increment = self.params.radius_increment;
        let mut finding = finder.find_circles(&self.circle_params(mid, increment), boundary)?;
        for _ in 1..self.params.scan_passes.max(1) {
            mid = finding.best_radius;
            increment = (increment * self.params.refine_increment_scale).max(0.1);
            finding = finder.find_circles(&self.circle_params(mid, increment), boundary)?;
        }

        if self.params.use_template_pass && finding.points.len() >= 4 {
            finder.build_template(
                &finding.points,
                self.params.template_average_count,
                self.params.spacing,
                self.params.average_raw_intensity,
            )?;
            let averaged = CircleSearchParams {
                ring_width: -1.0,
                num_radii: 1,
                mid_radius: finding.best_radius,
                ..self.circle_params(finding.best_radius, increment)
            };
            let refined = finder.find_circles(&averaged, boundary)?;
            if refined.points.len() >= finding.points.len() / 2 {
                let best_radius = finding.best_radius;
                finding = refined;
                finding.best_radius = best_radius;
            }
        }

        let lattice = self.lattice_params(finder)?;
        let analysis = analyze_neighbors(&finding.points, &finding.alternates, &lattice);
        Ok(ComboResult {
            points: analysis.points,
            missing: analysis.missing,
            geometry: analysis.geometry,
            best_radius: finding.best_radius,
        })
    }

    /// Re-run the best combination if needed, rescue weak-edge detections
    /// against the missing list, and apply the final outlier pass.
    fn finalize(&mut self, finder: &mut HoleFinder) -> EngineResult<SequenceOutcome> {
        let best = self.best.take().ok_or(EngineError::NotInitialized)?;
        let (si, ti) = (best.sigma_index, best.threshold_index);
        let best_summary = best.summary;
        let sigma = self.params.sigmas[si];
        let threshold = self.params.thresholds[ti];

        // The re-run is skipped when the best combination was the last one
        // scanned; the engine's caches still hold its state.
        let mut combo = if self.last_scanned == Some((si, ti)) {
            best.combo
        } else {
            self.run_combo(finder, sigma, threshold)?
        };

        // Weak-edge rescue: a search that admits weak edges can confirm
        // lattice positions where no strong-edge peak was found.
        let mut rescued = 0usize;
        if !combo.missing.is_empty() {
            let rescue_params = CircleSearchParams {
                num_radii: 1,
                use_weak_edges: true,
                ..self.circle_params(best_summary.best_radius, self.params.radius_increment)
            };
            let weak = finder.find_circles(&rescue_params, self.params.boundary.as_deref())?;
            let max_error = self.params.max_error as f64;
            combo.missing.retain(|&pos| {
                let candidate = weak
                    .points
                    .iter()
                    .map(|p| (p.distance_to_xy(pos), p))
                    .filter(|(d, _)| *d <= max_error)
                    .min_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                match candidate {
                    Some((_, p)) => {
                        combo.points.push(*p);
                        rescued += 1;
                        false
                    }
                    None => true,
                }
            });
            tracing::info!(rescued, "weak-edge rescue complete");
        }

        // Final outlier pass over local region means; cutoffs are cached in
        // the engine for per-tile reuse.
        let mut outliers_removed = OutlierCounts::default();
        let criteria_enabled =
            self.params.final_neg_criterion > 0.0 || self.params.final_pos_criterion > 0.0;
        if combo.points.len() >= 10 && criteria_enabled {
            let stats = finder.point_region_stats(&combo.points, best_summary.best_radius)?;
            let mut values: Vec<f32> = stats.iter().map(|s| s.mean).collect();
            outliers_removed = finder.remove_outliers_caching(
                &mut combo.points,
                &mut values,
                self.params.final_neg_criterion,
                self.params.final_pos_criterion,
            )?;
        }

        Ok(SequenceOutcome {
            points: combo.points,
            missing: combo.missing,
            best_radius: combo.best_radius,
            true_spacing: combo.geometry.spacing(),
            lattice_angle: combo.geometry.primary.angle,
            sigma,
            threshold,
            rescued,
            outliers_removed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InitParams;
    use crate::test_utils::draw_hole_lattice;
    use crate::GraySamples;

    fn sequence_params() -> SequenceParams {
        SequenceParams {
            sigmas: vec![1.0],
            thresholds: vec![0.95, 0.97],
            ..SequenceParams::from_spacing_and_diameter(32.0, 16.0)
        }
    }

    fn initialized_finder(samples: &GraySamples) -> HoleFinder {
        let mut finder = HoleFinder::new();
        finder
            .initialize(
                samples,
                &InitParams {
                    reduction: 1.0,
                    max_radius: 16.0,
                    ..InitParams::default()
                },
            )
            .unwrap();
        finder
    }

    fn run_to_completion(
        sequence: &mut HoleSequence,
        finder: &mut HoleFinder,
    ) -> SequenceOutcome {
        for _ in 0..32 {
            match sequence.step(finder).expect("sequence step") {
                SequenceProgress::InProgress(_) => continue,
                SequenceProgress::Finished(outcome) => return outcome,
            }
        }
        panic!("sequence did not finish");
    }

    #[test]
    fn full_sequence_recovers_a_synthetic_lattice() {
        let samples = draw_hole_lattice(288, 224, [48.0, 48.0], 32.0, 5, 7, 8.0, None);
        let mut finder = initialized_finder(&samples);
        let mut sequence = HoleSequence::new(sequence_params());
        let outcome = run_to_completion(&mut sequence, &mut finder);

        assert_eq!(outcome.points.len(), 35, "accepted {}", outcome.points.len());
        assert!(outcome.missing.is_empty(), "missing: {:?}", outcome.missing);
        assert!((outcome.best_radius - 8.0).abs() <= 0.4, "radius {}", outcome.best_radius);
        assert!(
            (outcome.true_spacing - 32.0).abs() <= 0.64,
            "spacing {}",
            outcome.true_spacing
        );
        assert_eq!(outcome.sigma, 1.0);
        // Cutoffs were cached for montage-tile reuse.
        assert!(finder.cached_cutoffs().is_some());
    }

    #[test]
    fn sequence_steps_once_per_combination() {
        let samples = draw_hole_lattice(288, 224, [48.0, 48.0], 32.0, 5, 7, 8.0, None);
        let mut finder = initialized_finder(&samples);
        let mut sequence = HoleSequence::new(sequence_params());

        // Two combinations (1 sigma x 2 thresholds), then finalize.
        assert!(matches!(
            sequence.step(&mut finder).unwrap(),
            SequenceProgress::InProgress(_)
        ));
        assert!(matches!(
            sequence.step(&mut finder).unwrap(),
            SequenceProgress::InProgress(_)
        ));
        let finished = sequence.step(&mut finder).unwrap();
        assert!(matches!(finished, SequenceProgress::Finished(_)));
        // A completed sequence keeps returning the same outcome.
        let again = sequence.step(&mut finder).unwrap();
        match (finished, again) {
            (SequenceProgress::Finished(a), SequenceProgress::Finished(b)) => {
                assert_eq!(a.points.len(), b.points.len());
            }
            _ => panic!("sequence restarted after finishing"),
        }
    }
}
