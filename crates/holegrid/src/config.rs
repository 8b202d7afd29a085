//! Engine configuration types.
//!
//! Every tuned ratio the pipeline depends on lives here as a documented field
//! with its empirical default, so callers can adjust them for unusual hole
//! sizes or spacings without patching the algorithms.

/// Retention flags for the long-lived caches.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheFlags {
    /// Keep the forward transform of the edge image between circle searches.
    pub keep_edge_spectrum: bool,
    /// Keep ring templates (and their spectra) between circle searches.
    pub keep_templates: bool,
}

impl Default for CacheFlags {
    fn default() -> Self {
        Self {
            keep_edge_spectrum: true,
            keep_templates: true,
        }
    }
}

/// Parameters for [`crate::HoleFinder::initialize`].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InitParams {
    /// Linear reduction factor applied to the input; 1.0 keeps full size.
    pub reduction: f32,
    /// Largest hole radius (original-image pixels) any later search will
    /// analyze; governs the correlation padding so no tested radius wraps.
    pub max_radius: f32,
    /// Cache retention flags.
    pub cache: CacheFlags,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            reduction: 1.0,
            max_radius: 24.0,
            cache: CacheFlags::default(),
        }
    }
}

/// Candidate pruning applied when a circle search yields at least
/// `min_candidates` peaks.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PruneParams {
    /// Candidate count below which no statistical pruning runs.
    pub min_candidates: usize,
    /// Negative (dark-side) criterion for the local-mean outlier pass, in
    /// MADN units; 0 disables.
    pub mean_neg_criterion: f32,
    /// Positive (bright-side) criterion for the local-mean outlier pass.
    pub mean_pos_criterion: f32,
    /// Positive criterion for the local-SD outlier pass; 0 disables.
    pub sd_pos_criterion: f32,
    /// A candidate whose combined peak/intensity/SD score falls below the
    /// strongest candidates' mean score divided by this ratio is treated as a
    /// weak ring and discarded.
    pub weak_score_floor_ratio: f32,
    /// The weak-ring pass is skipped when it would discard more than this
    /// fraction of the candidates.
    pub max_weak_discard_frac: f32,
}

impl Default for PruneParams {
    fn default() -> Self {
        Self {
            min_candidates: 10,
            mean_neg_criterion: 4.5,
            mean_pos_criterion: 4.5,
            sd_pos_criterion: 4.5,
            weak_score_floor_ratio: 5.0,
            max_weak_discard_frac: 0.2,
        }
    }
}

/// Parameters for one circle search ([`crate::HoleFinder::find_circles`]).
///
/// All lengths are in original-image pixels; the engine converts to its
/// reduced working scale internally.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CircleSearchParams {
    /// Center of the scanned radius range.
    pub mid_radius: f32,
    /// Step between successive scanned radii.
    pub radius_increment: f32,
    /// Width of the synthetic double-ring annulus. A negative value selects
    /// the previously built averaged template instead (then `num_radii` must
    /// be 1 and `mid_radius` must match the template).
    pub ring_width: f32,
    /// Number of radii scanned, centered on `mid_radius`.
    pub num_radii: usize,
    /// Keep templates built during this search in the cache.
    pub retain_templates: bool,
    /// Minimum separation between reported peaks.
    pub min_spacing: f32,
    /// Peaks weaker than this fraction of the strongest peak at the same
    /// radius are discarded before any statistics run; correlation
    /// sidelobes sit well below real holes.
    pub min_peak_frac: f32,
    /// Include weak edges in the correlated edge mask.
    pub use_weak_edges: bool,
    /// Candidate pruning controls.
    pub prune: PruneParams,
}

impl Default for CircleSearchParams {
    fn default() -> Self {
        Self {
            mid_radius: 10.0,
            radius_increment: 1.0,
            ring_width: 2.0,
            num_radii: 7,
            retain_templates: true,
            min_spacing: 20.0,
            min_peak_frac: 0.35,
            use_weak_edges: false,
            prune: PruneParams::default(),
        }
    }
}

/// Parameters for lattice analysis ([`crate::lattice::analyze_neighbors`]).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct LatticeParams {
    /// Maximum pairwise distance considered a neighbor connection. A value
    /// `<= 0` requests geometry-only estimation seeded by the median
    /// nearest-neighbor distance.
    pub max_spacing: f32,
    /// Maximum tolerated distance between a point and its lattice-predicted
    /// position before substitution or removal.
    pub max_error: f32,
    /// Connections whose fitted error exceeds `max_error` times this slack
    /// are excluded from grid propagation.
    pub connection_error_slack: f32,
    /// Minimum connected-component size accepted as a real grid fragment.
    pub min_group: usize,
    /// Supporting-point count at and above which cell prediction switches
    /// from plain least squares to iteratively reweighted robust regression.
    pub robust_min_support: usize,
    /// The diagonal direction replaces the orthogonal pair when it carries at
    /// least this ratio times as many connections as the stronger primary
    /// direction...
    pub diagonal_count_ratio: f32,
    /// ...and its median length is below this fraction of the sqrt(2)-scaled
    /// primary length.
    pub diagonal_length_ratio: f32,
    /// Optional clip rectangle `[x0, y0, x1, y1]` for predicted missing
    /// positions; predictions outside it are not reported.
    pub extent: Option<[f64; 4]>,
}

impl Default for LatticeParams {
    fn default() -> Self {
        Self {
            max_spacing: 0.0,
            max_error: 3.0,
            connection_error_slack: 1.8,
            min_group: 3,
            robust_min_support: 6,
            diagonal_count_ratio: 1.05,
            diagonal_length_ratio: 0.6,
            extent: None,
        }
    }
}

impl LatticeParams {
    /// Lattice parameters for a known nominal spacing: connections are kept
    /// out to 1.5x spacing so diagonal links remain observable.
    pub fn from_spacing(spacing: f32, max_error: f32) -> Self {
        Self {
            max_spacing: spacing * 1.5,
            max_error,
            ..Self::default()
        }
    }
}

/// Parameters for the top-level scan sequence ([`crate::HoleSequence`]).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SequenceParams {
    /// Smoothing settings scanned in the outer loop. Positive entries are
    /// Gaussian sigmas; non-positive entries request that many passes of a
    /// 3x3 median filter.
    pub sigmas: Vec<f32>,
    /// Edge-threshold settings scanned in the inner loop: the fraction of
    /// gradient pixels kept below the high cut.
    pub thresholds: Vec<f32>,
    /// The low cut keeps this much less of the gradient histogram than the
    /// high cut.
    pub low_frac_margin: f32,
    /// Nominal hole spacing (original-image pixels).
    pub spacing: f32,
    /// Lattice fit tolerance (original-image pixels).
    pub max_error: f32,
    /// Center of the scanned radius range.
    pub mid_radius: f32,
    /// Step between scanned radii.
    pub radius_increment: f32,
    /// Number of scanned radii.
    pub num_radii: usize,
    /// Synthetic annulus width.
    pub ring_width: f32,
    /// Number of radius-scan passes per combination; passes after the first
    /// recenter on the previous best radius with the increment scaled down.
    pub scan_passes: usize,
    /// Increment scale applied on each narrowing pass.
    pub refine_increment_scale: f32,
    /// Build an averaged template from the strongest detections and re-run
    /// the correlation with it once per combination.
    pub use_template_pass: bool,
    /// Average raw intensity patches instead of the edge mask.
    pub average_raw_intensity: bool,
    /// Number of strongest points averaged into the template.
    pub template_average_count: usize,
    /// Candidate pruning controls shared by every circle search.
    pub prune: PruneParams,
    /// Final dark-side outlier criterion in MADN units; 0 disables.
    pub final_neg_criterion: f32,
    /// Final bright-side outlier criterion in MADN units; 0 disables.
    pub final_pos_criterion: f32,
    /// Optional boundary polygon (original-image pixels); peaks outside it
    /// are discarded.
    pub boundary: Option<Vec<[f64; 2]>>,
}

impl Default for SequenceParams {
    fn default() -> Self {
        Self {
            sigmas: vec![1.0, 2.0, -1.0],
            thresholds: vec![0.90, 0.95],
            low_frac_margin: 0.10,
            spacing: 40.0,
            max_error: 3.0,
            mid_radius: 10.0,
            radius_increment: 1.0,
            num_radii: 7,
            ring_width: 2.0,
            scan_passes: 2,
            refine_increment_scale: 0.5,
            use_template_pass: true,
            average_raw_intensity: false,
            template_average_count: 16,
            prune: PruneParams::default(),
            final_neg_criterion: 4.5,
            final_pos_criterion: 4.5,
            boundary: None,
        }
    }
}

impl SequenceParams {
    /// Derive scan parameters from a nominal hole spacing and diameter.
    ///
    /// This is the recommended constructor; individual fields can be
    /// overridden afterwards.
    pub fn from_spacing_and_diameter(spacing: f32, diameter: f32) -> Self {
        let radius = (diameter * 0.5).max(2.0);
        Self {
            spacing,
            mid_radius: radius,
            radius_increment: (radius * 0.1).max(0.5),
            max_error: (spacing * 0.08).clamp(2.0, 8.0),
            ..Self::default()
        }
    }

    /// Derived minimum peak separation for the circle searches.
    pub(crate) fn min_spacing(&self) -> f32 {
        (self.spacing * 0.7).max(4.0)
    }
}

/// Parameters for montage reconciliation
/// ([`crate::resolve_piece_positions`]).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct MontageParams {
    /// True lattice spacing in mosaic pixels.
    pub spacing: f32,
    /// Fitted hole radius in mosaic pixels.
    pub radius: f32,
    /// Primary lattice angle in radians; duplicate tests run in this rotated
    /// frame.
    pub lattice_angle: f32,
    /// Points on adjacent tiles closer than this fraction of the spacing are
    /// the same hole.
    pub pc_to_pc_same_frac: f32,
    /// A tile point within this fraction of the spacing of a global point
    /// refers to the same hole.
    pub pc_to_full_same_frac: f32,
    /// A tile point may replace a matching global point only when it sits
    /// less than this fraction of the radius past the overlap-zone boundary.
    pub subst_overlap_dist_frac: f32,
    /// Tile points closer than this fraction of the radius to their own tile
    /// edge are never used for substitution or addition.
    pub use_piece_edge_dist_frac: f32,
    /// A tile point more than this fraction of the way across an overlap
    /// zone is not added as a new global point.
    pub add_overlap_frac: f32,
}

impl Default for MontageParams {
    fn default() -> Self {
        Self {
            spacing: 40.0,
            radius: 10.0,
            lattice_angle: 0.0,
            pc_to_pc_same_frac: 0.5,
            pc_to_full_same_frac: 0.5,
            subst_overlap_dist_frac: 1.5,
            use_piece_edge_dist_frac: 0.5,
            add_overlap_frac: 0.8,
        }
    }
}
