//! holegrid — detector for regularly spaced support-film apertures in
//! low-magnification specimen-grid images.
//!
//! The pipeline stages are:
//!
//! 1. **Buffer** – input conversion, optional anti-aliased reduction, and
//!    FFT-friendly padding of the working buffers.
//! 2. **Edges** – Gaussian/median smoothing, gradient magnitude + quantized
//!    direction, non-maximum suppression, dual-threshold hysteresis.
//! 3. **Correlate** – FFT cross-correlation against synthetic ring or
//!    averaged templates over a scanned range of radii, with spaced peak
//!    extraction.
//! 4. **Lattice** – neighbor graph construction, lattice vector estimation,
//!    integer grid propagation, and robust prediction of missing nodes.
//! 5. **Stats** – median/MADN outlier rejection over per-point local
//!    intensity statistics.
//! 6. **Sequence** – a resumable state machine scanning smoothing/threshold
//!    combinations and rescuing weak-edge detections.
//! 7. **Montage** – reconciliation of per-tile detections into one global
//!    point set.
//!
//! # Public API
//! [`HoleFinder`] is the stateful engine instance; [`HoleSequence`] drives a
//! full parameter scan one combination per call; [`resolve_piece_positions`]
//! merges montage tiles. The forward/inverse spectrum primitive is injected
//! through [`SpectrumTransform`], with [`RustFftTransform`] as the default.

mod buffer;
mod config;
mod correlate;
mod edges;
mod engine;
mod error;
mod lattice;
mod montage;
mod sequence;
mod spectrum;
mod stats;
mod template;

#[cfg(test)]
pub(crate) mod test_utils;

pub use buffer::{GraySamples, WorkingImage};
pub use config::{
    CacheFlags, CircleSearchParams, InitParams, LatticeParams, MontageParams, PruneParams,
    SequenceParams,
};
pub use correlate::{CircleFinding, RadiusScanReport};
pub use edges::{EdgeClass, EdgeStats};
pub use engine::HoleFinder;
pub use error::{EngineError, EngineResult};
pub use lattice::{
    analyze_neighbors, LatticeAnalysis, LatticeGeometry, NeighborConnection, StepVector,
};
pub use montage::{resolve_piece_positions, MontagePiece, MontageResolution};
pub use sequence::{ComboSummary, HoleSequence, SequenceOutcome, SequenceProgress};
pub use spectrum::{RustFftTransform, SpectrumTransform};
pub use stats::{
    apply_cutoffs, compute_cutoffs, remove_outliers, CutoffRange, OutlierCounts, RegionStats,
};

/// A detected hole center in original-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DetectedPoint {
    /// X coordinate (original-image pixels).
    pub x: f64,
    /// Y coordinate (original-image pixels).
    pub y: f64,
    /// Correlation peak magnitude against a unit-norm template; a confidence
    /// proxy comparable across radii within one image.
    pub peak: f32,
}

impl DetectedPoint {
    /// Euclidean distance to another point.
    pub fn distance_to(&self, other: &DetectedPoint) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }

    /// Euclidean distance to a raw position.
    pub fn distance_to_xy(&self, xy: [f64; 2]) -> f64 {
        let dx = self.x - xy[0];
        let dy = self.y - xy[1];
        (dx * dx + dy * dy).sqrt()
    }
}
