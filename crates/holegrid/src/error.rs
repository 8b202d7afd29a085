//! Result codes shared by every engine operation.
//!
//! The pipeline is expected to run inside a tight control loop, so failures
//! are discrete values rather than panics: callers report the code, adjust
//! parameters, and call again. There is no automatic retry inside the engine.

/// Errors returned by engine operations.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A working buffer could not be obtained. Previously allocated buffers
    /// are left in their last valid state.
    AllocationFailure {
        /// Size of the failed request in bytes.
        requested_bytes: usize,
    },
    /// Input sample format is not single-channel byte / integer / float.
    UnsupportedPixelFormat {
        /// Human-readable name of the rejected format.
        format: &'static str,
    },
    /// The requested reduction places the working image outside the source
    /// bounds, or the source buffer does not cover the stated dimensions.
    InvalidReductionGeometry {
        /// Source width in pixels.
        width: usize,
        /// Source height in pixels.
        height: usize,
        /// Requested reduction factor.
        reduction: f32,
    },
    /// An analysis operation was invoked before a successful `initialize`.
    NotInitialized,
    /// Averaged-template correlation was requested before any template was
    /// built.
    NoTemplateAvailable,
    /// Averaged-template correlation was requested with parameters that do
    /// not match the template on hand.
    TemplateParameterMismatch {
        /// Radius the averaged template was built for.
        expected_radius: f32,
        /// Radius requested by the caller.
        requested_radius: f32,
        /// Number of radii requested (must be 1 for averaged templates).
        num_radii: usize,
    },
    /// Cutoff reuse was requested before any cutoff had been computed.
    NoCutoffsAvailable,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllocationFailure { requested_bytes } => {
                write!(f, "buffer allocation of {} bytes failed", requested_bytes)
            }
            Self::UnsupportedPixelFormat { format } => {
                write!(f, "unsupported pixel format: {}", format)
            }
            Self::InvalidReductionGeometry {
                width,
                height,
                reduction,
            } => write!(
                f,
                "reduction {} of a {}x{} image leaves no valid working area",
                reduction, width, height
            ),
            Self::NotInitialized => write!(f, "engine used before initialize"),
            Self::NoTemplateAvailable => write!(f, "no averaged template has been built"),
            Self::TemplateParameterMismatch {
                expected_radius,
                requested_radius,
                num_radii,
            } => write!(
                f,
                "averaged template built for radius {:.2} cannot serve radius {:.2} ({} radii requested)",
                expected_radius, requested_radius, num_radii
            ),
            Self::NoCutoffsAvailable => {
                write!(f, "cutoff reuse requested before any cutoff was computed")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// Shorthand result type used across the crate.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_offending_parameters() {
        let err = EngineError::TemplateParameterMismatch {
            expected_radius: 8.0,
            requested_radius: 10.5,
            num_radii: 3,
        };
        let text = err.to_string();
        assert!(text.contains("8.00"), "missing expected radius: {}", text);
        assert!(text.contains("10.50"), "missing requested radius: {}", text);
    }
}
