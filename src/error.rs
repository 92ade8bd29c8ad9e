//! Fatal lowering errors.
//!
//! Recoverable ineligibility lives in [`crate::invariants::EligibilityViolation`];
//! everything here stops compilation of the affected operation.

use thiserror::Error;

use crate::distribution::Strategy;
use crate::op::OpKind;

/// Fatal errors raised by the tiling engine and distribution planner.
#[derive(Debug, Error)]
pub enum LoweringError {
    /// No split along any dimension makes the operation fit on-chip.
    #[error("no feasible tiling for {op}")]
    Infeasible { op: String },

    /// Strategy/kind combination the hardware cannot express.
    #[error("strategy {strategy:?} is unsupported for {kind:?}: {reason}")]
    UnsupportedStrategy {
        strategy: Strategy,
        kind: OpKind,
        reason: String,
    },

    /// No valid multi-cluster segmentation exists and the caller did not
    /// permit the single-cluster fallback.
    #[error("no valid segmentation for {strategy:?} over {clusters} clusters")]
    NoValidSegmentation { strategy: Strategy, clusters: usize },

    /// Generation/configuration mismatch (missing encoder, bad operand set).
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Encoded value out of the hardware field's range.
    #[error("value out of range for {field}: {value}")]
    ValueOutOfRange { field: &'static str, value: f64 },
}
