//! Hardware invariant checker — pure validation against a profile.
//!
//! Every check is side-effect free and returns a tagged violation rather
//! than panicking: an ineligible operation is a normal outcome (the caller
//! tiles it or falls back to a software path). Genuinely malformed inputs
//! (wrong rank, negative dims) are programming errors and assert.

use thiserror::Error;

use crate::op::{OpDescriptor, OpKind, PadInfo};
use crate::profile::HardwareProfile;
use crate::sparsity::activation_window_bytes;
use crate::types::{align_up, AXIS_C};

/// Weights-table fields per output channel.
pub const WEIGHT_TABLE_FIELDS_PER_OC: i64 = 4;
/// Byte width of one weights-table field.
pub const WEIGHT_TABLE_FIELD_BYTES: i64 = 4;

/// Why an operation cannot run on the NCE as-is.
///
/// Always recoverable: the caller may tile, re-plan, or reject earlier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EligibilityViolation {
    #[error("batch size {n} unsupported, NCE executes single-batch tasks")]
    BatchNotSingular { n: i64 },

    #[error("kernel {axis} extent {size} outside [1, {max}]")]
    KernelOutOfBounds { axis: &'static str, size: i64, max: i64 },

    #[error("asymmetric strides {sy}x{sx} unsupported on this generation")]
    AsymmetricStrides { sy: i64, sx: i64 },

    #[error("stride {axis} value {size} outside [1, {max}]")]
    StrideOutOfBounds { axis: &'static str, size: i64, max: i64 },

    #[error("{side} padding {pad} exceeds half the kernel extent {kernel}")]
    UnsupportedPadding { side: &'static str, pad: i64, kernel: i64 },

    #[error("dilation {y}x{x} unsupported, hardware computes dense windows only")]
    UnsupportedDilation { y: i64, x: i64 },

    #[error("{operand} channel count {channels} not a multiple of {alignment}")]
    ChannelsMisaligned {
        operand: &'static str,
        channels: i64,
        alignment: i64,
    },

    #[error("depthwise requires one filter per input channel, got {filters_per_chan} filters and OC {oc} vs IC {ic}")]
    DepthwiseShape {
        filters_per_chan: i64,
        oc: i64,
        ic: i64,
    },

    #[error("eltwise input shapes differ: {lhs:?} vs {rhs:?}")]
    EltwiseShapeMismatch { lhs: [i64; 4], rhs: [i64; 4] },

    #[error("eltwise requires a second input operand")]
    EltwiseMissingInput,

    #[error("operation needs {required} bytes of CMX, capacity is {capacity}")]
    CmxBudgetExceeded { required: i64, capacity: i64 },
}

/// Validates operations against one hardware profile.
///
/// Borrows the profile; cheap to construct per pass.
pub struct InvariantChecker<'a> {
    profile: &'a HardwareProfile,
}

impl<'a> InvariantChecker<'a> {
    pub fn new(profile: &'a HardwareProfile) -> Self {
        InvariantChecker { profile }
    }

    #[inline]
    pub fn profile(&self) -> &HardwareProfile {
        self.profile
    }

    /// Full eligibility check: batch, kernel/stride/pad bounds, channel
    /// alignment, then CMX budget. Shape-level checks run first because the
    /// budget is only meaningful for an already-valid shape; the first
    /// violation short-circuits.
    pub fn is_eligible(&self, op: &OpDescriptor) -> Result<(), EligibilityViolation> {
        self.batch_is_singular(op)?;
        self.kernel_within_bounds(op)?;
        self.channels_aligned(op)?;
        self.fits_cmx_budget(op)?;
        log::trace!("{} eligible for {}", op.label(), self.profile.arch);
        Ok(())
    }

    /// The NCE task model is single-batch.
    pub fn batch_is_singular(&self, op: &OpDescriptor) -> Result<(), EligibilityViolation> {
        let n = op.output.batch();
        if n != 1 {
            return Err(EligibilityViolation::BatchNotSingular { n });
        }
        Ok(())
    }

    /// Kernel extent, stride, padding and dilation bounds.
    pub fn kernel_within_bounds(&self, op: &OpDescriptor) -> Result<(), EligibilityViolation> {
        let p = self.profile;
        let k = op.kernel;
        let s = op.stride;

        if k.y < 1 || k.y > p.max_kernel {
            return Err(EligibilityViolation::KernelOutOfBounds {
                axis: "height",
                size: k.y,
                max: p.max_kernel,
            });
        }
        if k.x < 1 || k.x > p.max_kernel {
            return Err(EligibilityViolation::KernelOutOfBounds {
                axis: "width",
                size: k.x,
                max: p.max_kernel,
            });
        }

        if s.y != s.x && !p.asymmetric_strides {
            return Err(EligibilityViolation::AsymmetricStrides { sy: s.y, sx: s.x });
        }
        if s.y < 1 || s.y > p.max_stride {
            return Err(EligibilityViolation::StrideOutOfBounds {
                axis: "height",
                size: s.y,
                max: p.max_stride,
            });
        }
        if s.x < 1 || s.x > p.max_stride {
            return Err(EligibilityViolation::StrideOutOfBounds {
                axis: "width",
                size: s.x,
                max: p.max_stride,
            });
        }

        check_pads(&op.pad, k.y, k.x)?;

        if op.dilation != (1, 1) {
            return Err(EligibilityViolation::UnsupportedDilation {
                y: op.dilation.0,
                x: op.dilation.1,
            });
        }
        Ok(())
    }

    /// Channel alignment per kind; depthwise and eltwise carry extra
    /// shape constraints.
    pub fn channels_aligned(&self, op: &OpDescriptor) -> Result<(), EligibilityViolation> {
        let alignment = self.profile.channel_alignment(op.input.elem.bits());
        let ic = op.input_channels();
        let oc = op.output_channels();

        match op.kind {
            OpKind::Conv | OpKind::CompressConv => {
                require_aligned("output", oc, alignment)?;
                require_aligned("input", ic, alignment)?;
            }
            OpKind::DepthwiseConv => {
                let filters_per_chan = op.filters_per_input_channel().unwrap_or(1);
                if filters_per_chan != 1 || oc != ic {
                    return Err(EligibilityViolation::DepthwiseShape {
                        filters_per_chan,
                        oc,
                        ic,
                    });
                }
                require_aligned("output", oc, alignment)?;
            }
            OpKind::MaxPool | OpKind::AvgPool => {
                require_aligned("input", ic, alignment)?;
            }
            OpKind::Eltwise => {
                let second = op
                    .second_input
                    .as_ref()
                    .ok_or(EligibilityViolation::EltwiseMissingInput)?;
                if second.shape != op.input.shape {
                    return Err(EligibilityViolation::EltwiseShapeMismatch {
                        lhs: op.input.shape,
                        rhs: second.shape,
                    });
                }
                require_aligned("input", ic, alignment)?;
                require_aligned("output", oc, alignment)?;
            }
        }
        Ok(())
    }

    /// CMX capacity check over all operands plus descriptor overhead.
    pub fn fits_cmx_budget(&self, op: &OpDescriptor) -> Result<(), EligibilityViolation> {
        let required = self.required_cmx_bytes(op);
        let capacity = self.profile.cmx_bytes;
        if required > capacity {
            log::trace!(
                "{} needs {required} of {capacity} CMX bytes",
                op.label()
            );
            return Err(EligibilityViolation::CmxBudgetExceeded { required, capacity });
        }
        Ok(())
    }

    /// Bytes of CMX the operation occupies: every operand, the weights
    /// table (4 x i32 per output channel), and the activation window for
    /// pooling/depthwise kinds. Depthwise weights are counted at their
    /// hardware-aligned footprint, not their logical shape.
    pub fn required_cmx_bytes(&self, op: &OpDescriptor) -> i64 {
        let alignment = self.profile.channel_alignment(op.input.elem.bits());
        let oc = op.output_channels();

        let mut required = op.input.byte_size() + op.output.byte_size();
        if let Some(second) = &op.second_input {
            required += second.byte_size();
        }
        if let Some(weights) = &op.weights {
            required += match op.kind {
                OpKind::DepthwiseConv => {
                    let filters_per_chan = weights.shape[AXIS_C];
                    let window = filters_per_chan * op.kernel.y * op.kernel.x;
                    let aligned = [oc, 1, 1, align_up(window, alignment)];
                    weights.byte_size_of(&aligned)
                }
                _ => weights.byte_size(),
            };
        }
        if let Some(bias) = &op.bias {
            required += bias.byte_size();
        }

        required += oc * WEIGHT_TABLE_FIELDS_PER_OC * WEIGHT_TABLE_FIELD_BYTES;

        if op.kind.needs_activation_window() {
            required += activation_window_bytes(
                op.kernel,
                op.stride,
                op.input.elem,
                op.input_channels(),
            );
        }
        required
    }
}

fn require_aligned(
    operand: &'static str,
    channels: i64,
    alignment: i64,
) -> Result<(), EligibilityViolation> {
    if channels % alignment != 0 {
        return Err(EligibilityViolation::ChannelsMisaligned {
            operand,
            channels,
            alignment,
        });
    }
    Ok(())
}

/// Pad rule, preserved exactly as the hardware accepts it: a pad fails iff
/// it is negative, or both exceeds 1 and exceeds half the kernel extent.
/// Pad of exactly 1 is always accepted ("same" padding at the boundary).
fn check_pads(pad: &PadInfo, ky: i64, kx: i64) -> Result<(), EligibilityViolation> {
    let sides = [
        ("top", pad.top, ky),
        ("bottom", pad.bottom, ky),
        ("left", pad.left, kx),
        ("right", pad.right, kx),
    ];
    for (side, value, kernel) in sides {
        if value < 0 || (value > 1 && value > kernel / 2) {
            return Err(EligibilityViolation::UnsupportedPadding {
                side,
                pad: value,
                kernel,
            });
        }
    }
    Ok(())
}

/// One-shot convenience wrapper over [`InvariantChecker::is_eligible`].
pub fn check_op(op: &OpDescriptor, profile: &HardwareProfile) -> Result<(), EligibilityViolation> {
    InvariantChecker::new(profile).is_eligible(op)
}

/// Pure alignment predicate, exposed for planners that reason about raw
/// channel counts.
#[inline]
pub fn channels_divisible(channels: i64, alignment: i64) -> bool {
    alignment > 0 && channels % alignment == 0
}
