//! Operation descriptors — the value form of one candidate NCE task.
//!
//! The external graph builds these; this core never mutates the graph, it
//! only derives attributes (plans, tiles, descriptor blobs) from the values.

use crate::types::{Shape, TensorDescriptor, AXIS_C, AXIS_H, AXIS_W};

/// The closed set of operation kinds the NCE executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Conv,
    DepthwiseConv,
    /// Convolution with channel-compressed weights (running per-channel
    /// weight offsets instead of a fixed stride).
    CompressConv,
    MaxPool,
    AvgPool,
    Eltwise,
}

impl OpKind {
    /// Kinds that consume an activation window (fake sparsity) blob.
    #[inline]
    pub const fn needs_activation_window(self) -> bool {
        matches!(
            self,
            OpKind::DepthwiseConv | OpKind::MaxPool | OpKind::AvgPool
        )
    }

    /// Kinds that carry a weights operand.
    #[inline]
    pub const fn has_weights(self) -> bool {
        matches!(
            self,
            OpKind::Conv | OpKind::DepthwiseConv | OpKind::CompressConv
        )
    }

    /// Convolution-class kinds (spatial splits need height alignment on
    /// generations with legacy segmentation).
    #[inline]
    pub const fn is_conv_class(self) -> bool {
        matches!(
            self,
            OpKind::Conv | OpKind::DepthwiseConv | OpKind::CompressConv
        )
    }
}

/// Kernel extent, (y, x).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSize {
    pub y: i64,
    pub x: i64,
}

/// Stride, (y, x).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    pub y: i64,
    pub x: i64,
}

/// Explicit padding on all four sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadInfo {
    pub top: i64,
    pub bottom: i64,
    pub left: i64,
    pub right: i64,
}

impl PadInfo {
    pub const fn none() -> Self {
        PadInfo { top: 0, bottom: 0, left: 0, right: 0 }
    }

    pub const fn same(pad: i64) -> Self {
        PadInfo { top: pad, bottom: pad, left: pad, right: pad }
    }
}

/// One candidate hardware operation in value form.
///
/// `weights` is present for convolution-class kinds; `second_input` only for
/// `Eltwise`. Weight shapes are `[OC, IC/groups, KY, KX]`.
#[derive(Debug, Clone)]
pub struct OpDescriptor {
    pub kind: OpKind,
    pub input: TensorDescriptor,
    pub second_input: Option<TensorDescriptor>,
    pub weights: Option<TensorDescriptor>,
    pub bias: Option<TensorDescriptor>,
    pub output: TensorDescriptor,
    pub kernel: KernelSize,
    pub stride: Strides,
    pub pad: PadInfo,
    pub dilation: (i64, i64),
    pub group_count: i64,
    /// Optional post-op clamp applied by the PPE, (low, high).
    pub clamp: Option<(i32, i32)>,
}

impl OpDescriptor {
    /// Bare descriptor with unit kernel/stride and no padding; builders
    /// below fill in the kind-specific pieces.
    pub fn new(kind: OpKind, input: TensorDescriptor, output: TensorDescriptor) -> Self {
        OpDescriptor {
            kind,
            input,
            second_input: None,
            weights: None,
            bias: None,
            output,
            kernel: KernelSize { y: 1, x: 1 },
            stride: Strides { y: 1, x: 1 },
            pad: PadInfo::none(),
            dilation: (1, 1),
            group_count: 1,
            clamp: None,
        }
    }

    pub fn with_weights(mut self, weights: TensorDescriptor) -> Self {
        self.weights = Some(weights);
        self
    }

    pub fn with_bias(mut self, bias: TensorDescriptor) -> Self {
        self.bias = Some(bias);
        self
    }

    pub fn with_second_input(mut self, second: TensorDescriptor) -> Self {
        self.second_input = Some(second);
        self
    }

    pub fn with_kernel(mut self, y: i64, x: i64) -> Self {
        self.kernel = KernelSize { y, x };
        self
    }

    pub fn with_stride(mut self, y: i64, x: i64) -> Self {
        self.stride = Strides { y, x };
        self
    }

    pub fn with_pad(mut self, pad: PadInfo) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_groups(mut self, groups: i64) -> Self {
        self.group_count = groups;
        self
    }

    #[inline]
    pub fn output_channels(&self) -> i64 {
        self.output.shape[AXIS_C]
    }

    #[inline]
    pub fn input_channels(&self) -> i64 {
        self.input.shape[AXIS_C]
    }

    /// Filters per input channel for grouped convolution.
    /// Weight shape is `[OC, IC/groups, KY, KX]`.
    #[inline]
    pub fn filters_per_input_channel(&self) -> Option<i64> {
        self.weights.as_ref().map(|w| w.shape[AXIS_C])
    }

    /// Short human label used in diagnostics.
    pub fn label(&self) -> String {
        format!("{:?} {} -> {}", self.kind, self.input, self.output)
    }
}

/// Output extent of a strided window along one spatial dimension.
#[inline]
pub fn conv_output_dim(input: i64, kernel: i64, stride: i64, pad_before: i64, pad_after: i64) -> i64 {
    (input - kernel + pad_before + pad_after) / stride + 1
}

/// Full output shape implied by an op's input/kernel/stride/pad.
pub fn conv_output_shape(op: &OpDescriptor) -> Shape {
    let mut shape = op.output.shape;
    shape[AXIS_H] = conv_output_dim(
        op.input.shape[AXIS_H],
        op.kernel.y,
        op.stride.y,
        op.pad.top,
        op.pad.bottom,
    );
    shape[AXIS_W] = conv_output_dim(
        op.input.shape[AXIS_W],
        op.kernel.x,
        op.stride.x,
        op.pad.left,
        op.pad.right,
    );
    shape
}
