//! Multi-cluster distribution planning.
//!
//! For a chosen parallelization strategy the planner derives, per operand,
//! the per-cluster compute and memory shapes/offsets, the distribution mode
//! bitmask, and the alignment the binary writer attaches to each task.
//! Compute shapes always partition the tensor along the split axis; memory
//! shapes may overlap neighbors (halo) or duplicate the whole tensor.

use bitflags::bitflags;

use crate::error::LoweringError;
use crate::op::{OpDescriptor, OpKind, PadInfo};
use crate::profile::HardwareProfile;
use crate::tiling::back_infer_dim;
use crate::types::{align_down, align_up, div_ceil, Shape, AXIS_C, AXIS_H, AXIS_N, AXIS_W};

bitflags! {
    /// How a cluster's slice relates to the full tensor. Modes combine:
    /// `DUPLICATED | SEGMENTED` broadcasts the data but assigns disjoint
    /// compute regions, `MULTICASTED | SEGMENTED` writes each segment to
    /// every cluster.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DistributionMode: u8 {
        const SEGMENTED  = 0b0001;
        const DUPLICATED = 0b0010;
        const OVERLAPPED = 0b0100;
        const MULTICASTED = 0b1000;
    }
}

/// Multi-cluster parallelization strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    Clustering,
    SplitOverHeight,
    SplitOverHeightOverlapped,
    SplitOverKernel,
    SplitOverWidth,
    SplitOverBatch,
    HKSwitch,
}

/// Which operand of the operation a plan describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandRole {
    Activation,
    Weights,
    WeightsTable,
    ActivationWindow,
    Output,
}

/// Per-operand distribution across clusters.
#[derive(Debug, Clone, PartialEq)]
pub struct DistributionPlan {
    pub strategy: Strategy,
    pub num_clusters: usize,
    pub mode: DistributionMode,
    /// Cluster count along each axis (at most one axis > 1).
    pub num_tiles: Shape,
    pub compute_shapes: Vec<Shape>,
    pub compute_offsets: Vec<Shape>,
    pub memory_shapes: Vec<Shape>,
    pub memory_offsets: Vec<Shape>,
    /// Per-cluster padding for overlapped activations.
    pub per_cluster_pads: Option<Vec<PadInfo>>,
    pub alignment: Option<Shape>,
}

impl DistributionPlan {
    /// Full tensor on every cluster, zero offsets.
    fn duplicated(strategy: Strategy, n: usize, shape: Shape, alignment: Option<Shape>) -> Self {
        DistributionPlan {
            strategy,
            num_clusters: n,
            mode: DistributionMode::DUPLICATED,
            num_tiles: [1, 1, 1, 1],
            compute_shapes: vec![shape; n],
            compute_offsets: vec![[0; 4]; n],
            memory_shapes: vec![shape; n],
            memory_offsets: vec![[0; 4]; n],
            per_cluster_pads: None,
            alignment,
        }
    }
}

/// Plans for every operand of one operation.
#[derive(Debug, Clone)]
pub struct OperandPlans {
    pub activation: DistributionPlan,
    pub weights: Option<DistributionPlan>,
    pub weights_table: Option<DistributionPlan>,
    pub activation_window: Option<DistributionPlan>,
    pub output: DistributionPlan,
}

/// Derives per-cluster plans from a hardware profile.
pub struct DistributionPlanner<'a> {
    profile: &'a HardwareProfile,
}

impl<'a> DistributionPlanner<'a> {
    pub fn new(profile: &'a HardwareProfile) -> Self {
        DistributionPlanner { profile }
    }

    /// Plan every operand for `strategy`. When no valid segmentation exists
    /// across `num_clusters -> 1` and `allow_fallback` is set, the whole
    /// operation degrades to single-cluster Clustering; otherwise the
    /// failure is fatal.
    pub fn plan_op(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        allow_fallback: bool,
    ) -> Result<OperandPlans, LoweringError> {
        if strategy == Strategy::SplitOverKernel && op.kind == OpKind::CompressConv {
            // Compressed weights track running per-channel offsets; a
            // channel segmentation would break every cluster's pointers.
            return Err(LoweringError::UnsupportedStrategy {
                strategy,
                kind: op.kind,
                reason: "compressed weights cannot be channel-segmented".into(),
            });
        }

        let effective = match self.segmentation_clusters(op, strategy) {
            Some(n) => (strategy, n),
            None if allow_fallback => {
                log::debug!(
                    "{}: no valid {strategy:?} segmentation, falling back to Clustering",
                    op.label()
                );
                (Strategy::Clustering, 1)
            }
            None => {
                return Err(LoweringError::NoValidSegmentation {
                    strategy,
                    clusters: self.profile.num_clusters,
                })
            }
        };
        let (strategy, n) = effective;

        let activation = self.plan_operand(op, strategy, OperandRole::Activation, n)?;
        let weights = op
            .weights
            .as_ref()
            .map(|_| self.plan_operand(op, strategy, OperandRole::Weights, n))
            .transpose()?;
        let weights_table = op
            .weights
            .as_ref()
            .map(|_| self.plan_operand(op, strategy, OperandRole::WeightsTable, n))
            .transpose()?;
        let activation_window = op
            .kind
            .needs_activation_window()
            .then(|| self.plan_operand(op, strategy, OperandRole::ActivationWindow, n))
            .transpose()?;
        let output = self.plan_operand(op, strategy, OperandRole::Output, n)?;

        Ok(OperandPlans {
            activation,
            weights,
            weights_table,
            activation_window,
            output,
        })
    }

    /// Cluster count a strategy can actually use for this operation, or
    /// `None` when no count in `[2, num_clusters]` yields a legal split.
    fn segmentation_clusters(&self, op: &OpDescriptor, strategy: Strategy) -> Option<usize> {
        let avail = self.profile.num_clusters;
        match strategy {
            Strategy::Clustering => Some(avail),
            Strategy::SplitOverKernel => {
                let n = self.clusters_for_sok(op.output_channels());
                (n > 1).then_some(n)
            }
            Strategy::SplitOverHeight
            | Strategy::SplitOverHeightOverlapped
            | Strategy::HKSwitch => {
                let h_align = self.soh_height_alignment(op, avail);
                (2..=avail)
                    .rev()
                    .find(|&n| self.is_soh_supported(op.input.shape[AXIS_H], n, h_align))
            }
            Strategy::SplitOverWidth => {
                let w = op.input.shape[AXIS_W];
                (2..=avail)
                    .rev()
                    .find(|&n| w - div_ceil(w, n as i64) * (n as i64 - 1) > 0)
            }
            Strategy::SplitOverBatch => {
                let batch = op.input.shape[AXIS_N];
                (batch >= 2).then(|| avail.min(batch as usize))
            }
        }
    }

    /// Per-operand plan. `n` is the cluster count already validated by
    /// [`Self::segmentation_clusters`].
    pub fn plan_operand(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        role: OperandRole,
        n: usize,
    ) -> Result<DistributionPlan, LoweringError> {
        match role {
            OperandRole::Activation => self.plan_activation(op, strategy, n),
            OperandRole::Weights => self.plan_weights(op, strategy, n),
            OperandRole::WeightsTable => self.plan_weights_table(op, strategy, n),
            OperandRole::ActivationWindow => Ok(self.plan_activation_window(op, strategy, n)),
            OperandRole::Output => self.plan_output(op, strategy, n),
        }
    }

    // ---- Activation ----

    fn plan_activation(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        n: usize,
    ) -> Result<DistributionPlan, LoweringError> {
        let shape = op.input.shape;
        let alignment_unit = self.profile.channel_alignment(op.input.elem.bits());

        match strategy {
            Strategy::Clustering => Ok(DistributionPlan::duplicated(
                strategy,
                n,
                shape,
                Some([1, alignment_unit, 1, 1]),
            )),
            Strategy::SplitOverHeight | Strategy::HKSwitch => {
                let h_align = self.soh_height_alignment(op, n);
                let mut plan = self.segmented_plan(strategy, shape, AXIS_H, n, h_align)?;
                plan.alignment = self.soh_activation_alignment(op, h_align);
                Ok(plan)
            }
            Strategy::SplitOverHeightOverlapped => {
                self.overlapped_plan(op, strategy, n, AXIS_H)
            }
            Strategy::SplitOverWidth => self.overlapped_plan(op, strategy, n, AXIS_W),
            Strategy::SplitOverBatch => self.segmented_plan(strategy, shape, AXIS_N, n, 1),
            Strategy::SplitOverKernel => {
                if sok_segments_input(op.kind) {
                    let mut plan =
                        self.segmented_plan(strategy, shape, AXIS_C, n, alignment_unit)?;
                    plan.alignment = Some([1, alignment_unit, 1, 1]);
                    Ok(plan)
                } else {
                    // Convolution reads all input channels on every cluster.
                    Ok(DistributionPlan::duplicated(
                        strategy,
                        n,
                        shape,
                        Some([1, alignment_unit, 1, 1]),
                    ))
                }
            }
        }
    }

    // ---- Weights / weights table ----

    fn plan_weights(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        n: usize,
    ) -> Result<DistributionPlan, LoweringError> {
        let weights = op.weights.as_ref().expect("weights plan without weights");
        let shape = weights.shape;
        let alignment_unit = self.profile.channel_alignment(weights.elem.bits());

        if strategy == Strategy::SplitOverKernel {
            // Weight shape is [OC, IC/g, KY, KX]: the output-channel axis
            // is the leading one.
            let mut plan = self.segmented_plan(strategy, shape, AXIS_N, n, alignment_unit)?;
            plan.alignment = Some([alignment_unit, 1, 1, 1]);
            Ok(plan)
        } else {
            Ok(DistributionPlan::duplicated(strategy, n, shape, None))
        }
    }

    fn plan_weights_table(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        n: usize,
    ) -> Result<DistributionPlan, LoweringError> {
        // One 4-field record per output channel.
        let shape: Shape = [op.output_channels(), 1, 1, 4];
        if strategy == Strategy::SplitOverKernel {
            let alignment_unit = self.profile.channel_alignment(op.input.elem.bits());
            self.segmented_plan(strategy, shape, AXIS_N, n, alignment_unit)
        } else {
            Ok(DistributionPlan::duplicated(strategy, n, shape, None))
        }
    }

    fn plan_activation_window(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        n: usize,
    ) -> DistributionPlan {
        let bytes = crate::sparsity::activation_window_bytes(
            op.kernel,
            op.stride,
            op.input.elem,
            op.input_channels(),
        );
        DistributionPlan::duplicated(strategy, n, [1, 1, 1, bytes.max(1)], None)
    }

    // ---- Output ----

    fn plan_output(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        n: usize,
    ) -> Result<DistributionPlan, LoweringError> {
        let shape = op.output.shape;
        let alignment_unit = self.profile.channel_alignment(op.output.elem.bits());

        match strategy {
            Strategy::Clustering => Ok(DistributionPlan::duplicated(strategy, n, shape, None)),
            Strategy::SplitOverHeight | Strategy::SplitOverHeightOverlapped => {
                let mut plan = self.segmented_plan(strategy, shape, AXIS_H, n, 1)?;
                plan.alignment = self.soh_activation_alignment(op, self.soh_height_alignment(op, n));
                Ok(plan)
            }
            Strategy::SplitOverWidth => self.segmented_plan(strategy, shape, AXIS_W, n, 1),
            Strategy::SplitOverBatch => self.segmented_plan(strategy, shape, AXIS_N, n, 1),
            Strategy::SplitOverKernel => {
                let mut plan = self.segmented_plan(strategy, shape, AXIS_C, n, alignment_unit)?;
                if !self.profile.uniform_segments {
                    // Legacy generations broadcast the full output while
                    // each cluster computes its channel segment.
                    plan.mode = DistributionMode::DUPLICATED | DistributionMode::SEGMENTED;
                    plan.memory_shapes = vec![shape; n];
                    plan.memory_offsets = vec![[0; 4]; n];
                }
                plan.alignment = Some([1, alignment_unit, 1, 1]);
                Ok(plan)
            }
            Strategy::HKSwitch => {
                let mut plan = self.segmented_plan(strategy, shape, AXIS_H, n, 1)?;
                plan.mode = DistributionMode::MULTICASTED | DistributionMode::SEGMENTED;
                plan.memory_shapes = vec![shape; n];
                plan.memory_offsets = vec![[0; 4]; n];
                Ok(plan)
            }
        }
    }

    // ---- Split primitives ----

    /// Segmented plan along one axis: compute and memory shapes coincide.
    fn segmented_plan(
        &self,
        strategy: Strategy,
        shape: Shape,
        axis: usize,
        n: usize,
        axis_alignment: i64,
    ) -> Result<DistributionPlan, LoweringError> {
        let segments = split_segmented(
            shape[axis],
            n,
            axis_alignment,
            self.profile.uniform_segments,
        )
        .ok_or(LoweringError::NoValidSegmentation {
            strategy,
            clusters: n,
        })?;

        let mut num_tiles = [1, 1, 1, 1];
        num_tiles[axis] = n as i64;

        let mut compute_shapes = Vec::with_capacity(n);
        let mut compute_offsets = Vec::with_capacity(n);
        let mut offset = 0;
        for &size in &segments {
            let mut s = shape;
            s[axis] = size;
            let mut o = [0; 4];
            o[axis] = offset;
            compute_shapes.push(s);
            compute_offsets.push(o);
            offset += size;
        }

        Ok(DistributionPlan {
            strategy,
            num_clusters: n,
            mode: DistributionMode::SEGMENTED,
            num_tiles,
            memory_shapes: compute_shapes.clone(),
            memory_offsets: compute_offsets.clone(),
            compute_shapes,
            compute_offsets,
            per_cluster_pads: None,
            alignment: None,
        })
    }

    /// Overlapped activation plan: compute shapes segment the input, memory
    /// shapes carry the halo each cluster needs to produce its output rows
    /// (or columns) without cross-cluster reads.
    fn overlapped_plan(
        &self,
        op: &OpDescriptor,
        strategy: Strategy,
        n: usize,
        axis: usize,
    ) -> Result<DistributionPlan, LoweringError> {
        debug_assert!(axis == AXIS_H || axis == AXIS_W);
        let shape = op.input.shape;
        let (kernel, stride, pad_before, pad_after) = if axis == AXIS_H {
            (op.kernel.y, op.stride.y, op.pad.top, op.pad.bottom)
        } else {
            (op.kernel.x, op.stride.x, op.pad.left, op.pad.right)
        };

        // Segment the produced extent, then back-infer what each cluster
        // must hold.
        let out_extent = (shape[axis] - kernel + pad_before + pad_after) / stride + 1;
        let out_segments = split_segmented(out_extent, n, 1, self.profile.uniform_segments)
            .ok_or(LoweringError::NoValidSegmentation { strategy, clusters: n })?;

        let mut plan = self.segmented_plan(strategy, shape, axis, n, 1)?;
        plan.mode = DistributionMode::OVERLAPPED;

        let mut pads = Vec::with_capacity(n);
        let mut out_offset = 0;
        for (i, &out_size) in out_segments.iter().enumerate() {
            let (in_off, in_size, clip_before, clip_after) = back_infer_dim(
                out_offset,
                out_size,
                shape[axis],
                kernel,
                stride,
                pad_before,
            );
            plan.memory_shapes[i][axis] = in_size;
            plan.memory_offsets[i][axis] = in_off;
            let mut pad = PadInfo {
                top: 0,
                bottom: 0,
                left: op.pad.left,
                right: op.pad.right,
            };
            if axis == AXIS_H {
                pad.top = clip_before;
                pad.bottom = clip_after;
            } else {
                pad.left = clip_before;
                pad.right = clip_after;
                pad.top = op.pad.top;
                pad.bottom = op.pad.bottom;
            }
            pads.push(pad);
            out_offset += out_size;
        }
        plan.per_cluster_pads = Some(pads);
        Ok(plan)
    }

    // ---- SplitOverKernel helpers ----

    /// Cluster count for SOK: the largest count `<= num_clusters` whose
    /// channel segments stay multiples of the alignment unit. Legacy
    /// generations need the first `n-1` segments equal and aligned with a
    /// positive remainder; uniform-segment generations need an aligned
    /// baseline with an aligned remainder to spread.
    pub fn clusters_for_sok(&self, output_channels: i64) -> usize {
        let unit = 16;
        for n in (1..=self.profile.num_clusters as i64).rev() {
            if self.profile.uniform_segments {
                let base = align_down(output_channels / n, unit);
                if base > 0 && (output_channels - base * n) % unit == 0 {
                    return n as usize;
                }
            } else {
                let segment = align_up(div_ceil(output_channels, n), unit);
                if output_channels - (n - 1) * segment > 0 {
                    return n as usize;
                }
            }
        }
        1
    }

    // ---- SplitOverHeight helpers ----

    /// Per-cluster height alignment for SOH on this operation. Uniform
    /// generations and non-conv-class kinds split freely; legacy
    /// convolution-class splits must keep each cluster's rows an exact
    /// multiple of the data-packing quantum in flattened elements.
    fn soh_height_alignment(&self, op: &OpDescriptor, n: usize) -> i64 {
        if self.profile.uniform_segments || !op.kind.is_conv_class()
            || op.kind == OpKind::DepthwiseConv
        {
            return 1;
        }
        let derived = soh_height_alignment_for_width(
            op.input.shape[AXIS_W],
            op.input.sparse,
        );
        soh_minimal_height_alignment(
            op.input.shape[AXIS_H],
            n as i64,
            derived,
            spatial_quantum(op.input.sparse),
            op.input.shape[AXIS_W],
        )
    }

    /// Height alignment attribute propagated to the task, when the split
    /// needed one.
    fn soh_activation_alignment(&self, op: &OpDescriptor, h_align: i64) -> Option<Shape> {
        (!self.profile.uniform_segments && op.kind.is_conv_class() && h_align > 1)
            .then_some([1, 1, h_align, 1])
    }

    /// Legal iff the last cluster keeps at least one row. Uniform-segment
    /// generations balance instead of aligning, so any count works.
    pub fn is_soh_supported(&self, height: i64, n: usize, h_align: i64) -> bool {
        if self.profile.uniform_segments {
            return height >= n as i64;
        }
        let per_cluster = align_up(div_ceil(height, n as i64), h_align);
        height - per_cluster * (n as i64 - 1) > 0
    }
}

/// Kinds whose input channels track the output channels, so SOK segments
/// the activation too instead of duplicating it.
fn sok_segments_input(kind: OpKind) -> bool {
    matches!(
        kind,
        OpKind::DepthwiseConv | OpKind::MaxPool | OpKind::AvgPool | OpKind::Eltwise
    )
}

/// Hardware data-packing quantum in flattened spatial elements.
#[inline]
pub fn spatial_quantum(sparse: bool) -> i64 {
    if sparse { 8 } else { 4 }
}

/// Rows-per-cluster alignment implied by the tensor width: the quantum
/// divided by the largest power-of-two width divisor, or the full quantum
/// when the width shares no factor with it.
pub fn soh_height_alignment_for_width(width: i64, sparse: bool) -> i64 {
    let quantum = spatial_quantum(sparse);
    let mut width_align = quantum;
    while width_align > 1 {
        if width % width_align == 0 {
            return quantum / width_align;
        }
        width_align /= 2;
    }
    quantum
}

/// Smallest power-of-two alignment below `derived` that still lands every
/// non-last cluster on a quantum boundary, else `derived` itself.
pub fn soh_minimal_height_alignment(
    height: i64,
    n: i64,
    derived: i64,
    quantum: i64,
    width: i64,
) -> i64 {
    let mut alignment = 1;
    while alignment < derived {
        let per_cluster = align_up(div_ceil(height, n), alignment);
        if per_cluster * width % quantum == 0 {
            return alignment;
        }
        alignment *= 2;
    }
    derived
}

/// Split `extent` into `n` aligned segments.
///
/// Legacy: first `n-1` segments equal `align_up(ceil(extent/n), align)`,
/// the last absorbs the remainder (must stay positive). Uniform: an aligned
/// baseline per cluster with the remainder spread in alignment-unit chunks
/// from the first cluster, balanced within one unit.
pub fn split_segmented(extent: i64, n: usize, align: i64, uniform: bool) -> Option<Vec<i64>> {
    let n = n as i64;
    debug_assert!(n >= 1 && align >= 1);
    if n == 1 {
        return (extent > 0).then(|| vec![extent]);
    }
    if uniform {
        let base = align_down(extent / n, align);
        let remainder = extent - base * n;
        if base <= 0 || remainder % align != 0 {
            return None;
        }
        let chunks = remainder / align;
        Some(
            (0..n)
                .map(|i| base + align * i64::from(i < chunks))
                .collect(),
        )
    } else {
        let segment = align_up(div_ceil(extent, n), align);
        let last = extent - segment * (n - 1);
        if last <= 0 {
            return None;
        }
        let mut out = vec![segment; (n - 1) as usize];
        out.push(last);
        Some(out)
    }
}

/// Alignment propagation through a slice along the aligned axis: rescale
/// by the slice ratio, or drop the alignment entirely when the extents do
/// not divide evenly.
pub fn slice_alignment(alignment: Shape, in_shape: Shape, slice_shape: Shape) -> Option<Shape> {
    let Some(axis) = (0..4).find(|&a| alignment[a] > 1) else {
        return Some(alignment);
    };
    if slice_shape[axis] == in_shape[axis] {
        return Some(alignment);
    }
    if in_shape[axis] % slice_shape[axis] != 0 {
        return None;
    }
    let scale = in_shape[axis] / slice_shape[axis];
    if alignment[axis] % scale != 0 {
        return None;
    }
    let mut out = alignment;
    out[axis] /= scale;
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElemType, TensorDescriptor};

    fn conv(ic: i64, oc: i64, h: i64, w: i64) -> OpDescriptor {
        let input = TensorDescriptor::new([1, ic, h, w], ElemType::U8);
        let weights = TensorDescriptor::new([oc, ic, 3, 3], ElemType::U8);
        let output = TensorDescriptor::new([1, oc, h, w], ElemType::U8);
        OpDescriptor::new(OpKind::Conv, input, output)
            .with_weights(weights)
            .with_kernel(3, 3)
            .with_pad(PadInfo::same(1))
    }

    #[test]
    fn test_split_segmented_legacy_monotonic() {
        // 10 rows over 4 clusters: ceil -> 3,3,3,1.
        assert_eq!(split_segmented(10, 4, 1, false), Some(vec![3, 3, 3, 1]));
        // Aligned channel split: 48 over 3 at align 16.
        assert_eq!(split_segmented(48, 3, 16, false), Some(vec![16, 16, 16]));
        // 48 over 4 aligned 16 leaves nothing for the last cluster.
        assert_eq!(split_segmented(48, 4, 16, false), None);
    }

    #[test]
    fn test_split_segmented_uniform_balanced() {
        // Balanced within one element.
        assert_eq!(split_segmented(10, 4, 1, true), Some(vec![3, 3, 2, 2]));
        // 96 channels over 4 at align 16: 32,32,16,16.
        assert_eq!(split_segmented(96, 4, 16, true), Some(vec![32, 32, 16, 16]));
    }

    #[test]
    fn test_sok_cluster_choice_legacy() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        // 64 channels over 4 clusters: 16 each.
        assert_eq!(planner.clusters_for_sok(64), 4);
        // 48 channels: 4 clusters would starve the last; use 3.
        assert_eq!(planner.clusters_for_sok(48), 3);
        // 16 channels cannot be split at all.
        assert_eq!(planner.clusters_for_sok(16), 1);
    }

    #[test]
    fn test_sok_cluster_choice_uniform() {
        let profile = HardwareProfile::mtl(); // 2 clusters, uniform
        let planner = DistributionPlanner::new(&profile);
        assert_eq!(planner.clusters_for_sok(64), 2);
        assert_eq!(planner.clusters_for_sok(16), 1);
    }

    #[test]
    fn test_clustering_duplicates_everything() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(64, 64, 16, 16);

        let plans = planner.plan_op(&op, Strategy::Clustering, false).unwrap();
        assert_eq!(plans.activation.mode, DistributionMode::DUPLICATED);
        assert_eq!(plans.output.mode, DistributionMode::DUPLICATED);
        assert!(plans.activation.memory_shapes.iter().all(|s| *s == op.input.shape));
        assert_eq!(plans.activation.num_tiles, [1, 1, 1, 1]);
    }

    #[test]
    fn test_soh_partitions_height() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(64, 64, 32, 16);

        let plans = planner.plan_op(&op, Strategy::SplitOverHeight, false).unwrap();
        let act = &plans.activation;
        assert_eq!(act.mode, DistributionMode::SEGMENTED);
        assert_eq!(act.num_tiles, [1, 1, 4, 1]);

        let heights: Vec<i64> = act.compute_shapes.iter().map(|s| s[AXIS_H]).collect();
        assert_eq!(heights.iter().sum::<i64>(), 32);
        // Legacy segments never grow toward the tail.
        assert!(heights.windows(2).all(|p| p[0] >= p[1]), "{heights:?}");

        // Output splits the same way.
        let out_h: Vec<i64> = plans.output.compute_shapes.iter().map(|s| s[AXIS_H]).collect();
        assert_eq!(out_h.iter().sum::<i64>(), 32);
    }

    #[test]
    fn test_soh_height_alignment_from_width() {
        // Width 16 is quantum-divisible: rows align freely.
        assert_eq!(soh_height_alignment_for_width(16, false), 1);
        // Odd width: every cluster needs quantum-many rows.
        assert_eq!(soh_height_alignment_for_width(15, false), 4);
        // Width divisible by 2 but not 4.
        assert_eq!(soh_height_alignment_for_width(6, false), 2);
        // Sparse doubles the quantum.
        assert_eq!(soh_height_alignment_for_width(15, true), 8);
    }

    #[test]
    fn test_soh_minimal_height_alignment() {
        // 64 rows over 4 clusters, width 6, quantum 4: per-cluster 16 rows,
        // 16*6 = 96 % 4 == 0 already at alignment 1.
        assert_eq!(soh_minimal_height_alignment(64, 4, 2, 4, 6), 1);
        // 10 rows over 4 clusters, width 15: 3*15 not quantum aligned,
        // alignment 2 -> 4 rows, 4*15 = 60 % 4 == 0.
        assert_eq!(soh_minimal_height_alignment(10, 4, 4, 4, 15), 2);
    }

    #[test]
    fn test_soh_legality() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        // 32 rows over 4 clusters, alignment 1: fine.
        assert!(planner.is_soh_supported(32, 4, 1));
        // 9 rows over 4 clusters aligned 4: 4*3 = 12 >= 9, last starves.
        assert!(!planner.is_soh_supported(9, 4, 4));

        let mtl = HardwareProfile::mtl();
        let planner = DistributionPlanner::new(&mtl);
        assert!(planner.is_soh_supported(9, 2, 4));
    }

    #[test]
    fn test_soh_overlapped_halo() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(16, 16, 32, 16);

        let plans = planner
            .plan_op(&op, Strategy::SplitOverHeightOverlapped, false)
            .unwrap();
        let act = &plans.activation;
        assert_eq!(act.mode, DistributionMode::OVERLAPPED);

        // Output rows 0..8 need input rows 0..9 (top pad clipped).
        assert_eq!(act.memory_offsets[0][AXIS_H], 0);
        assert_eq!(act.memory_shapes[0][AXIS_H], 9);
        // Interior cluster 1: output rows 8..16 -> input rows 7..17.
        assert_eq!(act.memory_offsets[1][AXIS_H], 7);
        assert_eq!(act.memory_shapes[1][AXIS_H], 10);
        // Last cluster keeps the bottom pad.
        let pads = act.per_cluster_pads.as_ref().unwrap();
        assert_eq!(pads[0].top, 1);
        assert_eq!(pads[0].bottom, 0);
        assert_eq!(pads[3].bottom, 1);
        assert!(pads.iter().all(|p| p.left == 1 && p.right == 1));

        // Memory regions cover their compute regions.
        for i in 0..act.num_clusters {
            assert!(act.memory_offsets[i][AXIS_H] <= act.compute_offsets[i][AXIS_H]);
        }
    }

    #[test]
    fn test_sok_operand_modes() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(64, 128, 16, 16);

        let plans = planner.plan_op(&op, Strategy::SplitOverKernel, false).unwrap();

        // Conv input cannot follow the channel split: duplicated.
        assert_eq!(plans.activation.mode, DistributionMode::DUPLICATED);

        let weights = plans.weights.as_ref().unwrap();
        assert_eq!(weights.mode, DistributionMode::SEGMENTED);
        assert_eq!(weights.num_tiles, [4, 1, 1, 1]);
        let oc: Vec<i64> = weights.compute_shapes.iter().map(|s| s[0]).collect();
        assert_eq!(oc, vec![32, 32, 32, 32]);
        assert_eq!(weights.alignment, Some([16, 1, 1, 1]));

        let table = plans.weights_table.as_ref().unwrap();
        assert_eq!(table.compute_shapes[0], [32, 1, 1, 4]);

        // Legacy output broadcasts while segmenting compute.
        assert_eq!(
            plans.output.mode,
            DistributionMode::DUPLICATED | DistributionMode::SEGMENTED
        );
        assert!(plans.output.memory_shapes.iter().all(|s| *s == op.output.shape));
        assert_eq!(plans.output.alignment, Some([1, 16, 1, 1]));
    }

    #[test]
    fn test_sok_depthwise_segments_input() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);

        let input = TensorDescriptor::new([1, 64, 16, 16], ElemType::U8);
        let weights = TensorDescriptor::new([64, 1, 3, 3], ElemType::U8);
        let output = TensorDescriptor::new([1, 64, 16, 16], ElemType::U8);
        let op = OpDescriptor::new(OpKind::DepthwiseConv, input, output)
            .with_weights(weights)
            .with_kernel(3, 3)
            .with_pad(PadInfo::same(1))
            .with_groups(64);

        let plans = planner.plan_op(&op, Strategy::SplitOverKernel, false).unwrap();
        assert_eq!(plans.activation.mode, DistributionMode::SEGMENTED);
        assert_eq!(plans.activation.num_tiles, [1, 4, 1, 1]);
        // The window blob is duplicated everywhere.
        let window = plans.activation_window.as_ref().unwrap();
        assert_eq!(window.mode, DistributionMode::DUPLICATED);
    }

    #[test]
    fn test_hkswitch_multicasts_output() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(64, 64, 32, 16);

        let plans = planner.plan_op(&op, Strategy::HKSwitch, false).unwrap();
        assert_eq!(plans.activation.mode, DistributionMode::SEGMENTED);
        assert_eq!(
            plans.output.mode,
            DistributionMode::MULTICASTED | DistributionMode::SEGMENTED
        );
        // Every cluster holds the full output in memory.
        assert!(plans.output.memory_shapes.iter().all(|s| *s == op.output.shape));
        // Compute still partitions the height.
        let h: i64 = plans.output.compute_shapes.iter().map(|s| s[AXIS_H]).sum();
        assert_eq!(h, 32);
    }

    #[test]
    fn test_fallback_to_clustering() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        // 2 rows cannot be split over any cluster count > 1 with the
        // height alignment the odd width forces.
        let op = conv(16, 16, 2, 15);

        let err = planner.plan_op(&op, Strategy::SplitOverHeight, false);
        assert!(matches!(err, Err(LoweringError::NoValidSegmentation { .. })));

        let plans = planner.plan_op(&op, Strategy::SplitOverHeight, true).unwrap();
        assert_eq!(plans.activation.strategy, Strategy::Clustering);
        assert_eq!(plans.activation.num_clusters, 1);
        assert_eq!(plans.activation.mode, DistributionMode::DUPLICATED);
    }

    #[test]
    fn test_sok_rejected_for_compressed_weights() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let mut op = conv(64, 128, 16, 16);
        op.kind = OpKind::CompressConv;

        match planner.plan_op(&op, Strategy::SplitOverKernel, true) {
            Err(LoweringError::UnsupportedStrategy { kind: OpKind::CompressConv, .. }) => {}
            other => panic!("expected unsupported strategy, got {other:?}"),
        }
    }

    #[test]
    fn test_batch_split_requires_batch() {
        let profile = HardwareProfile::kmb();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(16, 16, 8, 8);
        assert!(planner.plan_op(&op, Strategy::SplitOverBatch, false).is_err());
    }

    #[test]
    fn test_slice_alignment_rescale() {
        // Slice halves the aligned axis: alignment halves too.
        assert_eq!(
            slice_alignment([1, 16, 1, 1], [1, 64, 8, 8], [1, 32, 8, 8]),
            Some([1, 8, 1, 1])
        );
        // Axis untouched by the slice: alignment unchanged.
        assert_eq!(
            slice_alignment([1, 16, 1, 1], [1, 64, 8, 8], [1, 64, 4, 8]),
            Some([1, 16, 1, 1])
        );
        // Uneven slice drops the alignment.
        assert_eq!(slice_alignment([1, 16, 1, 1], [1, 48, 8, 8], [1, 32, 8, 8]), None);
        // Scale not dividing the alignment drops it too.
        assert_eq!(slice_alignment([1, 16, 1, 1], [1, 96, 8, 8], [1, 32, 8, 8]), None);
        // No aligned axis passes through.
        assert_eq!(
            slice_alignment([1, 1, 1, 1], [1, 64, 8, 8], [1, 32, 8, 8]),
            Some([1, 1, 1, 1])
        );
    }

    #[test]
    fn test_uniform_output_segments_balanced() {
        let profile = HardwareProfile::mtl();
        let planner = DistributionPlanner::new(&profile);
        let op = conv(64, 64, 31, 16);

        let plans = planner.plan_op(&op, Strategy::SplitOverHeight, false).unwrap();
        let heights: Vec<i64> = plans.output.compute_shapes.iter().map(|s| s[AXIS_H]).collect();
        assert_eq!(heights.iter().sum::<i64>(), 31);
        let max = heights.iter().max().unwrap();
        let min = heights.iter().min().unwrap();
        assert!(max - min <= 1, "uniform segments must balance: {heights:?}");
        // Uniform SOK output is plain segmented, no broadcast.
        let plans = planner.plan_op(&op, Strategy::SplitOverKernel, false).unwrap();
        assert_eq!(plans.output.mode, DistributionMode::SEGMENTED);
    }
}
