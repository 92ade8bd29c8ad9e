//! Recursive output tiling for operations that overflow the CMX budget.
//!
//! The tiler splits the output tensor, back-infers the input/weights/bias
//! slice each output tile needs, and re-checks the CMX budget per tile.
//! Channel splits come first (they keep convolution tiles fully
//! independent), then the spatial dimensions. The result is a pure
//! `Subgraph` value the caller splices into the graph.

use crate::error::LoweringError;
use crate::invariants::InvariantChecker;
use crate::op::{OpDescriptor, OpKind, PadInfo};
use crate::profile::HardwareProfile;
use crate::types::{div_ceil, Shape, AXIS_C, AXIS_H, AXIS_N, AXIS_W};

/// One axis-aligned region of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub shape: Shape,
    pub offset: Shape,
}

impl Tile {
    pub const fn covering(shape: Shape) -> Self {
        Tile { shape, offset: [0; 4] }
    }

    /// End coordinate (exclusive) along one axis.
    #[inline]
    pub fn end(&self, axis: usize) -> i64 {
        self.offset[axis] + self.shape[axis]
    }
}

/// One materialized tile: the output region, the input region it reads
/// (with per-tile padding) and the weight/bias slices it uses.
#[derive(Debug, Clone)]
pub struct TileStep {
    pub output: Tile,
    pub input: Tile,
    pub pads: PadInfo,
    pub weights: Option<Tile>,
    pub bias: Option<Tile>,
}

/// Replacement fragment for a tiled operation: per-tile
/// copy-in / compute / copy-out steps whose outputs concatenate back into
/// the original output tensor. Steps are in raster order of their output
/// offsets and write disjoint regions.
#[derive(Debug, Clone)]
pub struct Subgraph {
    pub steps: Vec<TileStep>,
    /// Shape the concatenated step outputs reproduce.
    pub concat_shape: Shape,
}

/// Divide `shape` into `divisors[axis]` tiles per axis, raster order.
///
/// Without alignment, an axis of extent `S` over `d` tiles gives the first
/// `S % d` tiles one extra element. With alignment `a`, every tile but the
/// last is `align_up(ceil(S/d), a)` and the last takes the remainder, which
/// must stay positive.
pub fn fill_divided_tiles(
    shape: Shape,
    divisors: Shape,
    alignment: Option<Shape>,
) -> Result<Vec<Tile>, LoweringError> {
    let mut per_axis: [Vec<(i64, i64)>; 4] = Default::default();
    for axis in 0..4 {
        let extent = shape[axis];
        let count = divisors[axis];
        debug_assert!(count >= 1 && extent >= count, "cannot divide {extent} into {count}");
        let align = alignment.map(|a| a[axis]).unwrap_or(1);
        per_axis[axis] = divide_axis(extent, count, align)?;
    }

    let total = divisors.iter().product::<i64>() as usize;
    let mut tiles = Vec::with_capacity(total);
    for &(ns, no) in &per_axis[AXIS_N] {
        for &(cs, co) in &per_axis[AXIS_C] {
            for &(hs, ho) in &per_axis[AXIS_H] {
                for &(ws, wo) in &per_axis[AXIS_W] {
                    tiles.push(Tile {
                        shape: [ns, cs, hs, ws],
                        offset: [no, co, ho, wo],
                    });
                }
            }
        }
    }
    Ok(tiles)
}

/// (size, offset) pairs along one axis.
fn divide_axis(extent: i64, count: i64, align: i64) -> Result<Vec<(i64, i64)>, LoweringError> {
    let mut out = Vec::with_capacity(count as usize);
    if align > 1 {
        let tile = crate::types::align_up(div_ceil(extent, count), align);
        let last = extent - tile * (count - 1);
        if last <= 0 {
            return Err(LoweringError::UnsupportedConfiguration(format!(
                "aligned split of {extent} into {count} x multiple-of-{align} leaves no remainder"
            )));
        }
        let mut offset = 0;
        for i in 0..count {
            let size = if i + 1 == count { last } else { tile };
            out.push((size, offset));
            offset += size;
        }
    } else {
        let base = extent / count;
        let extra = extent % count;
        let mut offset = 0;
        for i in 0..count {
            let size = base + i64::from(i < extra);
            out.push((size, offset));
            offset += size;
        }
    }
    Ok(out)
}

/// Back-infer the input range one output range needs through a strided
/// window along one dimension. Returns (offset, size, pad_before,
/// pad_after) clipped to the real input extent; the clipped amounts become
/// the tile's padding.
pub fn back_infer_dim(
    out_offset: i64,
    out_size: i64,
    in_extent: i64,
    kernel: i64,
    stride: i64,
    pad_before: i64,
) -> (i64, i64, i64, i64) {
    let mut begin = out_offset * stride - pad_before;
    let mut tile_pad_before = 0;
    if begin < 0 {
        tile_pad_before = -begin;
        begin = 0;
    }
    let mut end = (out_offset + out_size - 1) * stride + kernel - pad_before;
    let mut tile_pad_after = 0;
    if end > in_extent {
        tile_pad_after = end - in_extent;
        end = in_extent;
    }
    (begin, end - begin, tile_pad_before, tile_pad_after)
}

/// Builds the full `TileStep` for one output tile: input region via
/// back-inference, weight/bias slices following the output-channel range.
pub fn infer_tile_step(op: &OpDescriptor, output: Tile) -> TileStep {
    let (h_off, h_size, pad_top, pad_bottom) = back_infer_dim(
        output.offset[AXIS_H],
        output.shape[AXIS_H],
        op.input.shape[AXIS_H],
        op.kernel.y,
        op.stride.y,
        op.pad.top,
    );
    let (w_off, w_size, pad_left, pad_right) = back_infer_dim(
        output.offset[AXIS_W],
        output.shape[AXIS_W],
        op.input.shape[AXIS_W],
        op.kernel.x,
        op.stride.x,
        op.pad.left,
    );

    // Convolution reads every input channel for any output channel slice;
    // depthwise, pooling and eltwise input channels track the output slice.
    let (c_size, c_off) = match op.kind {
        OpKind::Conv | OpKind::CompressConv => (op.input.shape[AXIS_C], 0),
        OpKind::DepthwiseConv | OpKind::MaxPool | OpKind::AvgPool | OpKind::Eltwise => {
            (output.shape[AXIS_C], output.offset[AXIS_C])
        }
    };

    let input = Tile {
        shape: [output.shape[AXIS_N], c_size, h_size, w_size],
        offset: [output.offset[AXIS_N], c_off, h_off, w_off],
    };

    let weights = op.weights.as_ref().map(|w| Tile {
        shape: [output.shape[AXIS_C], w.shape[1], w.shape[2], w.shape[3]],
        offset: [output.offset[AXIS_C], 0, 0, 0],
    });
    let bias = op.bias.as_ref().map(|b| {
        let mut shape = b.shape;
        let mut offset = [0; 4];
        shape[AXIS_C] = output.shape[AXIS_C];
        offset[AXIS_C] = output.offset[AXIS_C];
        Tile { shape, offset }
    });

    TileStep {
        output,
        input,
        pads: PadInfo {
            top: pad_top,
            bottom: pad_bottom,
            left: pad_left,
            right: pad_right,
        },
        weights,
        bias,
    }
}

/// The OpDescriptor a single tile executes: sliced operands, tile pads.
pub fn tiled_op(op: &OpDescriptor, step: &TileStep) -> OpDescriptor {
    let mut tiled = op.clone();
    tiled.input = op.input.sliced(step.input.shape);
    tiled.output = op.output.sliced(step.output.shape);
    if let (Some(w), Some(tile)) = (&op.weights, &step.weights) {
        tiled.weights = Some(w.sliced(tile.shape));
    }
    if let (Some(b), Some(tile)) = (&op.bias, &step.bias) {
        tiled.bias = Some(b.sliced(tile.shape));
    }
    if let Some(s) = &op.second_input {
        tiled.second_input = Some(s.sliced(step.input.shape));
    }
    tiled.pad = step.pads;
    tiled
}

/// Output tiler driven by the CMX budget.
pub struct TilingEngine<'a> {
    checker: InvariantChecker<'a>,
}

impl<'a> TilingEngine<'a> {
    pub fn new(profile: &'a HardwareProfile) -> Self {
        TilingEngine { checker: InvariantChecker::new(profile) }
    }

    /// Find the smallest per-dimension split whose tiles all fit on-chip.
    ///
    /// Dimension priority is output channel, then the larger spatial
    /// dimension; channel splits keep per-tile channel counts multiples of
    /// the alignment unit. Exhausting every dimension without a fit is a
    /// fatal `Infeasible`.
    pub fn generate(&self, op: &OpDescriptor) -> Result<Vec<Tile>, LoweringError> {
        let out = op.output.shape;
        let alignment = self
            .checker
            .profile()
            .channel_alignment(op.input.elem.bits());
        let oc = out[AXIS_C];

        let mut divisors: Shape = [1, 1, 1, 1];
        let mut dim_order = if oc < out[AXIS_H] {
            vec![AXIS_H, AXIS_C, AXIS_W]
        } else {
            vec![AXIS_C, AXIS_H, AXIS_W]
        };

        // Depthwise tiles channels up-front (each tile one alignment unit)
        // and only searches the spatial dims.
        if op.kind == OpKind::DepthwiseConv && oc > alignment {
            divisors[AXIS_C] = oc / alignment;
            dim_order = vec![AXIS_H, AXIS_W];
        }

        let max_channel_tiles = (oc / alignment).max(1);
        let mut dim_idx = 0;

        loop {
            if let Some(tiles) = self.try_split(op, divisors)? {
                log::debug!("{} tiled {:?} -> {} tiles", op.label(), divisors, tiles.len());
                return Ok(tiles);
            }
            // Advance the current dimension; move on when it is exhausted.
            loop {
                if dim_idx >= dim_order.len() {
                    return Err(LoweringError::Infeasible { op: op.label() });
                }
                let axis = dim_order[dim_idx];
                match next_divisor(axis, divisors[axis], out, alignment, max_channel_tiles) {
                    Some(next) => {
                        divisors[axis] = next;
                        break;
                    }
                    None => dim_idx += 1,
                }
            }
        }
    }

    /// Evaluate one candidate divisor set: `None` when some tile still
    /// overflows CMX, tiles in raster order otherwise.
    fn try_split(
        &self,
        op: &OpDescriptor,
        divisors: Shape,
    ) -> Result<Option<Vec<Tile>>, LoweringError> {
        let tiles = fill_divided_tiles(op.output.shape, divisors, None)?;
        for tile in &tiles {
            let step = infer_tile_step(op, *tile);
            let candidate = tiled_op(op, &step);
            if self.checker.fits_cmx_budget(&candidate).is_err() {
                return Ok(None);
            }
        }
        Ok(Some(tiles))
    }

    /// Tile sequence plus the per-tile operand slices, ready for splicing.
    pub fn materialize(&self, op: &OpDescriptor, tiles: &[Tile]) -> Subgraph {
        let steps = tiles.iter().map(|t| infer_tile_step(op, *t)).collect();
        Subgraph {
            steps,
            concat_shape: op.output.shape,
        }
    }
}

/// Next legal divisor along `axis`, or `None` when the axis is exhausted.
/// Channel divisors must divide the channel count and keep per-tile
/// channels aligned; spatial divisors grow by one up to the extent.
fn next_divisor(
    axis: usize,
    current: i64,
    out: Shape,
    alignment: i64,
    max_channel_tiles: i64,
) -> Option<i64> {
    if axis == AXIS_C {
        let oc = out[AXIS_C];
        let mut n = current + 1;
        while n <= max_channel_tiles {
            if oc % n == 0 && (oc / n) % alignment == 0 {
                return Some(n);
            }
            n += 1;
        }
        None
    } else {
        let next = current + 1;
        (next <= out[axis]).then_some(next)
    }
}
