//! Hardware descriptor generation: weights table and activation window.
//!
//! Both blobs are consumed directly by the NCE at run time; every field
//! position and bit offset below is a hardware compatibility contract.
//! Per-channel records carry no cross-channel dependency, so the table is
//! built on the rayon pool and assembled in channel order.

use rayon::prelude::*;

use crate::error::LoweringError;
use crate::op::{KernelSize, OpDescriptor, Strides};
use crate::profile::HardwareProfile;
use crate::types::{align_up, div_ceil, ElemType, QuantScales};

/// `sparsityPointer` value meaning "no weight sparsity".
pub const SPARSITY_PTR_NONE: i32 = 0x00FF_FFFF;

/// Fixed-point multiplier width of the PPE rescale.
const MULT_BITS: i32 = 15;

/// Activation-window bytes per lane the hardware can hold.
const MAX_WINDOW_BYTES: i64 = 32;

/// Per-channel window byte counts round up to this quantum.
const WINDOW_SIZE_ALIGNMENT: i64 = 16;

/// One weights-table entry; four little-endian i32 fields per output
/// channel, in this exact order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightsTableRecord {
    pub weights_ptr: i32,
    pub sparsity_ptr: i32,
    pub ppe_rescale: i32,
    pub bias: i32,
}

impl WeightsTableRecord {
    #[inline]
    pub const fn as_words(&self) -> [i32; 4] {
        [self.weights_ptr, self.sparsity_ptr, self.ppe_rescale, self.bias]
    }
}

/// Flatten records into the i32 stream the binary writer serializes.
pub fn flatten_weights_table(records: &[WeightsTableRecord]) -> Vec<i32> {
    records.iter().flat_map(|r| r.as_words()).collect()
}

/// Pointer bookkeeping for the weights table.
#[derive(Debug, Clone)]
pub struct WeightsTableParams {
    /// CMX byte offset of channel 0's weights.
    pub weights_ptr_base: i64,
    /// Per-channel weights stride in bytes (dense weights).
    pub weights_ptr_step: i64,
    /// Byte offset of the weight-sparsity map, when the weights are sparse.
    /// `None` emits the no-sparsity sentinel in every record.
    pub sparsity_ptr_base: Option<i64>,
    /// Compressed per-channel weight byte sizes; when present the weights
    /// pointer tracks a running offset aligned to 16 bytes instead of the
    /// fixed step.
    pub compressed_sizes: Option<Vec<i64>>,
}

impl WeightsTableParams {
    pub fn dense(weights_ptr_base: i64, weights_ptr_step: i64) -> Self {
        WeightsTableParams {
            weights_ptr_base,
            weights_ptr_step,
            sparsity_ptr_base: None,
            compressed_sizes: None,
        }
    }
}

/// Activation-window blob plus the geometry the invariant checker and the
/// binary writer both need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationWindow {
    pub data: Vec<u8>,
    /// Window elements per kernel row.
    pub window_size: i64,
    /// Bytes per input channel (16-byte aligned).
    pub bytes_per_channel: i64,
}

/// Builds hardware descriptors for one profile.
pub struct DescriptorGenerator<'a> {
    profile: &'a HardwareProfile,
}

impl<'a> DescriptorGenerator<'a> {
    pub fn new(profile: &'a HardwareProfile) -> Self {
        DescriptorGenerator { profile }
    }

    /// Weights table: one record per output channel.
    ///
    /// `bias` carries the float bias constants in channel order when the
    /// operation has a bias operand.
    pub fn weights_table(
        &self,
        op: &OpDescriptor,
        params: &WeightsTableParams,
        bias: Option<&[f64]>,
    ) -> Result<Vec<WeightsTableRecord>, LoweringError> {
        let oc = op.output_channels() as usize;
        debug_assert!(oc > 0, "weights table for zero output channels");
        if let Some(values) = bias {
            assert_eq!(values.len(), oc, "bias constants must cover every output channel");
        }
        if let Some(sizes) = &params.compressed_sizes {
            assert_eq!(sizes.len(), oc, "compressed sizes must cover every output channel");
        }

        let weights_ptrs = self.weights_pointers(params, oc);
        let sparsity_ptrs = self.sparsity_pointers(op, params, oc);

        (0..oc)
            .into_par_iter()
            .map(|c| {
                let rescale = self.rescale_for_channel(op, c)?;
                let ppe_rescale = self.encode_rescale(op, rescale)?;
                let bias_field = self.encode_bias(op, bias.map(|b| b[c]), c)?;
                Ok(WeightsTableRecord {
                    weights_ptr: weights_ptrs[c],
                    sparsity_ptr: sparsity_ptrs[c],
                    ppe_rescale,
                    bias: bias_field,
                })
            })
            .collect()
    }

    /// Activation window for pooling/depthwise kinds: the per-channel bit
    /// pattern replicated per input channel.
    pub fn activation_window(&self, op: &OpDescriptor) -> Result<ActivationWindow, LoweringError> {
        debug_assert!(
            op.kind.needs_activation_window(),
            "activation window requested for {:?}",
            op.kind
        );
        let window_size =
            window_size(op.kernel.x, op.stride.x, op.input.elem).ok_or_else(|| {
                LoweringError::UnsupportedConfiguration(format!(
                    "no activation window fits kernel {}x{} stride {} for {}",
                    op.kernel.y, op.kernel.x, op.stride.x, op.input.elem
                ))
            })?;

        let channel = pack_window_pattern(op.kernel, window_size);
        let bytes_per_channel = channel.len() as i64;
        let ic = op.input_channels() as usize;
        let data = channel.repeat(ic);

        log::debug!(
            "activation window: {}x{} kernel, window {window_size}, {bytes_per_channel} B/channel x {ic} channels",
            op.kernel.y,
            op.kernel.x,
        );
        Ok(ActivationWindow { data, window_size, bytes_per_channel })
    }

    // ---- Pointer columns ----

    fn weights_pointers(&self, params: &WeightsTableParams, oc: usize) -> Vec<i32> {
        match &params.compressed_sizes {
            Some(sizes) => {
                let mut ptrs = Vec::with_capacity(oc);
                let mut offset = params.weights_ptr_base;
                for &size in sizes {
                    ptrs.push(offset as i32);
                    offset += align_up(size, 16);
                }
                ptrs
            }
            None => (0..oc as i64)
                .map(|c| (params.weights_ptr_base + c * params.weights_ptr_step) as i32)
                .collect(),
        }
    }

    fn sparsity_pointers(
        &self,
        op: &OpDescriptor,
        params: &WeightsTableParams,
        oc: usize,
    ) -> Vec<i32> {
        match params.sparsity_ptr_base {
            None => vec![SPARSITY_PTR_NONE; oc],
            Some(base) => {
                let elem_bytes = op
                    .weights
                    .as_ref()
                    .map(|w| w.elem.byte_size())
                    .unwrap_or(1);
                let step = params.weights_ptr_step / elem_bytes;
                (0..oc as i64).map(|c| (base + c * step) as i32).collect()
            }
        }
    }

    // ---- Requantization ----

    /// Per-channel rescale `w_scale[c] * in_scale / out_scale`, or `None`
    /// for unquantized operations.
    fn rescale_for_channel(
        &self,
        op: &OpDescriptor,
        c: usize,
    ) -> Result<Option<f64>, LoweringError> {
        match quant_scales(op)? {
            Some((w_scale, in_scale, out_scale)) => {
                let rescale = w_scale.at(c) * in_scale / out_scale;
                if rescale <= 0.0 || !rescale.is_finite() {
                    return Err(LoweringError::ValueOutOfRange {
                        field: "rescale",
                        value: rescale,
                    });
                }
                Ok(Some(rescale))
            }
            None => Ok(None),
        }
    }

    fn encode_rescale(
        &self,
        op: &OpDescriptor,
        rescale: Option<f64>,
    ) -> Result<i32, LoweringError> {
        match rescale {
            Some(rescale) => {
                let (mult, shift) = mult_shift(rescale)?;
                Ok((self.profile.ppe_encoder)(mult, shift, rescale, op.input.elem))
            }
            // Unquantized tasks carry the fixed identity (mult 1, shift 0),
            // not a decomposed 1.0.
            None => Ok((self.profile.ppe_encoder)(1, 0, 1.0, op.input.elem)),
        }
    }

    fn encode_bias(
        &self,
        op: &OpDescriptor,
        bias: Option<f64>,
        c: usize,
    ) -> Result<i32, LoweringError> {
        let Some(value) = bias else { return Ok(0) };
        match quant_scales(op)? {
            Some((w_scale, in_scale, _)) => {
                let quantized = (value / (w_scale.at(c) * in_scale)).round();
                if quantized < i32::MIN as f64 || quantized > i32::MAX as f64 {
                    return Err(LoweringError::ValueOutOfRange {
                        field: "bias",
                        value: quantized,
                    });
                }
                Ok(quantized as i32)
            }
            None => Ok((self.profile.bias_encoder)(value)),
        }
    }
}

/// Scales for the quantized path: weights (or input for weight-less kinds),
/// input, output. `Ok(None)` when the operation runs fully unquantized; a
/// mixed configuration is fatal rather than silently treated as float.
fn quant_scales(op: &OpDescriptor) -> Result<Option<(&QuantScales, f64, f64)>, LoweringError> {
    let (in_q, out_q) = match (&op.input.quant, &op.output.quant) {
        (Some(i), Some(o)) => (i, o),
        (None, None) => return Ok(None),
        _ => {
            return Err(LoweringError::UnsupportedConfiguration(
                "input and output must both be quantized or both float".into(),
            ))
        }
    };
    let w_scales = match &op.weights {
        Some(w) => match &w.quant {
            Some(q) => &q.scales,
            None => {
                return Err(LoweringError::UnsupportedConfiguration(
                    "quantized operation with unquantized weights".into(),
                ))
            }
        },
        // Pooling/eltwise reuse the input scale as the per-channel column.
        None => &in_q.scales,
    };
    let in_scale = match &in_q.scales {
        QuantScales::PerTensor(s) => *s,
        QuantScales::PerChannel(v) => v[0],
    };
    let out_scale = match &out_q.scales {
        QuantScales::PerTensor(s) => *s,
        QuantScales::PerChannel(v) => v[0],
    };
    Ok(Some((w_scales, in_scale, out_scale)))
}

/// Fixed-point decomposition of a positive rescale: mantissa in [0.5, 1)
/// scaled to 15 bits, shift derived from the exponent.
pub fn mult_shift(rescale: f64) -> Result<(i64, i64), LoweringError> {
    debug_assert!(rescale > 0.0 && rescale.is_finite());
    let (mantissa, exp) = frexp(rescale);
    let shift = (MULT_BITS - exp) as i64;
    if !(0..=0x3F).contains(&shift) {
        return Err(LoweringError::ValueOutOfRange {
            field: "ppe shift",
            value: rescale,
        });
    }
    let mult = (mantissa * f64::from(1i32 << MULT_BITS)) as i64;
    Ok((mult, shift))
}

/// `frexp`: split a finite nonzero float into mantissa in [0.5, 1) and
/// exponent so that `x == mantissa * 2^exp`.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 {
        return (0.0, 0);
    }
    let bits = x.to_bits();
    let exp_field = ((bits >> 52) & 0x7FF) as i32;
    if exp_field == 0 {
        // Subnormal: renormalize first.
        let (m, e) = frexp(x * f64::from_bits(0x43F0_0000_0000_0000)); // 2^64
        return (m, e - 64);
    }
    let exp = exp_field - 1022;
    let mantissa = f64::from_bits((bits & !(0x7FFu64 << 52)) | (1022u64 << 52));
    (mantissa, exp)
}

// ---- Activation window geometry ----

/// Largest window that fits the 32-byte lane limit: try MPE counts
/// 1, 2, 4, ... up to the element-width-dependent cap and keep the biggest
/// window `SX <= KX ? KX + SX*(mpe-1) : KX*mpe` that still fits.
pub fn window_size(kernel_x: i64, stride_x: i64, elem: ElemType) -> Option<i64> {
    debug_assert!(kernel_x >= 1 && stride_x >= 1);
    let mpe_limit: i64 = if elem == ElemType::F16 || elem == ElemType::BF16 { 4 } else { 16 };
    let max_window = MAX_WINDOW_BYTES / elem.byte_size();

    let mut best = None;
    let mut mpe = 1;
    while mpe <= mpe_limit {
        let window = if stride_x <= kernel_x {
            kernel_x + stride_x * (mpe - 1)
        } else {
            kernel_x * mpe
        };
        if window <= max_window {
            best = Some(window);
        }
        mpe *= 2;
    }
    best
}

/// Bytes of activation window per input channel: `KY * window` bits packed
/// 8 per byte, rounded up to 16 bytes.
pub fn window_bytes_per_channel(kernel: KernelSize, window_size: i64) -> i64 {
    let bits = kernel.y * window_size;
    div_ceil(bits, 128) * WINDOW_SIZE_ALIGNMENT
}

/// Total activation-window byte size without materializing the buffer.
/// Used by the CMX budget check; an impossible window contributes zero
/// (the kernel-bounds check rejects such shapes first).
pub fn activation_window_bytes(
    kernel: KernelSize,
    stride: Strides,
    elem: ElemType,
    input_channels: i64,
) -> i64 {
    match window_size(kernel.x, stride.x, elem) {
        Some(w) => window_bytes_per_channel(kernel, w) * input_channels,
        None => 0,
    }
}

/// Pack one channel's bit pattern: per kernel row, `KX` ones then
/// `window - KX` zeros; bit `i` lands in byte `(i/128)*16 + (i%128)/8` at
/// position `i%8`.
fn pack_window_pattern(kernel: KernelSize, window_size: i64) -> Vec<u8> {
    let bits = kernel.y * window_size;
    let mut bytes = vec![0u8; window_bytes_per_channel(kernel, window_size) as usize];
    for i in 0..bits {
        let in_row = i % window_size;
        if in_row < kernel.x {
            let byte = (i / 128) * 16 + (i % 128) / 8;
            bytes[byte as usize] |= 1u8 << (i % 8);
        }
    }
    bytes
}
