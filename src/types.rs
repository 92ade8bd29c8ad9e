//! Core value types shared by every lowering subsystem.
//!
//! Everything here is an immutable value: the surrounding graph owns the real
//! operation nodes, this core only reads `TensorDescriptor`s and produces new
//! values (plans, tiles, byte buffers).

use std::fmt;

/// Axis indices for the fixed 4-D (N, C, H, W) shape used throughout.
pub const AXIS_N: usize = 0;
pub const AXIS_C: usize = 1;
pub const AXIS_H: usize = 2;
pub const AXIS_W: usize = 3;

/// A 4-D tensor shape in logical (N, C, H, W) order.
pub type Shape = [i64; 4];

/// Round `value` up to the next multiple of `align`.
#[inline]
pub const fn align_up(value: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    (value + align - 1) / align * align
}

/// Round `value` down to a multiple of `align`.
#[inline]
pub const fn align_down(value: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    value / align * align
}

/// Ceiling division for non-negative operands.
#[inline]
pub const fn div_ceil(num: i64, den: i64) -> i64 {
    debug_assert!(den > 0);
    (num + den - 1) / den
}

/// Element type of a tensor as the hardware sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemType {
    U8,
    I8,
    I32,
    F16,
    BF16,
    F32,
}

impl ElemType {
    /// Width in bits.
    #[inline]
    pub const fn bits(self) -> i64 {
        match self {
            ElemType::U8 | ElemType::I8 => 8,
            ElemType::F16 | ElemType::BF16 => 16,
            ElemType::I32 | ElemType::F32 => 32,
        }
    }

    /// Width in whole bytes.
    #[inline]
    pub const fn byte_size(self) -> i64 {
        self.bits() / 8
    }

    /// True for IEEE floating-point types (including the 16-bit formats).
    #[inline]
    pub const fn is_float(self) -> bool {
        matches!(self, ElemType::F16 | ElemType::BF16 | ElemType::F32)
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ElemType::U8 => "u8",
            ElemType::I8 => "i8",
            ElemType::I32 => "i32",
            ElemType::F16 => "f16",
            ElemType::BF16 => "bf16",
            ElemType::F32 => "f32",
        };
        f.write_str(name)
    }
}

/// Quantization scale, per-tensor or per-output-channel.
#[derive(Debug, Clone, PartialEq)]
pub enum QuantScales {
    PerTensor(f64),
    PerChannel(Vec<f64>),
}

impl QuantScales {
    /// Scale for channel `c`. Per-tensor scales ignore the index.
    #[inline]
    pub fn at(&self, c: usize) -> f64 {
        match self {
            QuantScales::PerTensor(s) => *s,
            QuantScales::PerChannel(v) => v[c],
        }
    }

    pub fn is_per_channel(&self) -> bool {
        matches!(self, QuantScales::PerChannel(_))
    }
}

/// Quantization parameters attached to an integer tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantization {
    pub scales: QuantScales,
    pub zero_point: i64,
    pub signed: bool,
}

impl Quantization {
    pub fn per_tensor(scale: f64, zero_point: i64, signed: bool) -> Self {
        Quantization {
            scales: QuantScales::PerTensor(scale),
            zero_point,
            signed,
        }
    }

    pub fn per_channel(scales: Vec<f64>, zero_point: i64, signed: bool) -> Self {
        Quantization {
            scales: QuantScales::PerChannel(scales),
            zero_point,
            signed,
        }
    }
}

/// Physical dimension order of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Layout {
    /// Planar: N, C, H, W major-to-minor.
    Nchw,
    /// Channel-minor: N, H, W, C major-to-minor. The native NCE activation order.
    Nhwc,
}

impl Layout {
    /// Dimension permutation, logical (N,C,H,W) axes listed major to minor.
    pub const fn permutation(self) -> [usize; 4] {
        match self {
            Layout::Nchw => [AXIS_N, AXIS_C, AXIS_H, AXIS_W],
            Layout::Nhwc => [AXIS_N, AXIS_H, AXIS_W, AXIS_C],
        }
    }
}

/// Where a tensor lives during execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// DDR, reachable only through DMA.
    OffChip,
    /// The CMX scratchpad the NCE computes from.
    OnChipScratch,
}

/// Immutable description of one tensor operand.
///
/// Shapes are always logical (N,C,H,W) regardless of `layout`; rank is
/// fixed at 4 — higher ranks are rejected upstream of this core.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDescriptor {
    pub shape: Shape,
    pub elem: ElemType,
    pub quant: Option<Quantization>,
    pub layout: Layout,
    pub memory: MemorySpace,
    /// Sparse activations change the data-packing quantum for height splits.
    pub sparse: bool,
}

impl TensorDescriptor {
    pub fn new(shape: Shape, elem: ElemType) -> Self {
        debug_assert!(
            shape.iter().all(|&d| d >= 0),
            "negative dimension in {shape:?}"
        );
        TensorDescriptor {
            shape,
            elem,
            quant: None,
            layout: Layout::Nhwc,
            memory: MemorySpace::OffChip,
            sparse: false,
        }
    }

    pub fn with_quant(mut self, quant: Quantization) -> Self {
        self.quant = Some(quant);
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_memory(mut self, memory: MemorySpace) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    #[inline]
    pub fn batch(&self) -> i64 {
        self.shape[AXIS_N]
    }

    #[inline]
    pub fn channels(&self) -> i64 {
        self.shape[AXIS_C]
    }

    #[inline]
    pub fn height(&self) -> i64 {
        self.shape[AXIS_H]
    }

    #[inline]
    pub fn width(&self) -> i64 {
        self.shape[AXIS_W]
    }

    /// Total element count.
    #[inline]
    pub fn num_elements(&self) -> i64 {
        self.shape.iter().product()
    }

    /// Dense byte footprint of the tensor.
    #[inline]
    pub fn byte_size(&self) -> i64 {
        self.num_elements() * self.elem.bits() / 8
    }

    /// Byte footprint of an arbitrary sub-shape with this element type.
    #[inline]
    pub fn byte_size_of(&self, shape: &Shape) -> i64 {
        shape.iter().product::<i64>() * self.elem.bits() / 8
    }

    /// Descriptor for a slice of this tensor (same type/layout/space).
    pub fn sliced(&self, shape: Shape) -> TensorDescriptor {
        debug_assert!(
            shape.iter().zip(&self.shape).all(|(&s, &f)| s <= f),
            "slice {shape:?} exceeds {:?}",
            self.shape
        );
        TensorDescriptor { shape, ..self.clone() }
    }
}

impl fmt::Display for TensorDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}x{} {}",
            self.shape[0], self.shape[1], self.shape[2], self.shape[3], self.elem
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_down(17, 16), 16);
        assert_eq!(div_ceil(17, 4), 5);
        assert_eq!(div_ceil(16, 4), 4);
    }

    #[test]
    fn test_byte_size() {
        let t = TensorDescriptor::new([1, 64, 32, 32], ElemType::U8);
        assert_eq!(t.byte_size(), 64 * 32 * 32);

        let t = TensorDescriptor::new([1, 64, 32, 32], ElemType::F16);
        assert_eq!(t.byte_size(), 64 * 32 * 32 * 2);
    }

    #[test]
    fn test_per_channel_scales() {
        let q = Quantization::per_channel(vec![0.5, 0.25, 0.125], 0, true);
        assert_eq!(q.scales.at(1), 0.25);
        assert!(q.scales.is_per_channel());

        let q = Quantization::per_tensor(0.5, 128, false);
        assert_eq!(q.scales.at(7), 0.5);
    }
}
