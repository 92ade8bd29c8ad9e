//! Hardware profile — static per-generation constants and encoders.
//!
//! One `HardwareProfile` is constructed per compilation target and read
//! everywhere else. Generation-specific behavior (scale/shift packing, bias
//! encoding, segmentation style) is selected once here as plain function
//! pointers and flags, so no other module ever branches on the generation
//! enum directly.

use std::fmt;

use crate::types::ElemType;

/// Accelerator generations this core can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchGeneration {
    /// First-generation NCE, 4 clusters, legacy N-1-equal segmentation.
    Kmb,
    /// KMB derivative with more clusters, same lowering rules.
    Tbh,
    /// Second-generation NCE: uniform segments, asymmetric strides,
    /// float PPE path.
    Mtl,
}

impl fmt::Display for ArchGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArchGeneration::Kmb => "KMB",
            ArchGeneration::Tbh => "TBH",
            ArchGeneration::Mtl => "MTL",
        };
        f.write_str(name)
    }
}

/// Packs a per-channel requantization into the 32-bit PPE word.
///
/// `mult`/`shift` come from the fixed-point decomposition of `rescale`;
/// encoders that store the raw float ignore them and read `rescale`
/// directly. `input` is the operation's input element type.
pub type PpeEncoder = fn(mult: i64, shift: i64, rescale: f64, input: ElemType) -> i32;

/// Encodes a float bias value into the 32-bit weights-table bias field.
pub type BiasEncoder = fn(value: f64) -> i32;

/// Static description of one accelerator generation.
///
/// Constructed once per compilation target, read-only thereafter.
#[derive(Clone)]
pub struct HardwareProfile {
    pub arch: ArchGeneration,
    /// DPU clusters available for multi-cluster strategies.
    pub num_clusters: usize,
    /// CMX scratchpad capacity in bytes (per-cluster usable budget).
    pub cmx_bytes: i64,
    /// Largest legal kernel dimension.
    pub max_kernel: i64,
    /// Largest legal stride.
    pub max_stride: i64,
    /// Whether SY != SX is accepted.
    pub asymmetric_strides: bool,
    /// Balanced segmentation instead of the legacy N-1-equal split.
    pub uniform_segments: bool,
    /// PPE rescale word packer for this generation.
    pub ppe_encoder: PpeEncoder,
    /// Bias field encoder for unquantized operations.
    pub bias_encoder: BiasEncoder,
}

impl HardwareProfile {
    pub fn kmb() -> Self {
        HardwareProfile {
            arch: ArchGeneration::Kmb,
            num_clusters: 4,
            cmx_bytes: 917_504,
            max_kernel: 11,
            max_stride: 8,
            asymmetric_strides: false,
            uniform_segments: false,
            ppe_encoder: ppe_pack_fixed,
            bias_encoder: bias_fixed_point,
        }
    }

    pub fn tbh() -> Self {
        HardwareProfile {
            arch: ArchGeneration::Tbh,
            num_clusters: 8,
            ..Self::kmb()
        }
    }

    pub fn mtl() -> Self {
        HardwareProfile {
            arch: ArchGeneration::Mtl,
            num_clusters: 2,
            cmx_bytes: 1_982_464,
            max_kernel: 11,
            max_stride: 8,
            asymmetric_strides: true,
            uniform_segments: true,
            ppe_encoder: ppe_pack_float,
            bias_encoder: bias_raw_bits,
        }
    }

    /// Channel alignment unit for a given element width:
    /// `max(128 / elem_bits, 16)`.
    #[inline]
    pub fn channel_alignment(&self, elem_bits: i64) -> i64 {
        debug_assert!(elem_bits > 0);
        (128 / elem_bits).max(16)
    }

    #[inline]
    pub fn cmx_bytes(&self) -> i64 {
        self.cmx_bytes
    }
}

impl fmt::Debug for HardwareProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HardwareProfile")
            .field("arch", &self.arch)
            .field("num_clusters", &self.num_clusters)
            .field("cmx_bytes", &self.cmx_bytes)
            .field("max_kernel", &self.max_kernel)
            .field("max_stride", &self.max_stride)
            .field("asymmetric_strides", &self.asymmetric_strides)
            .field("uniform_segments", &self.uniform_segments)
            .finish()
    }
}

impl fmt::Display for HardwareProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} NCE: {} clusters, {} KiB CMX, kernel<={}, stride<={}",
            self.arch,
            self.num_clusters,
            self.cmx_bytes / 1024,
            self.max_kernel,
            self.max_stride,
        )
    }
}

// ---- Generation encoders ----

/// Fixed-point PPE word: `prelu | (shift << 8) | (round << 14) | (mult << 16)`.
///
/// `prelu` is the identity (1) and `round` is round-to-nearest (1) on this
/// generation; the bit offsets are the hardware contract.
fn ppe_pack_fixed(mult: i64, shift: i64, _rescale: f64, _input: ElemType) -> i32 {
    debug_assert!((0..=0xFFFF).contains(&mult));
    debug_assert!((0..=0x3F).contains(&shift));
    ((1i64 << 0) | (shift << 8) | (1i64 << 14) | (mult << 16)) as i32
}

/// Second-generation PPE word: raw IEEE-754 bits of the rescale for float
/// inputs, fixed-point pack with a zeroed prelu field otherwise.
fn ppe_pack_float(mult: i64, shift: i64, rescale: f64, input: ElemType) -> i32 {
    if input.is_float() {
        (rescale as f32).to_bits() as i32
    } else {
        ((shift << 8) | (1i64 << 14) | (mult << 16)) as i32
    }
}

/// Q16.16 fixed-point bias encoding.
fn bias_fixed_point(value: f64) -> i32 {
    let fixed = (value * 65536.0).round();
    debug_assert!(
        fixed >= i32::MIN as f64 && fixed <= i32::MAX as f64,
        "bias {value} overflows Q16.16"
    );
    fixed as i32
}

/// Raw IEEE-754 single-precision bias encoding.
fn bias_raw_bits(value: f64) -> i32 {
    (value as f32).to_bits() as i32
}
