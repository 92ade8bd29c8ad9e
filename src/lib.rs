//! nce-lowering: hardware-lowering core for a fixed-function Neural
//! Compute Engine.
//!
//! Given operations already expressed in tensor terms, this crate decides
//! whether and how each one runs on the accelerator:
//! - **Invariant checking**: channel alignment, kernel/stride/pad bounds,
//!   CMX scratchpad budget
//! - **Tiling**: recursive output decomposition with back-inference of the
//!   input/weight/bias slices, when an operation overflows CMX
//! - **Distribution planning**: per-cluster compute/memory shapes, offsets
//!   and alignment for SOH/SOK/SOW-style multi-cluster strategies
//! - **Descriptor generation**: bit-exact weights table and activation
//!   window ("fake sparsity") records the hardware consumes at run time
//!
//! # Quick Start
//!
//! ```
//! use nce_lowering::{check_op, HardwareProfile, TilingEngine};
//! # use nce_lowering::{OpDescriptor, OpKind, PadInfo, TensorDescriptor, ElemType};
//!
//! let profile = HardwareProfile::kmb();
//! # let input = TensorDescriptor::new([1, 16, 16, 16], ElemType::U8);
//! # let weights = TensorDescriptor::new([16, 16, 3, 3], ElemType::U8);
//! # let output = TensorDescriptor::new([1, 16, 16, 16], ElemType::U8);
//! # let op = OpDescriptor::new(OpKind::Conv, input, output)
//! #     .with_weights(weights).with_kernel(3, 3).with_pad(PadInfo::same(1));
//! match check_op(&op, &profile) {
//!     Ok(()) => { /* run on the NCE as-is */ }
//!     Err(_) => {
//!         let tiles = TilingEngine::new(&profile).generate(&op);
//!         // re-check each tile, or fall back to software
//!         # let _ = tiles;
//!     }
//! }
//! ```

pub mod distribution;
pub mod error;
pub mod invariants;
pub mod op;
pub mod profile;
pub mod sparsity;
pub mod tiling;
pub mod types;

pub use distribution::{
    DistributionMode, DistributionPlan, DistributionPlanner, OperandPlans, OperandRole, Strategy,
};
pub use error::LoweringError;
pub use invariants::{check_op, EligibilityViolation, InvariantChecker};
pub use op::{conv_output_dim, KernelSize, OpDescriptor, OpKind, PadInfo, Strides};
pub use profile::{ArchGeneration, HardwareProfile};
pub use sparsity::{
    flatten_weights_table, ActivationWindow, DescriptorGenerator, WeightsTableParams,
    WeightsTableRecord, SPARSITY_PTR_NONE,
};
pub use tiling::{fill_divided_tiles, Subgraph, Tile, TileStep, TilingEngine};
pub use types::{
    ElemType, Layout, MemorySpace, Quantization, Shape, TensorDescriptor,
};
