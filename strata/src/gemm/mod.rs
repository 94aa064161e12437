//! Batched GEMM execution over an external math library
//!
//! [`run_gemm`] turns a [`GemmConfig`] and three raw operand buffers into a
//! single matmul primitive on the backend:
//!
//! 1. derive row-major [`MatrixDescriptor`]s from the operand layouts,
//! 2. rewrite a transposed output via `Cᵗ = Bᵗ·Aᵗ` ([`make_gemm_compatible`]),
//! 3. validate dtypes and extents,
//! 4. build `(batch, rows, cols)` shapes and strides ([`BackendMatMulParams`]),
//! 5. express `alpha`/`beta` as fused post-ops and pick the fp32 math mode,
//! 6. allocate the backend's workspace and enqueue the primitive.

pub mod backend;
pub mod layout;
pub mod params;
pub mod runner;

pub use backend::{
    MatmulArgs, MatmulBackend, MatmulPrimitive, MatmulPrimitiveDesc, MemoryDesc, PostOp,
    PrimitiveAttr,
};
pub use layout::{make_gemm_compatible, MatrixDescriptor, MatrixLayout, Order, Transpose};
pub use params::BackendMatMulParams;
pub use runner::{check_gemm_dtypes, gemm_post_ops, run_gemm, GemmConfig, POST_OP_TOLERANCE};
