//! Strata: GEMM and all-gather execution thunks for a GPU compiler backend
//!
//! This crate holds the backend-agnostic part of two compiled operations:
//!
//! - [`gemm`]: batched, possibly transposed matrix multiplies lowered onto an
//!   external math library through the [`MatmulBackend`] trait.
//! - [`collective`]: all-gather validation and dispatch over an opened
//!   [`Communicator`].
//!
//! Hardware backends implement the traits; `strata-cpu` provides an
//! in-process reference implementation.

#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod collective;
pub mod config;
pub mod dtype;
pub mod error;
pub mod gemm;
pub mod memory;

pub use collective::{
    run_all_gather, AllGatherOp, AllGatherStartThunk, Buffer, CollectiveConfig,
    CollectiveOpGroupMode, Communicator, DeviceBufferPair, OperandShape, ReplicaGroup,
};
pub use config::{ComputePrecision, Fp32MathMode};
pub use dtype::{DType, GemmElementType, TensorDType};
pub use error::{Error, Result};
pub use gemm::{
    run_gemm, GemmConfig, MatmulArgs, MatmulBackend, MatmulPrimitive, MatmulPrimitiveDesc,
    MatrixLayout, Order, PostOp,
};
pub use memory::{BufferAllocations, BufferSlice, DeviceMemory, ScratchAllocator};
