//! CPU reference backend for Strata.
//!
//! Implements the GEMM and collective seams in-process: device memory is a
//! host arena, a stream is a FIFO of deferred work, the matmul engine is a
//! Rayon thread pool and the communicator is a barrier-based loopback group.
//!
//! This backend is intended for testing the dispatch layer and checking
//! numerics. It is not optimised for throughput.

#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions
)]

pub mod allocator;
pub mod comm;
pub mod device;
pub mod matmul;
pub mod stream;

pub use allocator::ArenaScratchAllocator;
pub use comm::LoopbackCommunicator;
pub use device::HostDevice;
pub use matmul::{CpuMatmulBackend, CpuMatmulPrimitive};
pub use stream::CpuStream;
