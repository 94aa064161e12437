//! Collective-communication thunks
//!
//! Only all-gather is implemented. Config validation runs at compile time;
//! execution issues calls on a [`Communicator`] the caller has opened.

pub mod all_gather;
pub mod comm;
pub mod config;

pub use all_gather::{
    is_type_supported_for_all_gather, run_all_gather, AllGatherOp, AllGatherStartThunk, Buffer,
    DeviceBufferPair, OperandShape, ALL_GATHER_START_OP_NAME,
};
pub use comm::Communicator;
pub use config::{AllGatherConfig, CollectiveConfig, CollectiveOpGroupMode, ReplicaGroup};
