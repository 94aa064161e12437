//! All-gather thunk
//!
//! Compile time: [`AllGatherStartThunk::check_implementable`] decides whether
//! an all-gather op can be lowered to the communication library, and
//! [`AllGatherStartThunk::new`] captures its configuration. Run time:
//! [`AllGatherStartThunk::execute`] resolves the operand buffers and hands
//! them to [`run_all_gather`].

use std::fmt;

use serde::{Deserialize, Serialize};

use super::comm::Communicator;
use super::config::{AllGatherConfig, CollectiveConfig, CollectiveOpGroupMode, ReplicaGroup};
use crate::dtype::DType;
use crate::memory::{BufferAllocations, BufferSlice, DeviceMemory};
use crate::{Error, Result};

/// Name of the op this thunk executes.
pub const ALL_GATHER_START_OP_NAME: &str = "all-gather-start";

/// Element type and dimensions (major to minor) of one operand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperandShape {
    pub element_type: DType,
    pub dimensions: Vec<usize>,
}

impl OperandShape {
    #[must_use]
    pub fn new(element_type: DType, dimensions: Vec<usize>) -> Self {
        Self {
            element_type,
            dimensions,
        }
    }

    #[must_use]
    pub fn element_count(&self) -> usize {
        self.dimensions.iter().product()
    }

    /// Whether every dimension more major than `dim` has extent 1, so that
    /// gathering along `dim` is a plain concatenation of contiguous blocks.
    #[must_use]
    pub fn is_effectively_most_major(&self, dim: usize) -> bool {
        self.dimensions[..dim].iter().all(|&d| d == 1)
    }
}

impl fmt::Display for OperandShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.element_type)?;
        for (i, d) in self.dimensions.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{d}")?;
        }
        f.write_str("]")
    }
}

/// Compiler-side description of an all-gather op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllGatherOp {
    pub operands: Vec<OperandShape>,
    pub all_gather_dimension: usize,
    #[serde(default)]
    pub replica_groups: Vec<ReplicaGroup>,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub use_global_device_ids: Option<bool>,
    #[serde(default)]
    pub op_id: i64,
}

/// Source and destination slices of one all-gather operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buffer {
    /// Elements contributed by this rank
    pub element_count: usize,
    pub source: BufferSlice,
    pub destination: BufferSlice,
}

/// One operand resolved to device memory, ready for the library call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBufferPair {
    pub element_type: DType,
    pub element_count: usize,
    pub source: DeviceMemory,
    pub destination: DeviceMemory,
}

/// Whether the communication library can all-gather elements of `dtype`.
#[must_use]
pub fn is_type_supported_for_all_gather(dtype: DType) -> bool {
    !matches!(dtype, DType::S4 | DType::U4 | DType::Token)
}

/// Executes one all-gather op over a communicator.
#[derive(Debug, Clone)]
pub struct AllGatherStartThunk {
    config: AllGatherConfig,
    buffers: Vec<Buffer>,
}

impl AllGatherStartThunk {
    /// Capture the configuration of `op` with one buffer per operand.
    ///
    /// # Errors
    /// Returns an error if the group mode is invalid or the buffer count
    /// does not match the operand count.
    pub fn new(op: &AllGatherOp, buffers: Vec<Buffer>) -> Result<Self> {
        if buffers.len() != op.operands.len() {
            return Err(Error::InvalidConfig(format!(
                "{ALL_GATHER_START_OP_NAME} has {} operands but {} buffers",
                op.operands.len(),
                buffers.len()
            )));
        }
        let config = collective_config(op, Self::group_mode(op)?);
        Ok(Self {
            config: AllGatherConfig { config },
            buffers,
        })
    }

    #[must_use]
    pub fn op_name() -> &'static str {
        ALL_GATHER_START_OP_NAME
    }

    /// Derive how participants are grouped for `op`.
    ///
    /// # Errors
    /// Returns an error for `use_global_device_ids` without a channel id.
    pub fn group_mode(op: &AllGatherOp) -> Result<CollectiveOpGroupMode> {
        CollectiveOpGroupMode::from_op_metadata(op.channel_id.is_some(), op.use_global_device_ids)
    }

    /// Check whether `op` can run on a topology of `replica_count` replicas
    /// and `partition_count` partitions.
    ///
    /// # Errors
    /// `Unimplemented` for element types or gather dimensions the library
    /// cannot handle; `InvalidConfig` for impossible topologies or groups.
    /// Messages carry the op name, the topology and the group mode.
    pub fn check_implementable(
        op: &AllGatherOp,
        replica_count: usize,
        partition_count: usize,
    ) -> Result<()> {
        check_all_gather(op, replica_count, partition_count)
            .map_err(|e| add_op_description(e, op, replica_count, partition_count))
    }

    #[must_use]
    pub fn config(&self) -> &CollectiveConfig {
        &self.config.config
    }

    #[must_use]
    pub fn buffers(&self) -> &[Buffer] {
        &self.buffers
    }

    /// Resolve buffers against `allocations` and run the all-gather.
    ///
    /// # Errors
    /// Returns an error if a buffer slice cannot be resolved or the
    /// communicator fails.
    pub fn execute<C: Communicator>(
        &self,
        allocations: &BufferAllocations,
        stream: &C::Stream,
        comm: &C,
    ) -> Result<()> {
        let device_buffers = self
            .buffers
            .iter()
            .zip(&self.config.config.operand_element_types)
            .map(|(buffer, &element_type)| -> Result<DeviceBufferPair> {
                Ok(DeviceBufferPair {
                    element_type,
                    element_count: buffer.element_count,
                    source: allocations.device_address(buffer.source)?,
                    destination: allocations.device_address(buffer.destination)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        run_all_gather(&device_buffers, stream, comm)
    }
}

fn check_all_gather(op: &AllGatherOp, replica_count: usize, partition_count: usize) -> Result<()> {
    if replica_count == 0 || partition_count == 0 {
        return Err(Error::InvalidConfig(format!(
            "replica_count ({replica_count}) and partition_count ({partition_count}) \
             must be positive"
        )));
    }
    let group_mode = AllGatherStartThunk::group_mode(op)?;

    for operand in &op.operands {
        if !is_type_supported_for_all_gather(operand.element_type) {
            return Err(Error::Unimplemented(format!(
                "input of type {}",
                operand.element_type
            )));
        }
        if op.all_gather_dimension >= operand.dimensions.len() {
            return Err(Error::InvalidConfig(format!(
                "all-gather dim {} out of range for input shape {operand}",
                op.all_gather_dimension
            )));
        }
        if !operand.is_effectively_most_major(op.all_gather_dimension) {
            return Err(Error::Unimplemented(format!(
                "all-gather dim {} is not the most major in input shape {operand}",
                op.all_gather_dimension
            )));
        }
    }

    collective_config(op, group_mode).check_replica_groups(replica_count, partition_count)
}

fn collective_config(op: &AllGatherOp, group_mode: CollectiveOpGroupMode) -> CollectiveConfig {
    CollectiveConfig {
        operand_count: op.operands.len(),
        operand_element_types: op.operands.iter().map(|o| o.element_type).collect(),
        replica_groups: op.replica_groups.clone(),
        group_mode,
        op_id: op.op_id,
    }
}

fn add_op_description(
    error: Error,
    op: &AllGatherOp,
    replica_count: usize,
    partition_count: usize,
) -> Error {
    let group_mode = AllGatherStartThunk::group_mode(op)
        .map_or_else(|_| "invalid".to_string(), |mode| mode.to_string());
    let describe = |message: String| {
        format!(
            "{message}; {ALL_GATHER_START_OP_NAME} with replica_count: {replica_count}, \
             partition_count: {partition_count}, group_mode: {group_mode}, operand_count: {}",
            op.operands.len()
        )
    };
    match error {
        Error::Unimplemented(message) => Error::Unimplemented(describe(message)),
        Error::InvalidConfig(message) => Error::InvalidConfig(describe(message)),
        other => other,
    }
}

/// Source and destination byte counts for one pair.
fn gather_sizes(buffer: &DeviceBufferPair, world_size: usize) -> Result<(usize, usize)> {
    buffer
        .element_count
        .checked_mul(buffer.element_type.size_in_bytes())
        .and_then(|bytes| Some((bytes, bytes.checked_mul(world_size)?)))
        .ok_or_else(|| {
            Error::InvalidConfig(format!(
                "all-gather of {} x {} over {world_size} ranks overflows the address space",
                buffer.element_count, buffer.element_type
            ))
        })
}

/// Issue one all-gather per buffer pair on `stream`, batched in a single
/// communicator group.
///
/// A failing pair aborts immediately; pairs issued before it are not
/// rolled back.
///
/// # Errors
/// Returns an error if a buffer is too small for the gather or the
/// communicator reports a failure.
pub fn run_all_gather<C: Communicator>(
    buffers: &[DeviceBufferPair],
    stream: &C::Stream,
    comm: &C,
) -> Result<()> {
    let world_size = comm.world_size();
    for buffer in buffers {
        let (bytes, gathered_bytes) = gather_sizes(buffer, world_size)?;
        if buffer.source.size() < bytes || buffer.destination.size() < gathered_bytes {
            return Err(Error::InvalidConfig(format!(
                "all-gather of {} x {} over {world_size} ranks needs {bytes} source and \
                 {gathered_bytes} destination bytes, got {} and {}",
                buffer.element_count,
                buffer.element_type,
                buffer.source.size(),
                buffer.destination.size()
            )));
        }
    }

    tracing::debug!(rank = comm.rank(), "Performing all-gather");
    comm.group_start()?;
    for buffer in buffers {
        tracing::debug!(
            rank = comm.rank(),
            dtype = %buffer.element_type,
            count = buffer.element_count,
            "all-gather buffer"
        );
        comm.all_gather(
            buffer.source,
            buffer.destination,
            buffer.element_type,
            buffer.element_count,
            stream,
        )?;
    }
    comm.group_end()?;
    tracing::debug!(rank = comm.rank(), "Done performing all-gather");
    Ok(())
}
