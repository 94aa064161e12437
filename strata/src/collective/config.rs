//! Static configuration shared by collective thunks

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DType;
use crate::{Error, Result};

/// How the ids in a replica group map onto participating devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectiveOpGroupMode {
    /// Ids are replica ids; every partition runs its own collective
    CrossReplica,
    /// Ids are partition ids; every replica runs its own collective
    CrossPartition,
    /// Ids are replica ids, and each group spans all partitions of those replicas
    CrossReplicaAndPartition,
    /// Ids are flattened `replica * partition_count + partition` ids
    FlattenedId,
}

impl CollectiveOpGroupMode {
    /// Derive the mode from an op's channel id and `use_global_device_ids`.
    ///
    /// # Errors
    /// Returns an error for `use_global_device_ids = true` without a
    /// channel id, which has no meaning.
    pub fn from_op_metadata(
        has_channel_id: bool,
        use_global_device_ids: Option<bool>,
    ) -> Result<Self> {
        match (has_channel_id, use_global_device_ids) {
            (false, None | Some(false)) => Ok(Self::CrossReplica),
            (false, Some(true)) => Err(Error::InvalidConfig(
                "use_global_device_ids requires a channel id".to_string(),
            )),
            (true, None) => Ok(Self::CrossPartition),
            (true, Some(false)) => Ok(Self::CrossReplicaAndPartition),
            (true, Some(true)) => Ok(Self::FlattenedId),
        }
    }

    /// Size of the id space replica groups draw from.
    #[must_use]
    pub fn participant_space(self, replica_count: usize, partition_count: usize) -> usize {
        match self {
            Self::CrossReplica | Self::CrossReplicaAndPartition => replica_count,
            Self::CrossPartition => partition_count,
            Self::FlattenedId => replica_count * partition_count,
        }
    }
}

impl fmt::Display for CollectiveOpGroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CrossReplica => "cross_replica",
            Self::CrossPartition => "cross_partition",
            Self::CrossReplicaAndPartition => "cross_replica_and_partition",
            Self::FlattenedId => "flattened_id",
        };
        f.write_str(name)
    }
}

/// One group of participants exchanging data with each other.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicaGroup {
    pub replica_ids: Vec<usize>,
}

impl ReplicaGroup {
    #[must_use]
    pub fn new(replica_ids: Vec<usize>) -> Self {
        Self { replica_ids }
    }
}

/// Configuration common to every collective thunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveConfig {
    pub operand_count: usize,
    pub operand_element_types: Vec<DType>,
    /// Empty means a single group containing every participant
    #[serde(default)]
    pub replica_groups: Vec<ReplicaGroup>,
    pub group_mode: CollectiveOpGroupMode,
    #[serde(default)]
    pub op_id: i64,
}

impl CollectiveConfig {
    /// Whether the collective exchanges nothing: every group has exactly one
    /// member, or there are no explicit groups and only one participant.
    #[must_use]
    pub fn is_degenerate(&self, replica_count: usize, partition_count: usize) -> bool {
        let groups_empty = self.replica_groups.is_empty();
        let all_singleton = !groups_empty
            && self
                .replica_groups
                .iter()
                .all(|group| group.replica_ids.len() == 1);
        match self.group_mode {
            CollectiveOpGroupMode::CrossReplica => {
                all_singleton || (groups_empty && replica_count == 1)
            }
            CollectiveOpGroupMode::CrossPartition => {
                all_singleton || (groups_empty && partition_count == 1)
            }
            CollectiveOpGroupMode::CrossReplicaAndPartition => {
                all_singleton || (groups_empty && replica_count == 1 && partition_count == 1)
            }
            CollectiveOpGroupMode::FlattenedId => all_singleton,
        }
    }

    /// Validate replica groups against the participant id space.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if an id is out of range or repeated, groups
    /// differ in size, or flattened-id mode has no explicit groups.
    pub fn check_replica_groups(&self, replica_count: usize, partition_count: usize) -> Result<()> {
        if self.replica_groups.is_empty() {
            if self.group_mode == CollectiveOpGroupMode::FlattenedId {
                return Err(Error::InvalidConfig(
                    "flattened_id mode requires explicit replica groups".to_string(),
                ));
            }
            return Ok(());
        }

        let space = self
            .group_mode
            .participant_space(replica_count, partition_count);
        let group_size = self.replica_groups[0].replica_ids.len();
        let mut seen = vec![false; space];
        for group in &self.replica_groups {
            if group.replica_ids.len() != group_size {
                return Err(Error::InvalidConfig(format!(
                    "replica groups must have equal sizes, found {} and {group_size}",
                    group.replica_ids.len()
                )));
            }
            for &id in &group.replica_ids {
                let slot = seen.get_mut(id).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "replica group id {id} out of range for {} participants",
                        space
                    ))
                })?;
                if *slot {
                    return Err(Error::InvalidConfig(format!(
                        "replica group id {id} appears more than once"
                    )));
                }
                *slot = true;
            }
        }
        Ok(())
    }
}

/// Configuration of an all-gather thunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllGatherConfig {
    pub config: CollectiveConfig,
}
