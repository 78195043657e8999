use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

pub type OperationId = u32;
pub type SessionId = u64;

/// Identifies one partition of the replicated log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct PartitionId(pub u32);

impl Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Identifies one snapshot; unique per store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
pub struct SnapshotId(u64);

impl SnapshotId {
    pub fn new() -> Self {
        Self(rand::random::<u64>())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<SnapshotId> for u64 {
    fn from(val: SnapshotId) -> Self {
        val.0
    }
}

impl From<u64> for SnapshotId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
