//! Snapshot persistence and transfer.
//!
//! Snapshots move through pending -> complete -> superseded -> deleted.
//! Completion is the only transition observers see: listeners registered
//! with the store fire synchronously, in registration order, each time a
//! snapshot is published (whether captured locally or installed from a
//! peer).

mod chunk;
mod store;


pub use chunk::{ChunkReader, SnapshotChunk, SnapshotInstaller};
pub use store::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_SNAPSHOT_COUNT, PENDING_DIR_SUFFIX, PendingSnapshot,
    SNAPSHOT_DIR_PREFIX, SNAPSHOT_VERSION_V1, SnapshotMeta, SnapshotStore, SnapshotStoreOptions,
};

/// What listeners learn about a newly complete snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotNotice {
    /// Last log index reflected in the snapshot
    pub index: u64,
    /// Term of the entry at `index`
    pub term: u64,
    /// Highest index compaction may safely consider covered
    pub compaction_bound: u64,
}

/// Observer of snapshot completion. Implementations run synchronously on
/// the completing thread and must not block.
pub trait SnapshotListener: Send + Sync {
    fn on_new_snapshot(&self, notice: SnapshotNotice);
}
