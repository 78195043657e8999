//! Versioned snapshot store.
//!
//! Each snapshot lives in its own directory named by `(index, term, id)`
//! and holds `data.bin`, `meta.json` and `checksum.sha256`. A snapshot is
//! written into a `.tmp` directory and published with a single rename, so
//! a partially written snapshot is never discoverable. Completion fires
//! registered listeners synchronously, then retention trims superseded
//! snapshots beyond the configured count.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{ConfigError, SnapshotError};
use crate::metrics::SnapshotMetrics;
use crate::storage::snapshot::chunk::{ChunkReader, SnapshotInstaller};
use crate::storage::snapshot::{SnapshotListener, SnapshotNotice};

pub const SNAPSHOT_VERSION_V1: u32 = 1;
pub const SNAPSHOT_DIR_PREFIX: &str = "snapshot_";
pub const PENDING_DIR_SUFFIX: &str = ".tmp";

pub const DEFAULT_MAX_SNAPSHOT_COUNT: usize = 2;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const DATA_FILE: &str = "data.bin";
const META_FILE: &str = "meta.json";
const CHECKSUM_FILE: &str = "checksum.sha256";

/// Snapshot store configuration options.
#[derive(Debug, Clone)]
pub struct SnapshotStoreOptions {
    /// Base directory for snapshot directories
    pub dir: PathBuf,
    /// Whether to verify the data checksum when loading
    pub verify_checksum: bool,
    /// Whether to sync files to disk after writes
    pub sync_on_write: bool,
    /// Complete snapshots retained; older ones are deleted
    pub max_snapshot_count: usize,
    /// Transfer chunk size in bytes
    pub chunk_size: usize,
}

impl Default for SnapshotStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/snapshots"),
            verify_checksum: true,
            sync_on_write: true,
            max_snapshot_count: DEFAULT_MAX_SNAPSHOT_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SnapshotStoreOptions {
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.max_snapshot_count == 0 {
            return Err(ConfigError::ZeroSnapshotCount);
        }
        Ok(())
    }
}

/// Snapshot metadata, stored as `meta.json` next to the data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// Last log index reflected in the snapshot
    pub index: u64,
    /// Term of the entry at `index`
    pub term: u64,
    /// Random id distinguishing retakes at the same index
    pub id: u64,
    /// On-disk format version
    pub version: u32,
    /// Creation time in seconds since the epoch
    pub created_at: u64,
    /// SHA256 of `data.bin`, hex-encoded
    pub checksum: String,
    /// Size of `data.bin` in bytes
    pub data_size: u64,
}

impl SnapshotMeta {
    pub fn dir_name(&self) -> String {
        format!(
            "{}{:010}_{:010}_{:016x}",
            SNAPSHOT_DIR_PREFIX, self.index, self.term, self.id
        )
    }
}

pub(crate) fn calculate_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn current_timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct SnapshotStoreInner {
    options: SnapshotStoreOptions,
    /// Complete snapshots ordered by (index, created_at, id); last is current
    snapshots: RwLock<Vec<SnapshotMeta>>,
    listeners: RwLock<Vec<Arc<dyn SnapshotListener>>>,
    metrics: Arc<SnapshotMetrics>,
}

/// Store of complete snapshots plus in-progress captures and installs.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<SnapshotStoreInner>,
}

impl SnapshotStore {
    /// Opens the store, scanning the directory for complete snapshots.
    /// Leftover pending directories from a crash are discarded; corrupt
    /// snapshot directories are skipped.
    pub fn open(
        options: SnapshotStoreOptions,
        metrics: Arc<SnapshotMetrics>,
    ) -> Result<Self, SnapshotError> {
        fs::create_dir_all(&options.dir)?;

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&options.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(SNAPSHOT_DIR_PREFIX) {
                continue;
            }
            let path = entry.path();

            if name.ends_with(PENDING_DIR_SUFFIX) {
                info!("Discarding leftover pending snapshot: {:?}", path);
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!("Failed to remove pending snapshot {:?}: {}", path, e);
                }
                continue;
            }

            match read_meta(&path) {
                Ok(meta) if meta.version == SNAPSHOT_VERSION_V1 => {
                    let data_path = path.join(DATA_FILE);
                    let valid = fs::metadata(&data_path)
                        .map(|m| m.len() == meta.data_size)
                        .unwrap_or(false);
                    if valid {
                        snapshots.push(meta);
                    } else {
                        warn!("Ignoring snapshot with truncated data: {:?}", path);
                    }
                }
                Ok(meta) => {
                    warn!(
                        "Ignoring snapshot with unsupported version {}: {:?}",
                        meta.version, path
                    );
                }
                Err(e) => {
                    warn!("Ignoring unreadable snapshot {:?}: {}", path, e);
                }
            }
        }

        snapshots.sort_by_key(|m| (m.index, m.created_at, m.id));
        info!(
            "Snapshot store opened at {:?} with {} snapshot(s), latest index {}",
            options.dir,
            snapshots.len(),
            snapshots.last().map(|m| m.index).unwrap_or(0)
        );

        Ok(Self {
            inner: Arc::new(SnapshotStoreInner {
                options,
                snapshots: RwLock::new(snapshots),
                listeners: RwLock::new(Vec::new()),
                metrics,
            }),
        })
    }

    /// Begins capturing a snapshot at `index`. Data is written
    /// incrementally through the returned handle; nothing is visible
    /// until `complete()`.
    pub fn begin_snapshot(&self, index: u64, term: u64) -> Result<PendingSnapshot, SnapshotError> {
        let id = rand::random::<u64>();
        let meta_stub = SnapshotMeta {
            index,
            term,
            id,
            version: SNAPSHOT_VERSION_V1,
            created_at: 0,
            checksum: String::new(),
            data_size: 0,
        };
        let dir = self
            .inner
            .options
            .dir
            .join(format!("{}{}", meta_stub.dir_name(), PENDING_DIR_SUFFIX));
        fs::create_dir_all(&dir)?;
        let data_file = File::create(dir.join(DATA_FILE))?;

        debug!("Pending snapshot started: index={}, term={}, id={:016x}", index, term, id);

        Ok(PendingSnapshot {
            store: self.clone(),
            index,
            term,
            id,
            dir,
            data_file,
            hasher: Sha256::new(),
            written: 0,
            started_at: Instant::now(),
            completed: false,
        })
    }

    /// Begins installing a snapshot received chunk-by-chunk from a peer.
    /// The target metadata comes from the sender.
    pub fn begin_install(&self, meta: SnapshotMeta) -> Result<SnapshotInstaller, SnapshotError> {
        if meta.version != SNAPSHOT_VERSION_V1 {
            return Err(SnapshotError::InvalidMetadata(format!(
                "unsupported snapshot version {}",
                meta.version
            )));
        }
        let dir = self
            .inner
            .options
            .dir
            .join(format!("{}{}", meta.dir_name(), PENDING_DIR_SUFFIX));
        fs::create_dir_all(&dir)?;
        let data_file = File::create(dir.join(DATA_FILE))?;
        let total_chunks = total_chunks(meta.data_size, self.inner.options.chunk_size);

        debug!(
            "Snapshot install started: index={}, id={:016x}, {} chunk(s) expected",
            meta.index, meta.id, total_chunks
        );

        Ok(SnapshotInstaller::new(
            self.clone(),
            meta,
            dir,
            data_file,
            total_chunks,
        ))
    }

    /// Installs a fully received snapshot in one call, driving the
    /// chunk-by-chunk installer. Runs the file work off the calling task.
    pub async fn install_pending_snapshot(
        &self,
        meta: SnapshotMeta,
        chunks: Vec<crate::storage::snapshot::SnapshotChunk>,
    ) -> Result<SnapshotMeta, SnapshotError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let mut installer = store.begin_install(meta)?;
            for chunk in chunks {
                installer.apply_chunk(chunk)?;
            }
            installer.finish()
        })
        .await
        .map_err(|e| {
            SnapshotError::Io(std::io::Error::other(format!(
                "snapshot install task failed: {}",
                e
            )))
        })?
    }

    /// Chunk reader over the latest complete snapshot. Chunk order is
    /// stable for a given snapshot id, so a transfer can restart from a
    /// fresh reader.
    pub fn new_chunk_reader(&self) -> Result<ChunkReader, SnapshotError> {
        let meta = self
            .latest()
            .ok_or_else(|| SnapshotError::NotFound("latest".to_string()))?;
        self.new_chunk_reader_for(&meta)
    }

    pub fn new_chunk_reader_for(&self, meta: &SnapshotMeta) -> Result<ChunkReader, SnapshotError> {
        let dir = self.inner.options.dir.join(meta.dir_name());
        let file = File::open(dir.join(DATA_FILE))
            .map_err(|_| SnapshotError::NotFound(meta.dir_name()))?;
        Ok(ChunkReader::new(
            meta.clone(),
            file,
            self.inner.options.chunk_size,
        ))
    }

    /// Newest complete snapshot.
    pub fn latest(&self) -> Option<SnapshotMeta> {
        self.inner.snapshots.read().last().cloned()
    }

    /// All complete snapshots, oldest first.
    pub fn snapshots(&self) -> Vec<SnapshotMeta> {
        self.inner.snapshots.read().clone()
    }

    /// Reads a snapshot's data, verifying the checksum when configured.
    pub fn load(&self, meta: &SnapshotMeta) -> Result<Vec<u8>, SnapshotError> {
        let dir = self.inner.options.dir.join(meta.dir_name());
        let data = fs::read(dir.join(DATA_FILE))?;

        if self.inner.options.verify_checksum {
            let actual = calculate_checksum(&data);
            if actual != meta.checksum {
                return Err(SnapshotError::DataCorrupted(Arc::new(anyhow::anyhow!(
                    "snapshot {} data does not match its checksum",
                    meta.dir_name()
                ))));
            }
        }
        Ok(data)
    }

    pub fn load_latest(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, SnapshotError> {
        match self.latest() {
            Some(meta) => {
                let data = self.load(&meta)?;
                Ok(Some((meta, data)))
            }
            None => Ok(None),
        }
    }

    /// Async variant for callers off the owning thread.
    pub async fn load_latest_async(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>, SnapshotError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.load_latest())
            .await
            .map_err(|e| {
                SnapshotError::Io(std::io::Error::other(format!(
                    "snapshot load task failed: {}",
                    e
                )))
            })?
    }

    /// Registers a completion listener. Listeners fire synchronously in
    /// registration order; registering the same listener twice is a no-op.
    pub fn register_listener(&self, listener: Arc<dyn SnapshotListener>) {
        let mut listeners = self.inner.listeners.write();
        if listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        listeners.push(listener);
    }

    /// Removes a listener. Unknown listeners are ignored.
    pub fn unregister_listener(&self, listener: &Arc<dyn SnapshotListener>) {
        self.inner
            .listeners
            .write()
            .retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Deletes superseded snapshots beyond the newest `keep`. Failures
    /// are logged, never returned. Returns the number deleted.
    pub fn ensure_max_snapshot_count(&self, keep: usize) -> usize {
        let keep = keep.max(1);
        let excess: Vec<SnapshotMeta> = {
            let mut snapshots = self.inner.snapshots.write();
            if snapshots.len() <= keep {
                return 0;
            }
            let split = snapshots.len() - keep;
            snapshots.drain(..split).collect()
        };

        let mut removed = 0;
        for meta in excess {
            let dir = self.inner.options.dir.join(meta.dir_name());
            match fs::remove_dir_all(&dir) {
                Ok(()) => {
                    debug!("Deleted superseded snapshot: {:?}", dir);
                    removed += 1;
                }
                Err(e) => {
                    warn!("Failed to delete superseded snapshot {:?}: {}", dir, e);
                }
            }
        }
        if removed > 0 {
            self.inner.metrics.add_retention_deleted(removed);
        }
        removed as usize
    }

    pub fn metrics(&self) -> Arc<SnapshotMetrics> {
        self.inner.metrics.clone()
    }

    pub fn options(&self) -> &SnapshotStoreOptions {
        &self.inner.options
    }

    /// Publishes a fully written `.tmp` directory: one rename, registry
    /// insert, synchronous listener notification, then retention. Both
    /// local captures and chunk installs land here so their
    /// post-conditions are identical.
    pub(crate) fn publish(
        &self,
        tmp_dir: &Path,
        meta: SnapshotMeta,
    ) -> Result<SnapshotMeta, SnapshotError> {
        {
            let snapshots = self.inner.snapshots.read();
            if snapshots.iter().any(|m| m.id == meta.id) {
                return Err(SnapshotError::AlreadyCompleted);
            }
        }

        let final_dir = self.inner.options.dir.join(meta.dir_name());
        fs::rename(tmp_dir, &final_dir)?;

        {
            let mut snapshots = self.inner.snapshots.write();
            snapshots.push(meta.clone());
            snapshots.sort_by_key(|m| (m.index, m.created_at, m.id));
        }

        info!(
            "Snapshot complete: index={}, term={}, id={:016x}, size={}",
            meta.index, meta.term, meta.id, meta.data_size
        );

        let notice = SnapshotNotice {
            index: meta.index,
            term: meta.term,
            compaction_bound: meta.index,
        };
        let listeners: Vec<_> = self.inner.listeners.read().clone();
        for listener in listeners {
            listener.on_new_snapshot(notice);
        }

        self.ensure_max_snapshot_count(self.inner.options.max_snapshot_count);
        Ok(meta)
    }
}

pub(crate) fn total_chunks(data_size: u64, chunk_size: usize) -> u32 {
    data_size.div_ceil(chunk_size as u64) as u32
}

fn read_meta(snapshot_dir: &Path) -> Result<SnapshotMeta, SnapshotError> {
    let content = fs::read_to_string(snapshot_dir.join(META_FILE))?;
    serde_json::from_str(&content).map_err(|e| SnapshotError::InvalidMetadata(e.to_string()))
}

pub(crate) fn write_sidecars(
    dir: &Path,
    meta: &SnapshotMeta,
    sync: bool,
) -> Result<(), SnapshotError> {
    let meta_json = serde_json::to_string_pretty(meta)
        .map_err(|e| SnapshotError::InvalidMetadata(e.to_string()))?;

    let mut meta_file = File::create(dir.join(META_FILE))?;
    meta_file.write_all(meta_json.as_bytes())?;
    if sync {
        meta_file.sync_all()?;
    }

    let mut checksum_file = File::create(dir.join(CHECKSUM_FILE))?;
    checksum_file.write_all(meta.checksum.as_bytes())?;
    if sync {
        checksum_file.sync_all()?;
    }
    Ok(())
}

/// A snapshot being captured. Write incrementally, then `complete()` to
/// publish atomically; dropping without completing discards the capture.
pub struct PendingSnapshot {
    store: SnapshotStore,
    index: u64,
    term: u64,
    id: u64,
    dir: PathBuf,
    data_file: File,
    hasher: Sha256,
    written: u64,
    started_at: Instant,
    completed: bool,
}

impl PendingSnapshot {
    pub fn write(&mut self, payload: &[u8]) -> Result<(), SnapshotError> {
        self.data_file.write_all(payload)?;
        self.hasher.update(payload);
        self.written += payload.len() as u64;
        Ok(())
    }

    /// Publishes the snapshot. The previous complete snapshot becomes
    /// superseded; listeners fire before this returns.
    pub fn complete(mut self) -> Result<SnapshotMeta, SnapshotError> {
        if self.store.inner.options.sync_on_write {
            self.data_file.sync_all()?;
        }

        let meta = SnapshotMeta {
            index: self.index,
            term: self.term,
            id: self.id,
            version: SNAPSHOT_VERSION_V1,
            created_at: current_timestamp_secs(),
            checksum: format!("{:x}", self.hasher.clone().finalize()),
            data_size: self.written,
        };
        write_sidecars(&self.dir, &meta, self.store.inner.options.sync_on_write)?;

        let meta = self.store.publish(&self.dir, meta)?;
        self.completed = true;
        self.store.inner.metrics.record_take(self.started_at.elapsed());
        Ok(meta)
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Drop for PendingSnapshot {
    fn drop(&mut self) {
        if !self.completed {
            debug!("Discarding pending snapshot at index {}", self.index);
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!("Failed to remove pending snapshot {:?}: {}", self.dir, e);
            }
        }
    }
}
