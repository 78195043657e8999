use std::{
    collections::VecDeque,
    path::PathBuf,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::{
    context::PartitionContext,
    error::{ConfigError, PartitionError, StorageError},
    metrics::LogMetrics,
};

use super::{
    entry::{EntryType, LogEntry, RECORD_HEADER_SIZE},
    manager::{
        DEFAULT_MAX_ENTRIES_PER_SEGMENT, DEFAULT_MAX_SEGMENT_SIZE, DiskStats, MIN_SEGMENT_SIZE,
        SegmentManager, SegmentManagerOptions,
    },
    reader::{LogReader, ReadMode, ReaderShared},
};

#[derive(Clone, Debug)]
pub struct LogStoreOptions {
    /// Directory for storing log segments
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Maximum entries per segment before rotation
    pub max_entries_per_segment: usize,
    /// Whether to sync after each write
    pub sync_on_write: bool,
    /// Disk budget for the log in bytes; appends fail once reached.
    /// 0 disables the check.
    pub max_disk_usage: u64,
    /// Recent entries kept in memory for reads; 0 disables caching
    pub cache_entries_size: usize,
}

impl Default for LogStoreOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_entries_per_segment: DEFAULT_MAX_ENTRIES_PER_SEGMENT,
            sync_on_write: true,
            max_disk_usage: 0,
            cache_entries_size: 1024,
        }
    }
}

impl LogStoreOptions {
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_segment_size < MIN_SEGMENT_SIZE {
            return Err(ConfigError::SegmentSizeTooSmall {
                min: MIN_SEGMENT_SIZE,
                got: self.max_segment_size,
            });
        }
        Ok(())
    }
}

struct LogStoreInner {
    options: LogStoreOptions,
    manager: SegmentManager,
    /// Highest committed index. Volatile; re-established after restart.
    commit_index: AtomicU64,
    closed: AtomicBool,
    /// Most recently appended entries, for reads that chase the tail
    cache: RwLock<VecDeque<LogEntry>>,
    /// Position slots of live readers, consulted before deletion
    readers: RwLock<Vec<Weak<ReaderShared>>>,
    metrics: Arc<LogMetrics>,
}

/// Append-only log over rotating segment files.
///
/// A single writer appends and commits; any number of readers observe
/// the log concurrently. Deletion raises a floor rather than rewriting
/// files: the entry at the floor stays readable, everything below it
/// goes away.
#[derive(Clone)]
pub struct LogStore {
    inner: Arc<LogStoreInner>,
}

impl LogStore {
    pub fn open(options: LogStoreOptions) -> Result<Self, StorageError> {
        let metrics = Arc::new(LogMetrics::default());
        let manager_options = SegmentManagerOptions {
            dir: options.dir.clone(),
            max_segment_size: options.max_segment_size,
            max_entries_per_segment: options.max_entries_per_segment,
            sync_on_write: options.sync_on_write,
        };

        let manager = SegmentManager::new(manager_options, metrics.clone()).map_err(|e| {
            warn!("Failed to open log store: {}", e);
            StorageError::Io(Arc::new(e))
        })?;

        Ok(Self {
            inner: Arc::new(LogStoreInner {
                options,
                manager,
                commit_index: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                cache: RwLock::new(VecDeque::new()),
                readers: RwLock::new(Vec::new()),
                metrics,
            }),
        })
    }

    /// Opens a positioned reader starting at the first retained entry.
    pub fn reader(&self, mode: ReadMode) -> LogReader {
        let shared = Arc::new(ReaderShared::new(self.first_index()));
        self.inner.readers.write().push(Arc::downgrade(&shared));
        LogReader::new(self.clone(), mode, shared)
    }

    /// Lowest position across live readers, or `None` when no reader is
    /// open. Dropped readers stop counting.
    pub fn lowest_reader_position(&self) -> Option<u64> {
        let mut readers = self.inner.readers.write();
        readers.retain(|weak| weak.strong_count() > 0);
        readers
            .iter()
            .filter_map(|weak| weak.upgrade())
            .map(|shared| shared.position())
            .min()
    }

    fn check_open(&self) -> Result<(), StorageError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    /// Appends pre-stamped entries. Indices must continue the log without
    /// a gap. Returns the number of bytes written.
    pub fn append(&self, entries: &[LogEntry]) -> Result<u64, StorageError> {
        self.check_open()?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut expected = self.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::IndexMismatch {
                    expected,
                    found: entry.index,
                });
            }
            expected += 1;
        }

        if self.inner.options.max_disk_usage > 0 {
            let usage = self.inner.manager.disk_usage();
            if usage >= self.inner.options.max_disk_usage {
                let required: u64 = entries
                    .iter()
                    .map(|e| e.payload.len() as u64 + RECORD_HEADER_SIZE as u64)
                    .sum();
                return Err(StorageError::InsufficientDiskSpace {
                    required,
                    available: self.inner.options.max_disk_usage.saturating_sub(usage),
                });
            }
        }

        let start = Instant::now();
        let bytes = self.inner.manager.write_entries(entries).map_err(|e| {
            warn!("Failed to append entries: {}", e);
            StorageError::Io(Arc::new(e))
        })?;
        self.inner
            .metrics
            .record_append(entries.len() as u64, bytes, start.elapsed());

        self.cache_put(entries);

        Ok(bytes)
    }

    /// Advances the commit watermark. Lower indices are ignored; an index
    /// past the appended tail is refused.
    pub fn commit(&self, index: u64) -> Result<(), StorageError> {
        self.check_open()?;
        let last_index = self.last_index();
        if index > last_index {
            return Err(StorageError::CommitBeyondAppend { index, last_index });
        }
        self.inner.commit_index.fetch_max(index, Ordering::SeqCst);
        Ok(())
    }

    /// Deletes entries below `bound`, keeping the entry at the bound as
    /// the new floor. A bound past the tail is clamped so the last entry
    /// always survives. Returns the floor now in effect.
    pub fn delete_until(&self, bound: u64) -> Result<u64, StorageError> {
        self.check_open()?;

        let floor = bound.min(self.last_index());
        let current = self.inner.manager.floor();
        if floor <= current {
            debug!("Skipping deletion: floor {} already at {}", floor, current);
            return Ok(current);
        }

        self.inner.manager.delete_until(floor).map_err(|e| {
            warn!("Failed to delete entries below {}: {}", floor, e);
            StorageError::Io(Arc::new(e))
        })?;
        self.cache_prune_below(floor);

        Ok(floor)
    }

    /// First retained index
    pub fn first_index(&self) -> u64 {
        self.inner.manager.first_index()
    }

    /// Index of the most recently appended entry, 0 when empty
    pub fn last_index(&self) -> u64 {
        self.inner.manager.last_index()
    }

    /// Highest committed index, 0 before the first commit
    pub fn commit_index(&self) -> u64 {
        self.inner.commit_index.load(Ordering::SeqCst)
    }

    pub fn floor(&self) -> u64 {
        self.inner.manager.floor()
    }

    pub fn read_entry(&self, index: u64) -> Result<LogEntry, StorageError> {
        let first = self.first_index();
        let last = self.last_index();
        if index < first || index > last {
            return Err(StorageError::OutOfRange { index, first, last });
        }

        if let Some(entry) = self.cache_get_one(index) {
            return Ok(entry);
        }

        self.inner.manager.get_entry(index).map_err(|e| {
            warn!("Failed to read entry {}: {}", index, e);
            StorageError::Io(Arc::new(e))
        })
    }

    /// Reads `[low, high)` clamped to the retained range
    pub fn read_entries(&self, low: u64, high: u64) -> Result<Vec<LogEntry>, StorageError> {
        let low = low.max(self.first_index());
        let high = high.min(self.last_index() + 1);
        if low >= high {
            return Ok(Vec::new());
        }

        if let Some(entries) = self.cache_get(low, high) {
            return Ok(entries);
        }

        self.inner.manager.get_entries(low, high).map_err(|e| {
            warn!("Failed to read entries [{}, {}): {}", low, high, e);
            StorageError::Io(Arc::new(e))
        })
    }

    pub fn disk_stats(&self) -> DiskStats {
        self.inner.manager.disk_stats()
    }

    pub fn disk_usage(&self) -> u64 {
        self.inner.manager.disk_usage()
    }

    pub fn segment_count(&self) -> usize {
        self.inner.manager.segment_count()
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        self.inner
            .manager
            .sync_all()
            .map_err(|e| StorageError::Io(Arc::new(e)))
    }

    pub fn metrics(&self) -> Arc<LogMetrics> {
        self.inner.metrics.clone()
    }

    /// Refuses further mutation. Reads keep working so a snapshot can
    /// still drain the log.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn cache_put(&self, entries: &[LogEntry]) {
        let cache_size = self.inner.options.cache_entries_size;
        if cache_size == 0 {
            return;
        }
        let mut cache = self.inner.cache.write();
        for entry in entries {
            cache.push_back(entry.clone());
            if cache.len() > cache_size {
                cache.pop_front();
            }
        }
    }

    fn cache_get(&self, low: u64, high: u64) -> Option<Vec<LogEntry>> {
        let cache = self.inner.cache.read();
        if cache.is_empty() {
            return None;
        }

        let first_cached = cache.front()?.index;
        let last_cached = cache.back()?.index;

        // Serve only fully cached ranges
        if low >= first_cached && high <= last_cached + 1 {
            let start_offset = (low - first_cached) as usize;
            let count = (high - low) as usize;

            let entries: Vec<LogEntry> =
                cache.iter().skip(start_offset).take(count).cloned().collect();

            if entries.len() == count {
                return Some(entries);
            }
        }
        None
    }

    fn cache_get_one(&self, index: u64) -> Option<LogEntry> {
        let cache = self.inner.cache.read();
        let first_cached = cache.front()?.index;
        let last_cached = cache.back()?.index;

        if index >= first_cached && index <= last_cached {
            let offset = (index - first_cached) as usize;
            return cache.get(offset).cloned();
        }
        None
    }

    fn cache_prune_below(&self, floor: u64) {
        let mut cache = self.inner.cache.write();
        while let Some(front) = cache.front() {
            if front.index < floor {
                cache.pop_front();
            } else {
                break;
            }
        }
    }
}

/// The partition's single log writer. Stamps each entry with the next
/// index, the current term and a wall-clock timestamp, then hands the
/// batch to the store. Every mutation is restricted to the owning
/// partition thread.
pub struct LogWriter {
    store: LogStore,
    context: Arc<PartitionContext>,
    term: u64,
}

impl LogWriter {
    pub fn new(store: LogStore, context: Arc<PartitionContext>) -> Self {
        Self {
            store,
            context,
            term: 1,
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Updates the term stamped on subsequent entries. Owning thread only.
    pub fn set_term(&mut self, term: u64) -> Result<(), PartitionError> {
        self.context.check_thread()?;
        self.term = term;
        Ok(())
    }

    /// Appends one entry. Returns its index.
    pub fn append(&self, entry_type: EntryType, payload: Vec<u8>) -> Result<u64, PartitionError> {
        self.append_batch(vec![(entry_type, payload)])
    }

    /// Appends a batch as consecutive entries. Returns the index of the
    /// last entry written.
    pub fn append_batch(
        &self,
        batch: Vec<(EntryType, Vec<u8>)>,
    ) -> Result<u64, PartitionError> {
        self.context.check_thread()?;
        if batch.is_empty() {
            return Ok(self.store.last_index());
        }

        let base = self.store.last_index() + 1;
        let timestamp_ms = current_timestamp_ms();
        let entries: Vec<LogEntry> = batch
            .into_iter()
            .enumerate()
            .map(|(i, (entry_type, payload))| LogEntry {
                index: base + i as u64,
                term: self.term,
                entry_type,
                timestamp_ms,
                payload,
            })
            .collect();

        let last = base + entries.len() as u64 - 1;
        self.store.append(&entries)?;
        Ok(last)
    }

    /// Advances the commit watermark. Owning thread only.
    pub fn commit(&self, index: u64) -> Result<(), PartitionError> {
        self.context.check_thread()?;
        self.store.commit(index)?;
        Ok(())
    }

    pub fn store(&self) -> &LogStore {
        &self.store
    }
}

pub(crate) fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
