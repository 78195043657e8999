//! Log truncation behind the latest snapshot.
//!
//! The compactor only ever deletes a prefix the snapshot already covers,
//! held back by a replication threshold so trailing readers are not
//! forced into a snapshot install by routine cleanup. The deletion
//! service connects snapshot completion to compaction without the
//! snapshot store knowing about the log.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::context::PartitionContext;
use crate::error::CompactionError;
use crate::metrics::CompactionMetrics;
use crate::storage::log::LogStore;
use crate::storage::snapshot::{SnapshotListener, SnapshotNotice};

pub const DEFAULT_REPLICATION_THRESHOLD: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct CompactionOptions {
    /// Entries kept below the compactable index so lagging replicas can
    /// still be served from the log
    pub replication_threshold: u64,
}

impl Default for CompactionOptions {
    fn default() -> Self {
        Self {
            replication_threshold: DEFAULT_REPLICATION_THRESHOLD,
        }
    }
}

/// Computes safe deletion bounds and asks the store to truncate.
///
/// `set_compactable_index` may be called from any thread; the deletion
/// entry points run on the log's owning thread only and fail fast
/// anywhere else.
pub struct LogCompactor {
    context: Arc<PartitionContext>,
    store: LogStore,
    options: CompactionOptions,
    /// Highest index covered by a complete snapshot; monotonic
    compactable_index: AtomicU64,
    metrics: Arc<CompactionMetrics>,
}

impl LogCompactor {
    pub fn new(
        context: Arc<PartitionContext>,
        store: LogStore,
        options: CompactionOptions,
    ) -> Self {
        Self {
            context,
            store,
            options,
            compactable_index: AtomicU64::new(0),
            metrics: Arc::new(CompactionMetrics::default()),
        }
    }

    /// Records the highest index known to be covered by a complete
    /// snapshot. Lower values than the current one are ignored.
    pub fn set_compactable_index(&self, index: u64) {
        let prev = self.compactable_index.fetch_max(index, Ordering::SeqCst);
        if prev > index {
            debug!(
                current = prev,
                proposed = index,
                "compactable index regression ignored"
            );
        }
    }

    pub fn compactable_index(&self) -> u64 {
        self.compactable_index.load(Ordering::SeqCst)
    }

    /// Deletes entries up to the compactable index minus the replication
    /// threshold. Returns the floor now in effect.
    pub fn compact(&self) -> Result<u64, CompactionError> {
        self.context.check_thread()?;
        let bound = self
            .compactable_index()
            .saturating_sub(self.options.replication_threshold);
        self.run(bound, false)
    }

    /// Deletes entries up to the compactable index itself, ignoring the
    /// replication threshold. Administrative space reclamation.
    pub fn compact_ignoring_replication_threshold(&self) -> Result<u64, CompactionError> {
        self.context.check_thread()?;
        let bound = self.compactable_index();
        self.run(bound, true)
    }

    fn run(&self, bound: u64, forced: bool) -> Result<u64, CompactionError> {
        // Deletion never passes the commit boundary.
        let bound = bound.min(self.store.commit_index());
        if bound == 0 {
            debug!("nothing to compact");
            return Ok(self.store.floor());
        }
        let started = Instant::now();
        let floor = self.store.delete_until(bound)?;
        self.metrics.record_run(forced, started.elapsed());
        info!(
            bound,
            floor,
            forced,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "log compacted"
        );
        Ok(floor)
    }

    pub fn metrics(&self) -> Arc<CompactionMetrics> {
        self.metrics.clone()
    }
}

impl std::fmt::Debug for LogCompactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogCompactor")
            .field("compactable_index", &self.compactable_index())
            .field("replication_threshold", &self.options.replication_threshold)
            .finish()
    }
}

/// Connects snapshot completion to log compaction.
///
/// Registered with the snapshot store; on every new complete snapshot it
/// caps the deletion bound at the lowest live reader position and
/// schedules the compactor onto the owning thread. Listener callbacks
/// must not block, so the compaction itself never runs inline.
pub struct DeletionService {
    context: Arc<PartitionContext>,
    store: LogStore,
    compactor: Arc<LogCompactor>,
}

impl DeletionService {
    pub fn new(
        context: Arc<PartitionContext>,
        store: LogStore,
        compactor: Arc<LogCompactor>,
    ) -> Self {
        Self {
            context,
            store,
            compactor,
        }
    }
}

impl SnapshotListener for DeletionService {
    fn on_new_snapshot(&self, notice: SnapshotNotice) {
        if notice.compaction_bound == 0 {
            self.compactor.metrics().incr_suppressed();
            debug!("snapshot covers nothing, deletion suppressed");
            return;
        }
        // A reader that has not consumed an entry yet still needs it;
        // the bound never passes the slowest live reader.
        let bound = match self.store.lowest_reader_position() {
            Some(position) => notice.compaction_bound.min(position),
            None => notice.compaction_bound,
        };
        if bound == 0 {
            self.compactor.metrics().incr_suppressed();
            debug!(
                snapshot_index = notice.index,
                "reader position unknown, deletion suppressed"
            );
            return;
        }

        let compactor = self.compactor.clone();
        let scheduled = self.context.execute(move || {
            compactor.set_compactable_index(bound);
            if let Err(e) = compactor.compact() {
                warn!("compaction after snapshot failed: {e}");
            }
        });
        if let Err(e) = scheduled {
            warn!(
                snapshot_index = notice.index,
                "could not schedule compaction: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::{EntryType, LogEntry, LogStoreOptions, ReadMode};
    use crate::storage::snapshot::{SnapshotStore, SnapshotStoreOptions};
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn create_test_store(dir: &TempDir) -> LogStore {
        LogStore::open(LogStoreOptions {
            sync_on_write: false,
            ..LogStoreOptions::with_dir(dir.path().join("log"))
        })
        .unwrap()
    }

    fn append_committed(store: &LogStore, count: u64) {
        let entries: Vec<LogEntry> = (1..=count)
            .map(|index| LogEntry {
                index,
                term: 1,
                entry_type: EntryType::Command,
                timestamp_ms: index * 10,
                payload: vec![0u8; 16],
            })
            .collect();
        store.append(&entries).unwrap();
        store.commit(count).unwrap();
    }

    fn compactor_with_threshold(
        context: &Arc<PartitionContext>,
        store: &LogStore,
        replication_threshold: u64,
    ) -> Arc<LogCompactor> {
        Arc::new(LogCompactor::new(
            context.clone(),
            store.clone(),
            CompactionOptions {
                replication_threshold,
            },
        ))
    }

    /// Runs `f` on the owning thread and hands the result back.
    fn on_context<R: Send + 'static>(
        context: &Arc<PartitionContext>,
        f: impl FnOnce() -> R + Send + 'static,
    ) -> R {
        let (tx, rx) = mpsc::channel();
        context
            .execute(move || {
                let _ = tx.send(f());
            })
            .unwrap();
        rx.recv().unwrap()
    }

    /// Waits until every job queued before this call has run.
    fn fence(context: &Arc<PartitionContext>) {
        on_context(context, || {});
    }

    fn retained_indices(store: &LogStore) -> Vec<u64> {
        let mut reader = store.reader(ReadMode::Commits);
        reader.seek_to_first();
        let mut indices = Vec::new();
        while let Some(entry) = reader.next().unwrap() {
            indices.push(entry.index);
        }
        indices
    }

    #[test]
    fn threshold_holds_back_deletion() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 12);

        let compactor = compactor_with_threshold(&context, &store, 5);
        compactor.set_compactable_index(12);

        let c = compactor.clone();
        let floor = on_context(&context, move || c.compact()).unwrap();
        assert_eq!(floor, 7);
        assert_eq!(store.first_index(), 7);

        let c = compactor.clone();
        let floor = on_context(&context, move || {
            c.compact_ignoring_replication_threshold()
        })
        .unwrap();
        assert_eq!(floor, 12);
        assert_eq!(store.first_index(), 12);

        let metrics = compactor.metrics().snapshot();
        assert_eq!(metrics.runs, 2);
        assert_eq!(metrics.forced_runs, 1);
    }

    #[test]
    fn compactable_index_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 10);

        let compactor = compactor_with_threshold(&context, &store, 0);
        compactor.set_compactable_index(10);
        compactor.set_compactable_index(7);
        assert_eq!(compactor.compactable_index(), 10);

        let c = compactor.clone();
        let floor = on_context(&context, move || c.compact()).unwrap();
        assert_eq!(floor, 10);
    }

    #[test]
    fn deletion_never_passes_the_commit_boundary() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);

        let entries: Vec<LogEntry> = (1..=12)
            .map(|index| LogEntry {
                index,
                term: 1,
                entry_type: EntryType::Command,
                timestamp_ms: index * 10,
                payload: vec![0u8; 16],
            })
            .collect();
        store.append(&entries).unwrap();
        store.commit(10).unwrap();

        let compactor = compactor_with_threshold(&context, &store, 0);
        compactor.set_compactable_index(12);

        let c = compactor.clone();
        let floor = on_context(&context, move || {
            c.compact_ignoring_replication_threshold()
        })
        .unwrap();
        assert_eq!(floor, 10);
        assert_eq!(store.first_index(), 10);
    }

    #[test]
    fn wrong_thread_is_rejected_without_deleting() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 5);

        let compactor = compactor_with_threshold(&context, &store, 0);
        compactor.set_compactable_index(5);

        assert!(matches!(
            compactor.compact(),
            Err(CompactionError::WrongThread(_))
        ));
        assert!(matches!(
            compactor.compact_ignoring_replication_threshold(),
            Err(CompactionError::WrongThread(_))
        ));
        assert_eq!(store.first_index(), 1);
        assert_eq!(compactor.metrics().snapshot().runs, 0);
    }

    #[test]
    fn snapshot_completion_drives_deletion() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 3);

        let snapshots = SnapshotStore::open(
            SnapshotStoreOptions {
                sync_on_write: false,
                ..SnapshotStoreOptions::with_dir(dir.path().join("snapshots"))
            },
            Arc::new(Default::default()),
        )
        .unwrap();
        let compactor = compactor_with_threshold(&context, &store, 0);
        let deletion = Arc::new(DeletionService::new(
            context.clone(),
            store.clone(),
            compactor.clone(),
        ));
        snapshots.register_listener(deletion);

        let mut pending = snapshots.begin_snapshot(2, 1).unwrap();
        pending.write(b"state").unwrap();
        pending.complete().unwrap();
        fence(&context);

        assert_eq!(retained_indices(&store), vec![2, 3]);
    }

    #[test]
    fn snapshot_covering_nothing_deletes_nothing() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 3);

        let compactor = compactor_with_threshold(&context, &store, 0);
        let deletion = DeletionService::new(context.clone(), store.clone(), compactor.clone());

        deletion.on_new_snapshot(SnapshotNotice {
            index: 0,
            term: 0,
            compaction_bound: 0,
        });
        fence(&context);

        assert_eq!(retained_indices(&store), vec![1, 2, 3]);
        let metrics = compactor.metrics().snapshot();
        assert_eq!(metrics.suppressed, 1);
        assert_eq!(metrics.runs, 0);
    }

    #[test]
    fn snapshot_past_the_log_keeps_the_last_entry() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 3);

        let compactor = compactor_with_threshold(&context, &store, 0);
        let deletion = DeletionService::new(context.clone(), store.clone(), compactor.clone());

        deletion.on_new_snapshot(SnapshotNotice {
            index: 5,
            term: 1,
            compaction_bound: 5,
        });
        fence(&context);

        assert_eq!(retained_indices(&store), vec![3]);
    }

    #[test]
    fn slow_reader_caps_the_deletion_bound() {
        let dir = TempDir::new().unwrap();
        let context = Arc::new(PartitionContext::spawn("compact-test").unwrap());
        let store = create_test_store(&dir);
        append_committed(&store, 5);

        // The reader has consumed entry 1 only; entry 2 onwards must
        // survive even though the snapshot covers up to 4.
        let mut reader = store.reader(ReadMode::Commits);
        reader.seek_to_first();
        assert_eq!(reader.next().unwrap().unwrap().index, 1);

        let compactor = compactor_with_threshold(&context, &store, 0);
        let deletion = DeletionService::new(context.clone(), store.clone(), compactor.clone());
        deletion.on_new_snapshot(SnapshotNotice {
            index: 4,
            term: 1,
            compaction_bound: 4,
        });
        fence(&context);

        assert_eq!(store.first_index(), 2);
        assert_eq!(reader.next().unwrap().unwrap().index, 2);
    }
}
