//! Segment manager for the partition log.
//!
//! Handles multi-segment concerns:
//! - Automatic rotation when a segment reaches its size or entry limit
//! - Cross-segment reads
//! - Obsolete segment removal once the deletion floor passes them
//! - Disk usage accounting

use std::{
    fs,
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

use anyhow::{Result, anyhow};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::metrics::LogMetrics;

use super::entry::LogEntry;
use super::segment::Segment;

/// Default maximum segment size (64MB)
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Default entry slots per segment
pub const DEFAULT_MAX_ENTRIES_PER_SEGMENT: usize = 16 * 1024;

/// Minimum segment size (64KB)
pub const MIN_SEGMENT_SIZE: u64 = 64 * 1024;

/// Segment file prefix
const SEGMENT_FILE_PREFIX: &str = "segment_";

/// Segment file extension
const SEGMENT_FILE_EXT: &str = ".log";

/// Metadata about a single segment
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    /// Unique segment identifier (monotonically increasing)
    pub segment_id: u64,
    /// File path for this segment
    pub file_path: PathBuf,
    /// First log index in this segment
    pub first_index: u64,
    /// Last log index in this segment
    pub last_index: u64,
    /// Current file size in bytes
    pub file_size: u64,
    /// When the segment was created
    pub created_at: SystemTime,
    /// Whether this segment is sealed (read-only)
    pub sealed: bool,
}

impl SegmentMeta {
    /// Check if this segment holds any entry in `[low, high)`
    pub fn overlaps(&self, low: u64, high: u64) -> bool {
        self.first_index <= self.last_index && low <= self.last_index && high > self.first_index
    }

    /// Check if every entry in this segment sits below the deletion floor
    pub fn is_obsolete(&self, floor: u64) -> bool {
        self.last_index < floor
    }
}

/// Configuration options for the segment manager
#[derive(Clone, Debug)]
pub struct SegmentManagerOptions {
    /// Directory for storing segment files
    pub dir: PathBuf,
    /// Maximum segment size in bytes before rotation
    pub max_segment_size: u64,
    /// Maximum entries per segment before rotation
    pub max_entries_per_segment: usize,
    /// Whether to sync after each write
    pub sync_on_write: bool,
}

impl Default for SegmentManagerOptions {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./data/log"),
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            max_entries_per_segment: DEFAULT_MAX_ENTRIES_PER_SEGMENT,
            sync_on_write: true,
        }
    }
}

/// Manages the partition's log segments with rotation and cleanup.
///
/// Appends come from a single writer; the locks exist so concurrent
/// readers observe a consistent view.
pub struct SegmentManager {
    /// Configuration options
    options: SegmentManagerOptions,
    /// Currently active (writable) segment
    active_segment: RwLock<Segment>,
    /// Metadata for active segment
    active_meta: RwLock<SegmentMeta>,
    /// Read-only sealed segments (ordered by segment_id)
    sealed_segments: RwLock<Vec<(SegmentMeta, Arc<Segment>)>>,
    /// Next segment ID to use
    next_segment_id: RwLock<u64>,
    /// Lowest retained index; entries below it are deleted
    floor: RwLock<u64>,
    /// Total disk usage across all segments
    total_disk_usage: RwLock<u64>,
    metrics: Arc<LogMetrics>,
}

impl SegmentManager {
    pub fn new(options: SegmentManagerOptions, metrics: Arc<LogMetrics>) -> Result<Self> {
        fs::create_dir_all(&options.dir)?;

        let (active_segment, active_meta, sealed_segments, next_id, total_size, floor) =
            Self::load_or_create_segments(&options)?;

        Ok(Self {
            options,
            active_segment: RwLock::new(active_segment),
            active_meta: RwLock::new(active_meta),
            sealed_segments: RwLock::new(sealed_segments),
            next_segment_id: RwLock::new(next_id),
            floor: RwLock::new(floor),
            total_disk_usage: RwLock::new(total_size),
            metrics,
        })
    }

    /// Load existing segments from disk or create the first one.
    #[allow(clippy::type_complexity)]
    fn load_or_create_segments(
        options: &SegmentManagerOptions,
    ) -> Result<(
        Segment,
        SegmentMeta,
        Vec<(SegmentMeta, Arc<Segment>)>,
        u64,
        u64,
        u64,
    )> {
        let mut segment_files: Vec<(u64, PathBuf)> = Vec::new();

        if let Ok(entries) = fs::read_dir(&options.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if name.starts_with(SEGMENT_FILE_PREFIX) && name.ends_with(SEGMENT_FILE_EXT) {
                        let id_str = name
                            .trim_start_matches(SEGMENT_FILE_PREFIX)
                            .trim_end_matches(SEGMENT_FILE_EXT);
                        if let Ok(id) = id_str.parse::<u64>() {
                            segment_files.push((id, path));
                        }
                    }
                }
            }
        }

        segment_files.sort_by_key(|(id, _)| *id);

        if segment_files.is_empty() {
            let (segment, meta) = Self::create_segment(options, 0, 1)?;
            return Ok((segment, meta, Vec::new(), 1, 0, 0));
        }

        let mut sealed_segments = Vec::new();
        let mut floor = 0u64;

        // All but the last file must be sealed; a missing seal tail means
        // the process died mid-rotation, so seal it now.
        for (id, path) in segment_files.iter().take(segment_files.len() - 1) {
            let mut segment = Segment::open(path, options.max_entries_per_segment)
                .map_err(|e| anyhow!("Failed to load segment {:?}: {}", path, e))?;
            if !segment.is_sealed() {
                segment.seal()?;
            }
            floor = floor.max(segment.floor());
            let meta = Self::meta_for(&segment, *id, true)?;
            sealed_segments.push((meta, Arc::new(segment)));
        }

        // The last file is normally the active segment. If it carries a
        // seal tail the restart happened between sealing and creating a
        // fresh segment, so start a new one after it.
        let (last_id, last_path) = &segment_files[segment_files.len() - 1];
        let last_segment = Segment::open(last_path, options.max_entries_per_segment)
            .map_err(|e| anyhow!("Failed to load segment {:?}: {}", last_path, e))?;
        floor = floor.max(last_segment.floor());

        let mut next_id = last_id + 1;
        let (active, active_meta) = if last_segment.is_sealed() {
            let base_index = last_segment.last_index() + 1;
            let meta = Self::meta_for(&last_segment, *last_id, true)?;
            sealed_segments.push((meta, Arc::new(last_segment)));

            let created = Self::create_segment(options, next_id, base_index)?;
            next_id += 1;
            created
        } else {
            let mut last_segment = last_segment;
            if last_segment.is_empty() {
                let base_index = sealed_segments
                    .last()
                    .map(|(meta, _)| meta.last_index + 1)
                    .unwrap_or(1);
                last_segment.rebase(base_index)?;
            }
            let meta = Self::meta_for(&last_segment, *last_id, false)?;
            (last_segment, meta)
        };

        // Entries below the recovered floor may still own whole files when
        // the process died between writing the marker and removing them.
        sealed_segments.retain(|(meta, _)| {
            if meta.is_obsolete(floor) {
                if let Err(e) = fs::remove_file(&meta.file_path) {
                    warn!("Failed to remove obsolete segment {:?}: {}", meta.file_path, e);
                    return true;
                }
                info!("Removed obsolete segment {:?} during recovery", meta.file_path);
                return false;
            }
            true
        });

        let total_size = active_meta.file_size
            + sealed_segments
                .iter()
                .map(|(meta, _)| meta.file_size)
                .sum::<u64>();

        info!(
            "Recovered log: {} sealed segments, active id {}, floor {}, last index {}",
            sealed_segments.len(),
            active_meta.segment_id,
            floor,
            active.last_index()
        );

        Ok((active, active_meta, sealed_segments, next_id, total_size, floor))
    }

    fn create_segment(
        options: &SegmentManagerOptions,
        segment_id: u64,
        base_index: u64,
    ) -> Result<(Segment, SegmentMeta)> {
        let file_name = format!("{}{:010}{}", SEGMENT_FILE_PREFIX, segment_id, SEGMENT_FILE_EXT);
        let file_path = options.dir.join(&file_name);

        let segment = Segment::create(&file_path, base_index, options.max_entries_per_segment)?;

        let meta = SegmentMeta {
            segment_id,
            file_path,
            first_index: base_index,
            last_index: base_index.saturating_sub(1),
            file_size: 0,
            created_at: SystemTime::now(),
            sealed: false,
        };

        info!("Created new segment: id={}, path={:?}", segment_id, meta.file_path);

        Ok((segment, meta))
    }

    fn meta_for(segment: &Segment, segment_id: u64, sealed: bool) -> Result<SegmentMeta> {
        Ok(SegmentMeta {
            segment_id,
            file_path: segment.path.clone(),
            first_index: segment.first_index(),
            last_index: segment.last_index(),
            file_size: segment.size()?,
            created_at: SystemTime::now(),
            sealed,
        })
    }

    /// Check if the active segment needs rotation
    pub fn needs_rotation(&self) -> bool {
        let segment_full = {
            let segment = self.active_segment.read();
            segment.is_full()
        };
        let size = self.active_meta.read().file_size;
        segment_full || size >= self.options.max_segment_size
    }

    /// Rotate to a new segment if needed
    pub fn maybe_rotate(&self) -> Result<bool> {
        if !self.needs_rotation() {
            return Ok(false);
        }
        self.rotate_segment()?;
        Ok(true)
    }

    /// Force rotation to a new segment
    pub fn rotate_segment(&self) -> Result<()> {
        let next_id = {
            let mut next_id = self.next_segment_id.write();
            let id = *next_id;
            *next_id += 1;
            id
        };

        let base_index = {
            let segment = self.active_segment.read();
            segment.last_index() + 1
        };

        let (new_segment, new_meta) = Self::create_segment(&self.options, next_id, base_index)?;

        // Seal the current segment and move it to the sealed list
        let old_segment = {
            let mut active = self.active_segment.write();
            let mut active_meta = self.active_meta.write();

            active.seal()?;

            active_meta.sealed = true;
            active_meta.file_size = active.size()?;
            let old_meta = active_meta.clone();

            let old = std::mem::replace(&mut *active, new_segment);
            *active_meta = new_meta;

            (old_meta, old)
        };

        {
            let mut sealed = self.sealed_segments.write();
            sealed.push((old_segment.0, Arc::new(old_segment.1)));
        }
        self.update_disk_usage();
        self.metrics.incr_segments_rotated();

        info!("Rotated to new segment: id={}", next_id);

        Ok(())
    }

    /// Append entries to the active segment, rotating as needed. A batch
    /// larger than the remaining segment capacity is split across
    /// rotations. Returns the number of bytes written.
    pub fn write_entries(&self, entries: &[LogEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut written = 0u64;
        let mut rest = entries;

        while !rest.is_empty() {
            self.maybe_rotate()?;

            let take = {
                let segment = self.active_segment.read();
                segment.remaining_capacity().min(rest.len())
            };
            let (chunk, tail) = rest.split_at(take);
            rest = tail;

            {
                let mut segment = self.active_segment.write();
                written += segment.append_entries(chunk)?;
                if self.options.sync_on_write {
                    segment.sync_data()?;
                }
            }
        }

        // Refresh active metadata
        {
            let segment = self.active_segment.read();
            let mut meta = self.active_meta.write();
            meta.first_index = segment.first_index();
            meta.last_index = segment.last_index();
            meta.file_size = segment.size()?;
        }
        self.update_disk_usage();

        Ok(written)
    }

    /// Raise the deletion floor to `floor` and remove sealed segments that
    /// fall entirely below it. The floor is persisted as a marker record
    /// before any file is unlinked so a crash in between re-deletes on
    /// restart. Returns the number of segments removed.
    pub fn delete_until(&self, floor: u64) -> Result<usize> {
        {
            let mut segment = self.active_segment.write();
            segment.write_deletion_marker(floor)?;
            if self.options.sync_on_write {
                segment.sync_data()?;
            }
        }

        {
            let mut current = self.floor.write();
            *current = (*current).max(floor);
        }

        let removed = self.cleanup_obsolete_segments()?;
        self.metrics.add_segments_deleted(removed as u64);
        Ok(removed)
    }

    /// Remove sealed segments whose entries all sit below the floor.
    fn cleanup_obsolete_segments(&self) -> Result<usize> {
        let floor = *self.floor.read();

        let mut removed_count = 0;
        let mut freed_space = 0u64;

        {
            let mut sealed = self.sealed_segments.write();
            sealed.retain(|(meta, _)| {
                if !meta.is_obsolete(floor) {
                    return true;
                }
                if let Err(e) = fs::remove_file(&meta.file_path) {
                    warn!("Failed to delete obsolete segment {:?}: {}", meta.file_path, e);
                    return true;
                }
                info!(
                    "Deleted obsolete segment: id={}, freed={}B",
                    meta.segment_id, meta.file_size
                );
                freed_space += meta.file_size;
                removed_count += 1;
                false
            });
        }

        {
            let mut usage = self.total_disk_usage.write();
            *usage = usage.saturating_sub(freed_space);
        }

        Ok(removed_count)
    }

    /// First retained index. Entries below it have been deleted.
    pub fn first_index(&self) -> u64 {
        let lowest = {
            let sealed = self.sealed_segments.read();
            sealed
                .iter()
                .find(|(meta, _)| meta.first_index <= meta.last_index)
                .map(|(meta, _)| meta.first_index)
                .unwrap_or_else(|| self.active_segment.read().first_index())
        };
        lowest.max(*self.floor.read())
    }

    /// Index of the most recently appended entry, 0 when the log is empty.
    pub fn last_index(&self) -> u64 {
        self.active_segment.read().last_index()
    }

    pub fn floor(&self) -> u64 {
        *self.floor.read()
    }

    /// Read one entry. Indices below the floor or past the tail miss.
    pub fn get_entry(&self, log_index: u64) -> Result<LogEntry> {
        if log_index < *self.floor.read() {
            return Err(anyhow!("Log entry {} is below the deletion floor", log_index));
        }

        {
            let active = self.active_segment.read();
            if active.contains(log_index) {
                return active.read_entry(log_index);
            }
        }

        let segment = {
            let sealed = self.sealed_segments.read();
            let pos = sealed.partition_point(|(meta, _)| meta.last_index < log_index);
            sealed.get(pos).map(|(_, segment)| segment.clone())
        };

        if let Some(segment) = segment {
            if segment.contains(log_index) {
                return segment.read_entry(log_index);
            }
        }

        Err(anyhow!("Log entry {} not found", log_index))
    }

    /// Read `[low, high)` across segments, clamped to the retained range.
    pub fn get_entries(&self, low: u64, high: u64) -> Result<Vec<LogEntry>> {
        let low = low.max(self.first_index());
        if low >= high {
            return Ok(Vec::new());
        }

        let mut all_entries = Vec::new();

        let segments_to_read: Vec<Arc<Segment>> = {
            let sealed = self.sealed_segments.read();
            sealed
                .iter()
                .filter(|(meta, _)| meta.overlaps(low, high))
                .map(|(_, segment)| segment.clone())
                .collect()
        };

        for segment in segments_to_read {
            all_entries.extend(segment.read_entries(low, high)?);
        }

        {
            let active = self.active_segment.read();
            all_entries.extend(active.read_entries(low, high)?);
        }

        Ok(all_entries)
    }

    /// Update total disk usage tracking
    fn update_disk_usage(&self) {
        let active_size = self.active_meta.read().file_size;
        let sealed_size: u64 = self
            .sealed_segments
            .read()
            .iter()
            .map(|(meta, _)| meta.file_size)
            .sum();

        let mut usage = self.total_disk_usage.write();
        *usage = active_size + sealed_size;
    }

    /// Get total disk usage across all segments
    pub fn disk_usage(&self) -> u64 {
        *self.total_disk_usage.read()
    }

    /// Get disk usage statistics
    pub fn disk_stats(&self) -> DiskStats {
        let active_meta = self.active_meta.read();
        let sealed = self.sealed_segments.read();

        DiskStats {
            total_usage: *self.total_disk_usage.read(),
            active_segment_size: active_meta.file_size,
            sealed_segment_count: sealed.len(),
            sealed_segments_size: sealed.iter().map(|(m, _)| m.file_size).sum(),
            max_segment_size: self.options.max_segment_size,
        }
    }

    /// Sync the active segment to disk
    pub fn sync_all(&self) -> Result<()> {
        self.active_segment.read().sync_data()
    }

    /// Get segment count (active + sealed)
    pub fn segment_count(&self) -> usize {
        1 + self.sealed_segments.read().len()
    }
}

/// Disk usage statistics
#[derive(Debug, Clone)]
pub struct DiskStats {
    /// Total disk usage in bytes
    pub total_usage: u64,
    /// Active segment size in bytes
    pub active_segment_size: u64,
    /// Number of sealed segments
    pub sealed_segment_count: usize,
    /// Total size of sealed segments
    pub sealed_segments_size: u64,
    /// Maximum segment size before rotation
    pub max_segment_size: u64,
}

impl DiskStats {
    /// Format as human-readable string
    pub fn to_human_readable(&self) -> String {
        format!(
            "total: {}, active: {}, sealed: {} segments ({}), max_segment: {}",
            Self::format_bytes(self.total_usage),
            Self::format_bytes(self.active_segment_size),
            self.sealed_segment_count,
            Self::format_bytes(self.sealed_segments_size),
            Self::format_bytes(self.max_segment_size),
        )
    }

    fn format_bytes(bytes: u64) -> String {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        if bytes >= GB {
            format!("{:.2}GB", bytes as f64 / GB as f64)
        } else if bytes >= MB {
            format!("{:.2}MB", bytes as f64 / MB as f64)
        } else if bytes >= KB {
            format!("{:.2}KB", bytes as f64 / KB as f64)
        } else {
            format!("{}B", bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::log::entry::EntryType;
    use tempfile::TempDir;

    fn test_options(dir: &TempDir) -> SegmentManagerOptions {
        SegmentManagerOptions {
            dir: dir.path().to_path_buf(),
            max_segment_size: 1024, // Small size to exercise rotation
            max_entries_per_segment: 64,
            sync_on_write: false,
        }
    }

    fn create_test_manager() -> (SegmentManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let manager =
            SegmentManager::new(test_options(&temp_dir), Arc::new(LogMetrics::default())).unwrap();
        (manager, temp_dir)
    }

    fn create_test_entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            entry_type: EntryType::Command,
            timestamp_ms: 1_700_000_000_000 + index,
            payload: vec![0u8; 100], // 100 bytes per entry
        }
    }

    #[test]
    fn test_segment_creation() {
        let (manager, _temp_dir) = create_test_manager();
        assert_eq!(manager.segment_count(), 1);
        assert_eq!(manager.disk_usage(), 0);
        assert_eq!(manager.first_index(), 1);
        assert_eq!(manager.last_index(), 0);
    }

    #[test]
    fn test_write_and_rotation() {
        let (manager, _temp_dir) = create_test_manager();

        for i in 1..=20 {
            manager.write_entries(&[create_test_entry(i, 1)]).unwrap();
        }

        assert!(manager.segment_count() > 1);
        assert_eq!(manager.last_index(), 20);
    }

    #[test]
    fn test_read_across_segments() {
        let (manager, _temp_dir) = create_test_manager();

        for i in 1..=30 {
            manager.write_entries(&[create_test_entry(i, 1)]).unwrap();
        }

        let entries = manager.get_entries(1, 31).unwrap();
        assert_eq!(entries.len(), 30);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.index, (i + 1) as u64);
        }

        let entry = manager.get_entry(17).unwrap();
        assert_eq!(entry.index, 17);
    }

    #[test]
    fn test_batch_split_across_rotation() {
        let (manager, _temp_dir) = create_test_manager();

        // One batch bigger than a whole segment's entry capacity
        let entries: Vec<LogEntry> = (1..=100).map(|i| create_test_entry(i, 1)).collect();
        manager.write_entries(&entries).unwrap();

        assert_eq!(manager.last_index(), 100);
        let read = manager.get_entries(1, 101).unwrap();
        assert_eq!(read.len(), 100);
    }

    #[test]
    fn test_delete_until_removes_obsolete_segments() {
        let (manager, _temp_dir) = create_test_manager();

        for i in 1..=30 {
            manager.write_entries(&[create_test_entry(i, 1)]).unwrap();
        }

        let initial_count = manager.segment_count();
        assert!(initial_count > 1);

        manager.delete_until(25).unwrap();

        assert!(manager.segment_count() < initial_count);
        assert_eq!(manager.first_index(), 25);
        assert_eq!(manager.floor(), 25);

        // Reads clamp to the floor
        let entries = manager.get_entries(1, 31).unwrap();
        assert_eq!(entries.first().unwrap().index, 25);
        assert_eq!(entries.last().unwrap().index, 30);

        assert!(manager.get_entry(10).is_err());
    }

    #[test]
    fn test_recovery_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let mut options = test_options(&temp_dir);
        options.sync_on_write = true;

        {
            let manager =
                SegmentManager::new(options.clone(), Arc::new(LogMetrics::default())).unwrap();
            for i in 1..=30 {
                manager.write_entries(&[create_test_entry(i, 2)]).unwrap();
            }
        }

        let manager = SegmentManager::new(options, Arc::new(LogMetrics::default())).unwrap();
        assert_eq!(manager.last_index(), 30);
        assert_eq!(manager.first_index(), 1);

        let entries = manager.get_entries(1, 31).unwrap();
        assert_eq!(entries.len(), 30);
        assert_eq!(entries[14].index, 15);
        assert_eq!(entries[14].term, 2);
    }

    #[test]
    fn test_recovery_preserves_floor() {
        let temp_dir = TempDir::new().unwrap();
        let mut options = test_options(&temp_dir);
        options.sync_on_write = true;

        {
            let manager =
                SegmentManager::new(options.clone(), Arc::new(LogMetrics::default())).unwrap();
            for i in 1..=30 {
                manager.write_entries(&[create_test_entry(i, 1)]).unwrap();
            }
            manager.delete_until(12).unwrap();
        }

        let manager = SegmentManager::new(options, Arc::new(LogMetrics::default())).unwrap();
        assert_eq!(manager.floor(), 12);
        assert_eq!(manager.first_index(), 12);
        assert_eq!(manager.last_index(), 30);

        let entries = manager.get_entries(1, 31).unwrap();
        assert_eq!(entries.first().unwrap().index, 12);
    }

    #[test]
    fn test_disk_stats() {
        let (manager, _temp_dir) = create_test_manager();

        for i in 1..=10 {
            manager.write_entries(&[create_test_entry(i, 1)]).unwrap();
        }

        let stats = manager.disk_stats();
        assert!(stats.total_usage > 0);
        assert!(!stats.to_human_readable().is_empty());
    }
}
