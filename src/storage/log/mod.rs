//! Append-only log storage for a partition.
//!
//! Entries live in rotating segment files. Deletion raises a floor
//! instead of rewriting data: a marker record persists the floor, reads
//! clamp to it, and whole segments below it are unlinked.
//!
//! # Module Structure
//!
//! - `entry`: Entry types, record framing and the per-segment index
//! - `segment`: Segment file operations, sealing and replay
//! - `manager`: Multi-segment management with rotation and cleanup
//! - `store`: High-level log store with caching and the single writer
//! - `reader`: Positioned readers over committed or all entries

mod entry;
mod manager;
mod reader;
mod segment;
mod store;


// Re-export public types
pub use entry::{
    DeletionMarker, EntryMeta, EntryType, LogEntry, RECORD_HEADER_SIZE, RECORD_MAGIC_NUM,
    RecordHeader, RecordType, SegmentIndex,
};

pub use manager::{
    DEFAULT_MAX_ENTRIES_PER_SEGMENT, DEFAULT_MAX_SEGMENT_SIZE, DiskStats, MIN_SEGMENT_SIZE,
    SegmentManager, SegmentManagerOptions, SegmentMeta,
};

pub use reader::{LogReader, ReadMode};

pub use segment::Segment;

pub use store::{LogStore, LogStoreOptions, LogWriter};
