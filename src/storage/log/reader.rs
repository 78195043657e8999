use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use crate::error::StorageError;

use super::{entry::LogEntry, store::LogStore};

/// How far a reader is allowed to see into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Only entries at or below the commit watermark
    Commits,
    /// Every appended entry, committed or not
    All,
}

/// Position slot shared with the store, so deletion can take the lowest
/// position across live readers into account.
#[derive(Debug)]
pub(crate) struct ReaderShared {
    position: AtomicU64,
}

impl ReaderShared {
    pub(crate) fn new(position: u64) -> Self {
        Self {
            position: AtomicU64::new(position),
        }
    }

    pub(crate) fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    fn set_position(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }
}

/// Cursor over the log. The position is the index `next` returns; it
/// only moves forward through `next`, or anywhere via `seek`. A reader
/// overrun by deletion resumes at the first retained entry.
pub struct LogReader {
    store: LogStore,
    mode: ReadMode,
    shared: Arc<ReaderShared>,
}

impl LogReader {
    pub(crate) fn new(store: LogStore, mode: ReadMode, shared: Arc<ReaderShared>) -> Self {
        Self {
            store,
            mode,
            shared,
        }
    }

    pub fn mode(&self) -> ReadMode {
        self.mode
    }

    /// The index the next `next` call will return
    pub fn position(&self) -> u64 {
        self.shared.position()
    }

    /// Highest index visible to this reader
    fn limit(&self) -> u64 {
        match self.mode {
            ReadMode::Commits => self.store.commit_index(),
            ReadMode::All => self.store.last_index(),
        }
    }

    /// Moves to `index`, clamped into the retained range. Seeking past
    /// the visible tail parks the reader one past it. Returns the
    /// position actually taken.
    pub fn seek(&mut self, index: u64) -> u64 {
        let clamped = index
            .max(self.store.first_index())
            .min(self.limit() + 1);
        self.shared.set_position(clamped);
        clamped
    }

    /// Moves to the oldest retained entry
    pub fn seek_to_first(&mut self) -> u64 {
        let first = self.store.first_index();
        self.shared.set_position(first);
        first
    }

    /// Parks one past the visible tail, where appends will show up next
    pub fn seek_to_end(&mut self) -> u64 {
        let end = self.limit() + 1;
        self.shared.set_position(end);
        end
    }

    pub fn has_next(&self) -> bool {
        let position = self.shared.position().max(self.store.first_index());
        position <= self.limit() && position >= 1
    }

    /// Returns the entry at the current position and advances, or `None`
    /// once the visible tail is reached.
    pub fn next(&mut self) -> Result<Option<LogEntry>, StorageError> {
        // Deletion may have passed us; resume at the first retained entry.
        let first = self.store.first_index();
        if self.shared.position() < first {
            self.shared.set_position(first);
        }

        let position = self.shared.position();
        if position > self.limit() || position < 1 {
            return Ok(None);
        }

        let entry = self.store.read_entry(position)?;
        self.shared.set_position(position + 1);
        Ok(Some(entry))
    }
}
