//! Fixed-capacity slot arena addressed by integer handles.
//!
//! Backs the in-memory entry index of a segment: one slot per entry,
//! allocated once at segment creation so the hot append path never
//! reallocates. All access is bounds-checked; a handle from one arena is
//! meaningless in another.

/// Opaque index of a slot inside a [`SlotArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotHandle(u32);

impl SlotHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Append-only arena with a fixed number of slots.
#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<T>,
    capacity: usize,
}

impl<T> SlotArena<T> {
    /// Allocates all slot storage up front. `capacity` is capped at
    /// `u32::MAX` so every slot is addressable by a handle.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize);
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Stores `value` in the next free slot. Returns `None` when the
    /// arena is full; the caller is expected to roll over to a new arena.
    pub fn push(&mut self, value: T) -> Option<SlotHandle> {
        if self.slots.len() >= self.capacity {
            return None;
        }
        let handle = SlotHandle(self.slots.len() as u32);
        self.slots.push(value);
        Some(handle)
    }

    pub fn get(&self, handle: SlotHandle) -> Option<&T> {
        self.slots.get(handle.index())
    }

    pub fn get_mut(&mut self, handle: SlotHandle) -> Option<&mut T> {
        self.slots.get_mut(handle.index())
    }

    /// Slot at ordinal `n` in insertion order.
    pub fn at(&self, n: usize) -> Option<&T> {
        self.slots.get(n)
    }

    pub fn last(&self) -> Option<&T> {
        self.slots.last()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every slot past `len`, keeping allocation. Used when replay
    /// finds a corrupt tail record.
    pub fn truncate(&mut self, len: usize) {
        self.slots.truncate(len);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter()
    }
}
