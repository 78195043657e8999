use anyhow::Result;
use bincode::{Decode, Encode};
use tracing::warn;

use crate::arena::SlotArena;

/// What a committed entry means to the service manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Decode, Encode)]
pub enum EntryType {
    Configuration,
    Initialize,
    Command,
    Query,
    OpenSession,
    CloseSession,
    KeepAlive,
    Metadata,
}

/// One unit of replicated data at a specific log index. Immutable once
/// written; the payload is opaque to the log layer.
#[derive(Debug, Clone, PartialEq, Decode, Encode)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    /// Milliseconds since the Unix epoch, stamped by the writer. Session
    /// expiry is driven by these, never by wall clock at apply time.
    pub timestamp_ms: u64,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        let config = bincode::config::standard();
        Ok(bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize log entry: {}", e);
            e
        })?)
    }
}

/// Marks every entry below `floor` as deleted. Appended to the active
/// segment by `delete_until` so the retained floor survives restart.
#[derive(Debug, Clone, Decode, Encode)]
pub struct DeletionMarker {
    pub floor: u64,
}

impl DeletionMarker {
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let config = bincode::config::standard();
        Ok(bincode::encode_to_vec(self, config)?)
    }

    pub fn deserialize(data: &[u8]) -> Result<(Self, usize)> {
        let config = bincode::config::standard();
        Ok(bincode::decode_from_slice(data, config).map_err(|e| {
            warn!("Failed to deserialize deletion marker: {}", e);
            e
        })?)
    }
}

/// Location of one entry's serialized bytes inside a segment file.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash, Decode, Encode)]
pub struct EntryMeta {
    pub log_index: u64,
    pub term: u64,
    pub offset: u64,
    pub size: u64,
}

/// In-memory index of one segment, arena-backed: slot `i` holds the meta
/// of `log_index = first_index + i`. Slots are allocated once per segment
/// so appends never reallocate.
#[derive(Debug)]
pub struct SegmentIndex {
    first_index: u64,
    last_index: u64,
    slots: SlotArena<EntryMeta>,
}

impl SegmentIndex {
    /// `base_index` is the index the first appended entry must carry.
    pub fn new(base_index: u64, capacity: usize) -> Self {
        Self {
            first_index: base_index,
            last_index: base_index.saturating_sub(1),
            slots: SlotArena::with_capacity(capacity),
        }
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    pub fn last_index(&self) -> u64 {
        self.last_index
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn entry_count(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.slots.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.slots.capacity() - self.slots.len()
    }

    pub fn contains(&self, log_index: u64) -> bool {
        !self.is_empty() && log_index >= self.first_index && log_index <= self.last_index
    }

    /// Records the next entry. The caller guarantees `meta.log_index ==
    /// last_index + 1`; a full arena means the segment must rotate first.
    pub fn push(&mut self, meta: EntryMeta) -> bool {
        let log_index = meta.log_index;
        if self.slots.push(meta).is_none() {
            return false;
        }
        self.last_index = log_index;
        true
    }

    pub fn get(&self, log_index: u64) -> Option<&EntryMeta> {
        if !self.contains(log_index) {
            return None;
        }
        self.slots.at((log_index - self.first_index) as usize)
    }

    /// Metas for `[low, high)` clamped to the segment's range, in index
    /// order. Contiguous in the file because appends are sequential.
    pub fn range(&self, low: u64, high: u64) -> Vec<EntryMeta> {
        if self.is_empty() {
            return Vec::new();
        }
        let low = low.max(self.first_index);
        let high = high.min(self.last_index + 1);
        if low >= high {
            return Vec::new();
        }
        let begin = (low - self.first_index) as usize;
        let end = (high - self.first_index) as usize;
        (begin..end)
            .filter_map(|i| self.slots.at(i).cloned())
            .collect()
    }

    /// Drops metas recorded past `count`; used when replay hits a corrupt
    /// tail record.
    pub fn truncate(&mut self, count: usize) {
        self.slots.truncate(count);
        self.last_index = if self.slots.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.slots.len() as u64 - 1
        };
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryMeta> {
        self.slots.iter()
    }
}

/// Record kinds inside a segment file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Entry,
    DeletionMarker,
    SealTail,
}

pub const RECORD_MAGIC_NUM: u32 = 0x_5247_4c4f;
pub const RECORD_HEADER_SIZE: u32 = 16;

/// Fixed 16-byte frame preceding every record:
/// `| size u32 | type u32 | magic u32 | crc u32 |`, little endian.
/// `size` covers header plus body; `crc` covers the body only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub size: u32,
    pub record_type: RecordType,
    pub magic_num: u32,
    pub crc: u32,
}

impl RecordHeader {
    pub fn new(size: u32, record_type: RecordType, crc: u32) -> Self {
        Self {
            size,
            record_type,
            magic_num: RECORD_MAGIC_NUM,
            crc,
        }
    }

    pub fn serialize(&self) -> [u8; RECORD_HEADER_SIZE as usize] {
        let mut buf = [0u8; RECORD_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        let type_code: u32 = match self.record_type {
            RecordType::Entry => 1,
            RecordType::DeletionMarker => 2,
            RecordType::SealTail => 3,
        };
        buf[4..8].copy_from_slice(&type_code.to_le_bytes());
        buf[8..12].copy_from_slice(&self.magic_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.crc.to_le_bytes());
        buf
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        use anyhow::anyhow;

        if data.len() < RECORD_HEADER_SIZE as usize {
            return Err(anyhow!("Invalid record header length {}", data.len()));
        }

        let size = u32::from_le_bytes(data[0..4].try_into()?);
        let type_code = u32::from_le_bytes(data[4..8].try_into()?);
        let record_type = match type_code {
            1 => RecordType::Entry,
            2 => RecordType::DeletionMarker,
            3 => RecordType::SealTail,
            _ => return Err(anyhow!("Invalid record type {}", type_code)),
        };
        let magic_num = u32::from_le_bytes(data[8..12].try_into()?);
        let crc = u32::from_le_bytes(data[12..16].try_into()?);

        if magic_num != RECORD_MAGIC_NUM {
            return Err(anyhow!("Invalid record magic number {:#010x}", magic_num));
        }
        if size < RECORD_HEADER_SIZE {
            return Err(anyhow!("Record size {} smaller than header", size));
        }

        Ok(Self {
            size,
            record_type,
            magic_num,
            crc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta(log_index: u64, offset: u64) -> EntryMeta {
        EntryMeta {
            log_index,
            term: 1,
            offset,
            size: 32,
        }
    }

    #[test]
    fn record_header_round_trip() {
        let header = RecordHeader::new(48, RecordType::Entry, 0xdead_beef);
        let buf = header.serialize();
        let decoded = RecordHeader::deserialize(&buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn record_header_rejects_bad_magic() {
        let header = RecordHeader::new(48, RecordType::Entry, 1);
        let mut buf = header.serialize();
        buf[9] ^= 0xff;
        assert!(RecordHeader::deserialize(&buf).is_err());
    }

    #[test]
    fn segment_index_tracks_range() {
        let mut index = SegmentIndex::new(10, 8);
        assert!(index.is_empty());
        assert!(!index.contains(10));

        for i in 10..14 {
            assert!(index.push(test_meta(i, (i - 10) * 48)));
        }
        assert_eq!(index.first_index(), 10);
        assert_eq!(index.last_index(), 13);
        assert!(index.contains(12));
        assert!(!index.contains(14));
        assert_eq!(index.get(11).unwrap().offset, 48);
    }

    #[test]
    fn segment_index_range_clamps() {
        let mut index = SegmentIndex::new(5, 8);
        for i in 5..9 {
            index.push(test_meta(i, 0));
        }
        assert_eq!(index.range(0, 100).len(), 4);
        assert_eq!(index.range(6, 8).len(), 2);
        assert_eq!(index.range(9, 12).len(), 0);
    }

    #[test]
    fn segment_index_rejects_push_past_capacity() {
        let mut index = SegmentIndex::new(1, 2);
        assert!(index.push(test_meta(1, 0)));
        assert!(index.push(test_meta(2, 48)));
        assert!(index.is_full());
        assert!(!index.push(test_meta(3, 96)));
        assert_eq!(index.last_index(), 2);
    }

    #[test]
    fn log_entry_round_trip() {
        let entry = LogEntry {
            index: 7,
            term: 2,
            entry_type: EntryType::Command,
            timestamp_ms: 1_700_000_000_000,
            payload: b"payload".to_vec(),
        };
        let buf = entry.serialize().unwrap();
        let (decoded, consumed) = LogEntry::deserialize(&buf).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(consumed, buf.len());
    }
}
