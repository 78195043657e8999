use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use bincode::{Decode, Encode};
use tracing::{debug, warn};

use super::entry::{
    DeletionMarker, EntryMeta, LogEntry, RECORD_HEADER_SIZE, RecordHeader, RecordType,
    SegmentIndex,
};

// Segment file format:
// | RecordHeader [ entry | deletion marker ] ... | index | tail | tail size,crc (u32,u32) | version (u32) |
//
// The index and tail are only present once the segment is sealed. An
// active segment is recovered by replaying its records from the front.

const SEGMENT_VERSION_V1: u32 = 1;

/// Trailing metadata of a sealed segment, locating the serialized index.
#[derive(Debug, Default, Decode, Encode)]
struct SegmentTail {
    index_offset: u64,
    index_size: u64,
    index_crc: u32,
}

/// Serialized form of the in-memory index, written at seal time so a
/// sealed segment opens without replaying every record.
#[derive(Debug, Default, Decode, Encode)]
struct SealedIndex {
    first_index: u64,
    floor: u64,
    metas: Vec<EntryMeta>,
}

pub struct Segment {
    pub(crate) path: PathBuf,
    pub(crate) file: Arc<File>,
    pub(crate) index: SegmentIndex,
    /// Highest deletion floor recorded in this segment, 0 if none.
    floor: u64,
    /// End of the record region. Appends land here; sealing writes the
    /// index here.
    write_offset: u64,
    sealed: bool,
}

impl Segment {
    /// Creates an empty segment whose first entry must carry `base_index`.
    pub fn create(path: &Path, base_index: u64, entry_capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Arc::new(file),
            index: SegmentIndex::new(base_index, entry_capacity),
            floor: 0,
            write_offset: 0,
            sealed: false,
        })
    }

    /// Opens an existing segment file. A valid seal tail restores the
    /// index directly; anything else replays the records from the front
    /// and truncates a corrupt tail.
    pub fn open(path: &Path, entry_capacity: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file = Arc::new(file);
        let file_size = file.metadata()?.len();

        if let Some(segment) = Self::open_sealed(path, &file, file_size, entry_capacity)? {
            return Ok(segment);
        }

        Self::replay(path, &file, file_size, entry_capacity)
    }

    /// Tries to restore the segment from its seal tail. Returns `None`
    /// when the tail is absent or damaged, directing the caller to replay.
    fn open_sealed(
        path: &Path,
        file: &Arc<File>,
        file_size: u64,
        entry_capacity: usize,
    ) -> Result<Option<Self>> {
        // tail size (u32) + tail crc (u32) + version (u32)
        const FOOTER_SIZE: u64 = 12;

        if file_size < FOOTER_SIZE {
            return Ok(None);
        }

        let mut footer = [0u8; FOOTER_SIZE as usize];
        file.read_exact_at(&mut footer, file_size - FOOTER_SIZE)?;

        let tail_size = u32::from_le_bytes(footer[0..4].try_into()?) as u64;
        let tail_crc = u32::from_le_bytes(footer[4..8].try_into()?);
        let version = u32::from_le_bytes(footer[8..12].try_into()?);

        if version != SEGMENT_VERSION_V1 || tail_size > file_size - FOOTER_SIZE {
            return Ok(None);
        }

        let mut tail_buff = vec![0u8; tail_size as usize];
        file.read_exact_at(&mut tail_buff, file_size - FOOTER_SIZE - tail_size)?;
        if crc32fast::hash(&tail_buff) != tail_crc {
            return Ok(None);
        }

        let (tail, _): (SegmentTail, usize) =
            bincode::decode_from_slice(&tail_buff, bincode::config::standard()).map_err(|e| {
                warn!("Failed to decode segment tail of {:?}: {}", path, e);
                e
            })?;

        if tail.index_offset + tail.index_size > file_size {
            return Ok(None);
        }

        let mut index_buff = vec![0u8; tail.index_size as usize];
        file.read_exact_at(&mut index_buff, tail.index_offset)?;
        if crc32fast::hash(&index_buff) != tail.index_crc {
            warn!("Sealed index crc mismatch in {:?}, falling back to replay", path);
            return Ok(None);
        }

        let (sealed_index, _): (SealedIndex, usize) =
            bincode::decode_from_slice(&index_buff, bincode::config::standard()).map_err(|e| {
                warn!("Failed to decode sealed index of {:?}: {}", path, e);
                e
            })?;

        let capacity = entry_capacity.max(sealed_index.metas.len());
        let mut index = SegmentIndex::new(sealed_index.first_index, capacity);
        for meta in sealed_index.metas {
            index.push(meta);
        }

        Ok(Some(Self {
            path: path.to_path_buf(),
            file: file.clone(),
            index,
            floor: sealed_index.floor,
            write_offset: tail.index_offset,
            sealed: true,
        }))
    }

    /// Rebuilds the index by scanning the record region from the front.
    /// Scanning stops at the first record that fails its length, magic or
    /// crc check; everything past that point is truncated away so the
    /// next append lands on a clean tail.
    fn replay(path: &Path, file: &Arc<File>, file_size: u64, entry_capacity: usize) -> Result<Self> {
        let mut metas: Vec<EntryMeta> = Vec::new();
        let mut floor = 0u64;
        let mut offset = 0u64;
        let mut header_buf = [0u8; RECORD_HEADER_SIZE as usize];

        while offset + RECORD_HEADER_SIZE as u64 <= file_size {
            file.read_exact_at(&mut header_buf, offset)?;

            let header = match RecordHeader::deserialize(&header_buf) {
                Ok(h) => h,
                Err(e) => {
                    warn!("Invalid record header at offset {} in {:?}: {}", offset, path, e);
                    break;
                }
            };

            let data_size = header.size as u64 - RECORD_HEADER_SIZE as u64;
            let data_offset = offset + RECORD_HEADER_SIZE as u64;
            if data_offset + data_size > file_size {
                warn!("Incomplete record at offset {} in {:?}", offset, path);
                break;
            }

            let mut data_buf = vec![0u8; data_size as usize];
            file.read_exact_at(&mut data_buf, data_offset)?;

            let actual_crc = crc32fast::hash(&data_buf);
            if actual_crc != header.crc {
                warn!(
                    "Record crc mismatch at offset {} in {:?}: expected {:#010x}, got {:#010x}",
                    offset, path, header.crc, actual_crc
                );
                break;
            }

            match header.record_type {
                RecordType::Entry => {
                    let entry = match LogEntry::deserialize(&data_buf) {
                        Ok((entry, _)) => entry,
                        Err(e) => {
                            warn!("Corrupt entry at offset {} in {:?}: {}", offset, path, e);
                            break;
                        }
                    };
                    if let Some(last) = metas.last() {
                        if entry.index != last.log_index + 1 {
                            warn!(
                                "Non-contiguous entry at offset {} in {:?}: {} after {}",
                                offset, path, entry.index, last.log_index
                            );
                            break;
                        }
                    }
                    metas.push(EntryMeta {
                        log_index: entry.index,
                        term: entry.term,
                        offset: data_offset,
                        size: data_size,
                    });
                }
                RecordType::DeletionMarker => match DeletionMarker::deserialize(&data_buf) {
                    Ok((marker, _)) => floor = floor.max(marker.floor),
                    Err(e) => {
                        warn!("Corrupt deletion marker at offset {} in {:?}: {}", offset, path, e);
                        break;
                    }
                },
                // A seal tail record means the record region ended here
                // even though the footer did not validate.
                RecordType::SealTail => break,
            }

            offset += header.size as u64;
        }

        if offset < file_size {
            warn!(
                "Truncating {:?} from {} to {} bytes after replay",
                path, file_size, offset
            );
            file.set_len(offset)?;
        }

        let first_index = metas.first().map(|m| m.log_index).unwrap_or(1);
        let capacity = entry_capacity.max(metas.len());
        let mut index = SegmentIndex::new(first_index, capacity);
        for meta in metas {
            index.push(meta);
        }

        debug!(
            "Replayed segment {:?}: {} entries, floor {}, {} bytes",
            path,
            index.entry_count(),
            floor,
            offset
        );

        Ok(Self {
            path: path.to_path_buf(),
            file: file.clone(),
            index,
            floor,
            write_offset: offset,
            sealed: false,
        })
    }

    pub fn first_index(&self) -> u64 {
        self.index.first_index()
    }

    /// Re-anchors an entry-less segment at `base_index`. Replaying an
    /// empty file cannot recover the base, so recovery derives it from
    /// the preceding segment and applies it here.
    pub fn rebase(&mut self, base_index: u64) -> Result<()> {
        if !self.index.is_empty() {
            return Err(anyhow!("Cannot rebase non-empty segment {:?}", self.path));
        }
        self.index = SegmentIndex::new(base_index, self.index.capacity());
        Ok(())
    }

    pub fn last_index(&self) -> u64 {
        self.index.last_index()
    }

    pub fn entry_count(&self) -> usize {
        self.index.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.index.is_full()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.index.remaining_capacity()
    }

    pub fn contains(&self, log_index: u64) -> bool {
        self.index.contains(log_index)
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Bytes occupied on disk, including seal data once sealed.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data().map_err(|e| {
            warn!("Failed to sync segment file data: {}", e);
            e.into()
        })
    }

    /// Appends entries as framed records. The caller has already verified
    /// index continuity and that the arena has room. Returns the number of
    /// bytes written.
    pub fn append_entries(&mut self, entries: &[LogEntry]) -> Result<u64> {
        if entries.is_empty() {
            return Ok(0);
        }
        if self.sealed {
            return Err(anyhow!("Cannot append to sealed segment {:?}", self.path));
        }
        if entries.len() > self.index.remaining_capacity() {
            return Err(anyhow!(
                "Segment {:?} has room for {} entries, got {}",
                self.path,
                self.index.remaining_capacity(),
                entries.len()
            ));
        }

        let buffs = entries
            .iter()
            .map(|e| e.serialize())
            .collect::<Result<Vec<Vec<u8>>>>()?;

        let mut offset = self.write_offset;
        let mut buff = Vec::new();
        for (entry, data) in entries.iter().zip(buffs.iter()) {
            let header = RecordHeader::new(
                data.len() as u32 + RECORD_HEADER_SIZE,
                RecordType::Entry,
                crc32fast::hash(data),
            );
            buff.extend_from_slice(&header.serialize());
            buff.extend_from_slice(data);

            self.index.push(EntryMeta {
                log_index: entry.index,
                term: entry.term,
                offset: offset + RECORD_HEADER_SIZE as u64,
                size: data.len() as u64,
            });
            offset += RECORD_HEADER_SIZE as u64 + data.len() as u64;
        }

        self.file.write_all_at(&buff, self.write_offset).map_err(|e| {
            warn!("Failed to write entries to segment {:?}: {}", self.path, e);
            e
        })?;
        self.write_offset = offset;

        Ok(buff.len() as u64)
    }

    /// Persists a deletion floor so the retained range survives restart.
    pub fn write_deletion_marker(&mut self, floor: u64) -> Result<()> {
        if self.sealed {
            return Err(anyhow!("Cannot append to sealed segment {:?}", self.path));
        }

        let data = DeletionMarker { floor }.serialize()?;
        let header = RecordHeader::new(
            data.len() as u32 + RECORD_HEADER_SIZE,
            RecordType::DeletionMarker,
            crc32fast::hash(&data),
        );

        let mut buff = Vec::with_capacity(RECORD_HEADER_SIZE as usize + data.len());
        buff.extend_from_slice(&header.serialize());
        buff.extend_from_slice(&data);

        self.file.write_all_at(&buff, self.write_offset)?;
        self.write_offset += buff.len() as u64;
        self.floor = self.floor.max(floor);

        Ok(())
    }

    /// Seals the segment: serializes the index after the record region,
    /// then the tail, the tail size and crc, and the format version.
    /// A sealed segment rejects further appends.
    pub fn seal(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }

        let sealed_index = SealedIndex {
            first_index: self.index.first_index(),
            floor: self.floor,
            metas: self.index.iter().cloned().collect(),
        };

        let index_buff = bincode::encode_to_vec(&sealed_index, bincode::config::standard())
            .map_err(|e| {
                warn!("Failed to encode index for {:?}: {}", self.path, e);
                e
            })?;

        let tail = SegmentTail {
            index_offset: self.write_offset,
            index_size: index_buff.len() as u64,
            index_crc: crc32fast::hash(&index_buff),
        };

        let tail_buff =
            bincode::encode_to_vec(&tail, bincode::config::standard()).map_err(|e| {
                warn!("Failed to encode tail for {:?}: {}", self.path, e);
                e
            })?;

        let mut buff = index_buff;
        let tail_size = tail_buff.len() as u32;
        let tail_crc = crc32fast::hash(&tail_buff);
        buff.extend_from_slice(&tail_buff);
        buff.extend_from_slice(&tail_size.to_le_bytes());
        buff.extend_from_slice(&tail_crc.to_le_bytes());
        buff.extend_from_slice(&SEGMENT_VERSION_V1.to_le_bytes());

        self.file.write_all_at(&buff, self.write_offset).map_err(|e| {
            warn!("Failed to write seal data to {:?}: {}", self.path, e);
            e
        })?;

        self.sealed = true;
        self.sync_data()
    }

    pub fn read_entry(&self, log_index: u64) -> Result<LogEntry> {
        let meta = self
            .index
            .get(log_index)
            .ok_or_else(|| {
                anyhow!(
                    "Entry {} not in segment {:?} (range {} - {})",
                    log_index,
                    self.path,
                    self.index.first_index(),
                    self.index.last_index()
                )
            })?
            .clone();

        let mut buf = vec![0u8; meta.size as usize];
        self.file.read_exact_at(&mut buf, meta.offset).map_err(|e| {
            warn!("Failed to read entry {} from {:?}: {}", log_index, self.path, e);
            e
        })?;

        let (entry, _) = LogEntry::deserialize(&buf)?;
        Ok(entry)
    }

    /// Reads `[low, high)` clamped to this segment. Records are laid out
    /// sequentially so the span is fetched with one read and sliced per
    /// entry, skipping the interleaved headers.
    pub fn read_entries(&self, low: u64, high: u64) -> Result<Vec<LogEntry>> {
        let metas = self.index.range(low, high);
        let Some((first, last)) = metas.first().zip(metas.last()) else {
            return Ok(Vec::new());
        };

        let base = first.offset;
        let span = (last.offset + last.size - base) as usize;
        let mut buf = vec![0u8; span];
        self.file.read_exact_at(&mut buf, base).map_err(|e| {
            warn!("Failed to read entries from {:?}: {}", self.path, e);
            e
        })?;

        let mut entries = Vec::with_capacity(metas.len());
        for meta in &metas {
            let begin = (meta.offset - base) as usize;
            let end = begin + meta.size as usize;
            let (entry, _) = LogEntry::deserialize(&buf[begin..end])?;
            entries.push(entry);
        }

        Ok(entries)
    }
}
