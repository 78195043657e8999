//! Chunked snapshot transfer.
//!
//! A `ChunkReader` slices a complete snapshot's data into fixed-size,
//! crc-stamped chunks in a stable order, so a restarted transfer replays
//! identically. A `SnapshotInstaller` consumes chunks strictly in order
//! on the receiving side and publishes the snapshot only once the final
//! chunk and the whole-archive checksum check out.

use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use bincode::{Decode, Encode};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::SnapshotError;
use crate::storage::snapshot::store::{SnapshotMeta, SnapshotStore, write_sidecars};

/// One transfer unit of a snapshot's data.
#[derive(Debug, Clone, PartialEq, Eq, Decode, Encode)]
pub struct SnapshotChunk {
    /// Id of the snapshot this chunk belongs to
    pub snapshot_id: u64,
    /// Zero-based position within the transfer
    pub ordinal: u32,
    /// Total chunks in the transfer
    pub total_chunks: u32,
    /// crc32 of `data`
    pub crc: u32,
    pub data: Vec<u8>,
}

/// Ordered reader over a snapshot's data. Position is derived from the
/// ordinal, so concurrent readers over the same file do not interfere.
pub struct ChunkReader {
    meta: SnapshotMeta,
    file: File,
    chunk_size: usize,
    total_chunks: u32,
    next_ordinal: u32,
}

impl ChunkReader {
    pub(crate) fn new(meta: SnapshotMeta, file: File, chunk_size: usize) -> Self {
        let total_chunks = super::store::total_chunks(meta.data_size, chunk_size);
        Self {
            meta,
            file,
            chunk_size,
            total_chunks,
            next_ordinal: 0,
        }
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn has_next(&self) -> bool {
        self.next_ordinal < self.total_chunks
    }

    /// Next chunk, or `None` once the transfer is exhausted.
    pub fn next_chunk(&mut self) -> Result<Option<SnapshotChunk>, SnapshotError> {
        if !self.has_next() {
            return Ok(None);
        }

        let offset = self.next_ordinal as u64 * self.chunk_size as u64;
        let remaining = self.meta.data_size - offset;
        let len = remaining.min(self.chunk_size as u64) as usize;

        let mut data = vec![0u8; len];
        self.file.read_exact_at(&mut data, offset)?;

        let chunk = SnapshotChunk {
            snapshot_id: self.meta.id,
            ordinal: self.next_ordinal,
            total_chunks: self.total_chunks,
            crc: crc32fast::hash(&data),
            data,
        };
        self.next_ordinal += 1;
        Ok(Some(chunk))
    }

    /// Drains the remaining chunks. Mostly a test and bootstrap helper;
    /// real transfers pull chunk-by-chunk.
    pub fn read_all(&mut self) -> Result<Vec<SnapshotChunk>, SnapshotError> {
        let mut chunks = Vec::with_capacity((self.total_chunks - self.next_ordinal) as usize);
        while let Some(chunk) = self.next_chunk()? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }
}

/// Receiving side of a chunked transfer. Chunks must arrive in ordinal
/// order; any integrity failure leaves the store's prior state untouched.
pub struct SnapshotInstaller {
    store: SnapshotStore,
    meta: SnapshotMeta,
    dir: PathBuf,
    data_file: File,
    hasher: Sha256,
    total_chunks: u32,
    next_ordinal: u32,
    written: u64,
    started_at: std::time::Instant,
    finished: bool,
}

impl SnapshotInstaller {
    pub(crate) fn new(
        store: SnapshotStore,
        meta: SnapshotMeta,
        dir: PathBuf,
        data_file: File,
        total_chunks: u32,
    ) -> Self {
        Self {
            store,
            meta,
            dir,
            data_file,
            hasher: Sha256::new(),
            total_chunks,
            next_ordinal: 0,
            written: 0,
            started_at: std::time::Instant::now(),
            finished: false,
        }
    }

    /// Verifies and appends one chunk.
    pub fn apply_chunk(&mut self, chunk: SnapshotChunk) -> Result<(), SnapshotError> {
        if chunk.ordinal != self.next_ordinal {
            return Err(SnapshotError::OutOfOrderChunk {
                expected: self.next_ordinal,
                received: chunk.ordinal,
            });
        }

        let actual = crc32fast::hash(&chunk.data);
        if actual != chunk.crc {
            return Err(SnapshotError::ChecksumMismatch {
                expected: format!("{:08x}", chunk.crc),
                actual: format!("{:08x}", actual),
            });
        }

        self.data_file.write_all(&chunk.data)?;
        self.hasher.update(&chunk.data);
        self.written += chunk.data.len() as u64;
        self.next_ordinal += 1;
        Ok(())
    }

    /// Completes the install. The snapshot becomes visible (and
    /// listeners fire) only after every chunk arrived and the archive
    /// checksum matches the sender's metadata.
    pub fn finish(mut self) -> Result<SnapshotMeta, SnapshotError> {
        if self.next_ordinal != self.total_chunks {
            return Err(SnapshotError::OutOfOrderChunk {
                expected: self.next_ordinal,
                received: self.total_chunks,
            });
        }
        if self.written != self.meta.data_size {
            return Err(SnapshotError::InvalidMetadata(format!(
                "received {} bytes, metadata says {}",
                self.written, self.meta.data_size
            )));
        }

        let actual = format!("{:x}", self.hasher.clone().finalize());
        if actual != self.meta.checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: self.meta.checksum.clone(),
                actual,
            });
        }

        if self.store.options().sync_on_write {
            self.data_file.sync_all()?;
        }
        write_sidecars(&self.dir, &self.meta, self.store.options().sync_on_write)?;

        let meta = self.store.publish(&self.dir, self.meta.clone())?;
        self.finished = true;
        self.store.metrics().record_install(self.started_at.elapsed());
        debug!(
            "Installed snapshot index={}, id={:016x} from {} chunk(s)",
            meta.index, meta.id, self.total_chunks
        );
        Ok(meta)
    }
}

impl Drop for SnapshotInstaller {
    fn drop(&mut self) {
        if !self.finished {
            self.store.metrics().incr_failed_installs();
            if let Err(e) = fs::remove_dir_all(&self.dir) {
                warn!("Failed to remove partial install {:?}: {}", self.dir, e);
            }
        }
    }
}
