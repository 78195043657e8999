use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::types::PartitionId;

/// Top-level error type for a partition runtime.
#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Execution context error: {0}")]
    Context(#[from] ContextError),

    #[error("Compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("Append rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Partition halted after a fatal error")]
    Halted,
}

/// Segment store and log errors.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(Arc<anyhow::Error>),

    #[error("Index mismatch: expected {expected}, got {found}")]
    IndexMismatch { expected: u64, found: u64 },

    #[error("Commit index {index} is beyond the appended tail {last_index}")]
    CommitBeyondAppend { index: u64, last_index: u64 },

    #[error("Corrupted data at index {0}")]
    DataCorruption(u64),

    #[error("Index {index} out of range [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("Insufficient disk space: {available} bytes available, {required} required")]
    InsufficientDiskSpace { required: u64, available: u64 },

    #[error("Log store is closed")]
    Closed,
}

/// Admission-control rejection reasons. Callers are expected to back off
/// and retry; a rejection never indicates a partition fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Concurrency limit exhausted: {in_flight} appends in flight, limit {limit}")]
    ConcurrencyLimitExhausted { in_flight: usize, limit: usize },

    #[error("Write rate limit exhausted")]
    WriteRateLimitExhausted,
}

/// Snapshot store and transfer errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Out-of-order chunk: expected ordinal {expected}, received {received}")]
    OutOfOrderChunk { expected: u32, received: u32 },

    #[error("Snapshot {0} not found")]
    NotFound(String),

    #[error("Invalid snapshot metadata: {0}")]
    InvalidMetadata(String),

    #[error("Snapshot data corrupted: {0}")]
    DataCorrupted(Arc<anyhow::Error>),

    #[error("Snapshot already completed")]
    AlreadyCompleted,
}

/// Errors from applying entries to primitive services.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("Unknown session {0}")]
    UnknownSession(u64),

    #[error("Session {0} expired")]
    SessionExpired(u64),

    #[error("Service {0} is not registered")]
    UnknownService(String),

    #[error("Service {service} does not handle operation {operation}")]
    UnknownOperation { service: String, operation: u32 },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Service state corrupted: {0}")]
    StateCorrupted(String),

    #[error("Failed to decode entry payload: {0}")]
    Decode(String),

    #[error("Failed to encode entry payload: {0}")]
    Encode(String),
}

/// Owning-execution-context errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Called from the wrong thread: {context} operations must run on the owning thread")]
    WrongThread { context: String },

    #[error("Execution context {0} is shut down")]
    Closed(String),
}

/// Compactor errors.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("{0}")]
    WrongThread(#[from] ContextError),

    #[error("Storage error during compaction: {0}")]
    Storage(#[from] StorageError),
}

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("max_segment_size must be at least {min} bytes, got {got}")]
    SegmentSizeTooSmall { min: u64, got: u64 },

    #[error("min_concurrency_limit {min} exceeds max_concurrency_limit {max}")]
    InvalidConcurrencyBounds { min: usize, max: usize },

    #[error("chunk_size must be non-zero")]
    ZeroChunkSize,

    #[error("max_snapshot_count must be at least 1")]
    ZeroSnapshotCount,

    #[error("session_timeout must be non-zero")]
    ZeroSessionTimeout,

    #[error("service {0} is already registered")]
    DuplicateService(String),
}

/// How a failed operation affects the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Stops further log mutation; the partition must be restarted from
    /// the last good snapshot.
    Fatal,
    /// The caller may retry or degrade.
    Recoverable,
    /// Log and move on.
    Ignorable,
}

pub trait ErrorHandler: std::fmt::Display {
    fn severity(&self) -> ErrorSeverity;

    fn context(&self) -> String {
        self.to_string()
    }
}

impl ErrorHandler for StorageError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            StorageError::Io(_) => ErrorSeverity::Fatal,
            StorageError::IndexMismatch { .. } => ErrorSeverity::Fatal,
            StorageError::CommitBeyondAppend { .. } => ErrorSeverity::Fatal,
            StorageError::DataCorruption(_) => ErrorSeverity::Fatal,
            StorageError::OutOfRange { .. } => ErrorSeverity::Recoverable,
            StorageError::InsufficientDiskSpace { .. } => ErrorSeverity::Fatal,
            StorageError::Closed => ErrorSeverity::Fatal,
        }
    }
}

impl ErrorHandler for Rejection {
    fn severity(&self) -> ErrorSeverity {
        // Backpressure is the normal saturation response, never a fault.
        ErrorSeverity::Recoverable
    }
}

impl ErrorHandler for SnapshotError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            SnapshotError::Io(_) => ErrorSeverity::Recoverable,
            SnapshotError::ChecksumMismatch { .. } => ErrorSeverity::Recoverable,
            SnapshotError::OutOfOrderChunk { .. } => ErrorSeverity::Recoverable,
            SnapshotError::NotFound(_) => ErrorSeverity::Recoverable,
            SnapshotError::InvalidMetadata(_) => ErrorSeverity::Ignorable,
            SnapshotError::DataCorrupted(_) => ErrorSeverity::Fatal,
            SnapshotError::AlreadyCompleted => ErrorSeverity::Ignorable,
        }
    }
}

impl ErrorHandler for ServiceError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            ServiceError::UnknownSession(_) => ErrorSeverity::Ignorable,
            ServiceError::SessionExpired(_) => ErrorSeverity::Ignorable,
            ServiceError::UnknownService(_) => ErrorSeverity::Recoverable,
            ServiceError::UnknownOperation { .. } => ErrorSeverity::Recoverable,
            ServiceError::CommandFailed(_) => ErrorSeverity::Recoverable,
            ServiceError::StateCorrupted(_) => ErrorSeverity::Fatal,
            ServiceError::Decode(_) => ErrorSeverity::Recoverable,
            ServiceError::Encode(_) => ErrorSeverity::Recoverable,
        }
    }
}

impl ErrorHandler for ContextError {
    fn severity(&self) -> ErrorSeverity {
        // Wrong-thread invocation is a programming error, not a condition
        // to retry.
        ErrorSeverity::Fatal
    }
}

impl ErrorHandler for CompactionError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            CompactionError::WrongThread(e) => e.severity(),
            CompactionError::Storage(e) => e.severity(),
        }
    }
}

impl ErrorHandler for PartitionError {
    fn severity(&self) -> ErrorSeverity {
        match self {
            PartitionError::Storage(e) => e.severity(),
            PartitionError::Snapshot(e) => e.severity(),
            PartitionError::Service(e) => e.severity(),
            PartitionError::Context(e) => e.severity(),
            PartitionError::Compaction(e) => e.severity(),
            PartitionError::Rejected(e) => e.severity(),
            PartitionError::Config(_) => ErrorSeverity::Recoverable,
            PartitionError::Halted => ErrorSeverity::Fatal,
        }
    }
}

/// Routes component failures by severity and tracks whether the partition
/// has been halted by a fatal error.
///
/// Shared across the writer, the service manager, and admission control;
/// once `halt` fires, all further log mutation is refused until the
/// partition is restarted from a snapshot.
#[derive(Debug, Clone)]
pub struct PartitionFaultHandler {
    partition_id: PartitionId,
    halted: Arc<AtomicBool>,
}

impl PartitionFaultHandler {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handles a fallible result, returning the value on success. Fatal
    /// errors halt the partition.
    pub fn handle<T, E: ErrorHandler>(&self, result: Result<T, E>, operation: &str) -> Option<T> {
        match result {
            Ok(val) => Some(val),
            Err(e) => {
                match e.severity() {
                    ErrorSeverity::Fatal => {
                        error!(
                            partition = %self.partition_id,
                            operation,
                            "fatal: {}",
                            e.context()
                        );
                        self.halt();
                    }
                    ErrorSeverity::Recoverable => {
                        warn!(
                            partition = %self.partition_id,
                            operation,
                            "recoverable: {}",
                            e.context()
                        );
                    }
                    ErrorSeverity::Ignorable => {
                        debug!(
                            partition = %self.partition_id,
                            operation,
                            "ignored: {}",
                            e.context()
                        );
                    }
                }
                None
            }
        }
    }

    pub fn handle_void<E: ErrorHandler>(&self, result: Result<(), E>, operation: &str) -> bool {
        self.handle(result, operation).is_some()
    }

    /// Marks the partition unhealthy. Idempotent.
    pub fn halt(&self) {
        if !self.halted.swap(true, Ordering::SeqCst) {
            error!(
                partition = %self.partition_id,
                "partition halted, restart from the last good snapshot required"
            );
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }
}
