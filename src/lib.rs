//! Embedded runtime for one partition of a replicated log.
//!
//! A [`Partition`] owns a segmented durable log, a versioned snapshot
//! store, admission control and a set of registered primitive services.
//! Every log mutation runs on the partition's owning thread; producers
//! on any thread submit entries and await the apply outcome.
//!
//! Layer by layer:
//!
//! - [`storage::log`]: append-only segment files, floor-based deletion
//! - [`storage::snapshot`]: atomic snapshot publication, chunked transfer
//! - [`admission`]: adaptive concurrency limit plus write rate limiting
//! - [`service`]: sessions and primitive services over applied entries
//! - [`compaction`]: snapshot-driven log space reclamation
//! - [`partition`]: the facade wiring the layers together

pub mod admission;
pub mod arena;
pub mod compaction;
pub mod context;
pub mod error;
pub mod metrics;
pub mod partition;
pub mod service;
pub mod storage;
pub mod types;

pub use admission::WriteOrigin;
pub use error::{ErrorSeverity, PartitionError};
pub use partition::{Partition, PartitionOptions};
pub use service::{ApplyOutcome, PrimitiveService};
pub use storage::log::EntryType;
pub use types::{OperationId, PartitionId, SessionId};
