//! Pluggable primitive services and the state machine driving them.
//!
//! A primitive service is a synchronous state machine owned by the
//! partition's single execution context. It registers the operation ids
//! it handles, executes commands and read-only queries against opaque
//! inputs, and serializes its whole state for snapshots. The manager in
//! [`manager`] applies committed log entries to the registered services
//! in strict index order.

mod manager;
pub mod session;

use bincode::{Decode, Encode};
use std::collections::HashMap;

pub use manager::{ServiceManager, ServiceManagerOptions, SnapshotPolicy};
pub use session::{Session, SessionRecord, SessionRegistry, SessionState};

use crate::error::ServiceError;
use crate::types::{OperationId, SessionId};

/// Whether an operation mutates service state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Command,
    Query,
}

/// Operation ids a service declared during `configure`. The manager
/// refuses to dispatch an entry whose id is unregistered or whose kind
/// does not match the entry type.
#[derive(Debug, Default)]
pub struct OperationRegistry {
    ops: HashMap<OperationId, OperationKind>,
}

impl OperationRegistry {
    pub fn register(&mut self, id: OperationId, kind: OperationKind) {
        self.ops.insert(id, kind);
    }

    pub fn kind(&self, id: OperationId) -> Option<OperationKind> {
        self.ops.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// One replicated state machine primitive. Implementations run only on
/// the partition's owning thread, so methods are synchronous and take
/// plain references.
///
/// `backup` must write a byte representation `restore` accepts; the
/// runtime treats it as an opaque blob and never inspects it.
pub trait PrimitiveService: Send {
    /// Declares the operation ids this service handles.
    fn configure(&mut self, registry: &mut OperationRegistry);

    /// Applies one mutating command, returning its response payload.
    fn execute(&mut self, operation: OperationId, input: &[u8]) -> Result<Vec<u8>, ServiceError>;

    /// Answers one read-only query. Must not mutate state.
    fn query(&self, operation: OperationId, input: &[u8]) -> Result<Vec<u8>, ServiceError>;

    /// Serializes the whole service state into `output`.
    fn backup(&self, output: &mut Vec<u8>) -> Result<(), ServiceError>;

    /// Replaces the whole service state with a previously backed-up blob.
    fn restore(&mut self, input: &[u8]) -> Result<(), ServiceError>;
}

/// Result of applying one entry, routed back to the submitting caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Entry types with no caller-visible result.
    None,
    SessionOpened(SessionId),
    /// Command or query response payload.
    Output(Vec<u8>),
    Metadata(Vec<SessionInfo>),
}

/// Caller-facing view of one session, returned by `Metadata` entries.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub owner_client_name: String,
    pub primitive_name: String,
}

impl From<&Session> for SessionInfo {
    fn from(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            owner_client_name: session.owner_client_name().to_string(),
            primitive_name: session.primitive_name().to_string(),
        }
    }
}

/// Payload of an `OpenSession` entry. The created session's id is the
/// entry's own log index.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct OpenSessionPayload {
    pub owner_client_name: String,
    pub primitive_name: String,
    /// 0 falls back to the manager's default session timeout.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct CloseSessionPayload {
    pub session_id: SessionId,
}

/// One session's keep-alive inside a batched `KeepAlive` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct SessionAck {
    pub session_id: SessionId,
    /// Highest log index the client has acknowledged.
    pub acknowledged_index: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct KeepAlivePayload {
    pub acks: Vec<SessionAck>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct CommandPayload {
    pub session_id: SessionId,
    pub operation: OperationId,
    pub input: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct QueryPayload {
    pub session_id: SessionId,
    pub operation: OperationId,
    pub input: Vec<u8>,
}

/// Payload of a `Metadata` entry. `session_id` 0 lists every session;
/// a non-zero id scopes the listing to sessions sharing that session's
/// primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct MetadataPayload {
    pub session_id: SessionId,
}

pub fn encode_payload<T: Encode>(value: &T) -> Result<Vec<u8>, ServiceError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ServiceError::Encode(e.to_string()))
}

pub fn decode_payload<T: Decode<()>>(data: &[u8]) -> Result<T, ServiceError> {
    let (value, _) = bincode::decode_from_slice(data, bincode::config::standard())
        .map_err(|e| ServiceError::Decode(e.to_string()))?;
    Ok(value)
}
