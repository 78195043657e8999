//! Sequential application of committed entries to primitive services.
//!
//! One manager per partition, driven on the owning thread. The apply
//! loop never runs two entries concurrently; command failures are
//! isolated per entry and reported through the caller's result channel,
//! while corrupted service state halts the partition.
//!
//! The manager also drives the snapshot cycle: after each applied batch
//! it completes a capture that was waiting on session acknowledgments,
//! or starts a new one when the size/interval policy is met.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bincode::{Decode, Encode};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::context::PartitionContext;
use crate::error::{ConfigError, PartitionError, PartitionFaultHandler, ServiceError};
use crate::metrics::ServiceMetrics;
use crate::service::session::SessionRegistry;
use crate::service::{
    ApplyOutcome, CloseSessionPayload, CommandPayload, KeepAlivePayload, MetadataPayload,
    OpenSessionPayload, OperationKind, OperationRegistry, PrimitiveService, QueryPayload,
    SessionInfo, decode_payload,
};
use crate::storage::log::{EntryType, LogEntry, LogReader, LogStore, ReadMode};
use crate::storage::snapshot::{PendingSnapshot, SnapshotMeta, SnapshotStore};
use crate::types::SessionId;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_SNAPSHOT_ENTRY_INTERVAL: u64 = 10_000;
pub const DEFAULT_SNAPSHOT_BYTE_INTERVAL: u64 = 64 * 1024 * 1024;

/// When the manager captures a snapshot on its own. A threshold of 0
/// disables that trigger; forced captures ignore the policy entirely.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Capture after this many applied entries
    pub entry_interval: u64,
    /// Capture after this many applied payload bytes
    pub byte_interval: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            entry_interval: DEFAULT_SNAPSHOT_ENTRY_INTERVAL,
            byte_interval: DEFAULT_SNAPSHOT_BYTE_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceManagerOptions {
    /// Applied to sessions whose open request carries no timeout
    pub default_session_timeout: Duration,
    pub policy: SnapshotPolicy,
}

impl Default for ServiceManagerOptions {
    fn default() -> Self {
        Self {
            default_session_timeout: DEFAULT_SESSION_TIMEOUT,
            policy: SnapshotPolicy::default(),
        }
    }
}

impl ServiceManagerOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_session_timeout.is_zero() {
            return Err(ConfigError::ZeroSessionTimeout);
        }
        Ok(())
    }
}

/// On-disk form of the whole service-manager state inside a snapshot.
#[derive(Debug, Encode, Decode)]
struct ServiceArchive {
    last_applied: u64,
    last_applied_term: u64,
    sessions: Vec<crate::service::session::SessionRecord>,
    services: Vec<ServiceSection>,
}

#[derive(Debug, Encode, Decode)]
struct ServiceSection {
    name: String,
    state: Vec<u8>,
}

struct RegisteredService {
    name: String,
    ops: OperationRegistry,
    service: Box<dyn PrimitiveService>,
}

pub struct ServiceManager {
    context: Arc<PartitionContext>,
    store: LogStore,
    reader: LogReader,
    snapshots: SnapshotStore,
    /// Registration order; also the section order inside archives
    services: Vec<RegisteredService>,
    sessions: SessionRegistry,
    results: HashMap<u64, oneshot::Sender<Result<ApplyOutcome, ServiceError>>>,
    options: ServiceManagerOptions,
    fault: Arc<PartitionFaultHandler>,
    metrics: Arc<ServiceMetrics>,
    last_applied: u64,
    last_applied_term: u64,
    /// Latest complete snapshot index; entries at or below it are skipped
    snapshot_floor: u64,
    /// Capture waiting on session acknowledgments before completion
    gated: Option<PendingSnapshot>,
    applied_since_snapshot: u64,
    bytes_since_snapshot: u64,
}

impl ServiceManager {
    pub fn new(
        context: Arc<PartitionContext>,
        store: LogStore,
        snapshots: SnapshotStore,
        options: ServiceManagerOptions,
        fault: Arc<PartitionFaultHandler>,
    ) -> Result<Self, PartitionError> {
        options.validate()?;
        let reader = store.reader(ReadMode::Commits);
        Ok(Self {
            context,
            store,
            reader,
            snapshots,
            services: Vec::new(),
            sessions: SessionRegistry::new(),
            results: HashMap::new(),
            options,
            fault,
            metrics: Arc::new(ServiceMetrics::default()),
            last_applied: 0,
            last_applied_term: 0,
            snapshot_floor: 0,
            gated: None,
            applied_since_snapshot: 0,
            bytes_since_snapshot: 0,
        })
    }

    /// Registers a primitive under `name` and lets it declare its
    /// operations. Registration happens at bootstrap, before any entry
    /// is applied; the set of services is fixed afterwards.
    pub fn register_service(
        &mut self,
        name: impl Into<String>,
        mut service: Box<dyn PrimitiveService>,
    ) -> Result<(), ConfigError> {
        let name = name.into();
        if self.services.iter().any(|s| s.name == name) {
            return Err(ConfigError::DuplicateService(name));
        }
        let mut ops = OperationRegistry::default();
        service.configure(&mut ops);
        debug!(service = %name, operations = ops.len(), "service registered");
        self.services.push(RegisteredService { name, ops, service });
        Ok(())
    }

    /// Restores state from the latest complete snapshot, then applies
    /// every committed entry past it. Called once at partition start.
    pub fn recover(&mut self) -> Result<(), PartitionError> {
        self.context.check_thread()?;
        if let Some((meta, data)) = self.snapshots.load_latest()? {
            self.install_archive(&meta, &data)?;
        }
        let commit = self.store.commit_index();
        if commit > self.last_applied {
            self.apply(commit)?;
        }
        Ok(())
    }

    /// Applies every committed entry up to `committed_index` in strict
    /// index order, then drives the snapshot cycle.
    pub fn apply(&mut self, committed_index: u64) -> Result<(), PartitionError> {
        self.context.check_thread()?;
        if self.fault.is_halted() {
            return Err(PartitionError::Halted);
        }

        while self.last_applied < committed_index {
            let Some(entry) = self.reader.next()? else {
                break;
            };
            self.apply_entry(entry)?;
        }

        if self.gated.is_some() {
            let result = self.try_complete_gated();
            self.fault.handle(result, "complete_snapshot");
        } else if self.policy_met() {
            let result = self.take_snapshot();
            self.fault.handle(result, "policy_snapshot");
        }
        Ok(())
    }

    fn apply_entry(&mut self, entry: LogEntry) -> Result<(), PartitionError> {
        if entry.index <= self.snapshot_floor {
            self.metrics.incr_skipped();
            debug!(
                index = entry.index,
                floor = self.snapshot_floor,
                "entry already covered by snapshot, skipped"
            );
            return Ok(());
        }
        if entry.index != self.last_applied + 1 {
            let err = ServiceError::StateCorrupted(format!(
                "apply gap: expected index {}, got {}",
                self.last_applied + 1,
                entry.index
            ));
            error!("{err}");
            self.fault.halt();
            return Err(err.into());
        }

        let started = Instant::now();
        match self.dispatch(&entry) {
            Err(ServiceError::StateCorrupted(reason)) => {
                error!(index = entry.index, "service state corrupted: {reason}");
                self.respond(
                    entry.index,
                    Err(ServiceError::StateCorrupted(reason.clone())),
                );
                self.fault.halt();
                Err(ServiceError::StateCorrupted(reason).into())
            }
            outcome => {
                if let Err(err) = &outcome {
                    match err {
                        ServiceError::Decode(_) => {
                            warn!(index = entry.index, "entry rejected: {err}")
                        }
                        _ => debug!(index = entry.index, "entry failed: {err}"),
                    }
                    self.metrics.incr_commands_failed();
                }
                self.last_applied = entry.index;
                self.last_applied_term = entry.term;
                self.applied_since_snapshot += 1;
                self.bytes_since_snapshot += entry.payload.len() as u64;
                self.metrics.record_apply(started.elapsed());
                self.respond(entry.index, outcome);
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        match entry.entry_type {
            // A leadership change or membership change counts as liveness
            // for every session, so a quiet control plane cannot expire
            // them behind the cluster's back.
            EntryType::Initialize | EntryType::Configuration => {
                self.sessions.refresh_all(entry.timestamp_ms);
                Ok(ApplyOutcome::None)
            }
            EntryType::OpenSession => self.apply_open_session(entry),
            EntryType::CloseSession => self.apply_close_session(entry),
            EntryType::KeepAlive => self.apply_keep_alive(entry),
            EntryType::Metadata => self.apply_metadata(entry),
            EntryType::Command => self.apply_command(entry),
            EntryType::Query => self.apply_query(entry),
        }
    }

    fn apply_open_session(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        let payload: OpenSessionPayload = decode_payload(&entry.payload)?;
        if !self.services.iter().any(|s| s.name == payload.primitive_name) {
            return Err(ServiceError::UnknownService(payload.primitive_name));
        }
        let timeout = if payload.timeout_ms == 0 {
            self.options.default_session_timeout
        } else {
            Duration::from_millis(payload.timeout_ms)
        };
        let id: SessionId = entry.index;
        self.sessions.open(
            id,
            payload.owner_client_name,
            payload.primitive_name,
            timeout,
            entry.timestamp_ms,
        );
        self.metrics.incr_sessions_opened();
        Ok(ApplyOutcome::SessionOpened(id))
    }

    fn apply_close_session(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        let payload: CloseSessionPayload = decode_payload(&entry.payload)?;
        if !self.sessions.close(payload.session_id) {
            debug!(
                session = payload.session_id,
                "close for unknown session ignored"
            );
        }
        Ok(ApplyOutcome::None)
    }

    fn apply_keep_alive(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        let payload: KeepAlivePayload = decode_payload(&entry.payload)?;
        for ack in &payload.acks {
            if !self
                .sessions
                .keep_alive(ack.session_id, ack.acknowledged_index, entry.timestamp_ms)
            {
                debug!(
                    session = ack.session_id,
                    "keep-alive for unknown session ignored"
                );
            }
        }
        let removed = self.sessions.expire(entry.timestamp_ms);
        self.metrics.add_sessions_expired(removed.len() as u64);
        Ok(ApplyOutcome::None)
    }

    fn apply_metadata(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        let payload: MetadataPayload = decode_payload(&entry.payload)?;
        let sessions: Vec<SessionInfo> = if payload.session_id == 0 {
            self.sessions.iter().map(SessionInfo::from).collect()
        } else {
            let Some(target) = self.sessions.get(payload.session_id) else {
                return Err(ServiceError::UnknownSession(payload.session_id));
            };
            let primitive = target.primitive_name().to_string();
            self.sessions
                .sessions_for_primitive(&primitive)
                .map(SessionInfo::from)
                .collect()
        };
        Ok(ApplyOutcome::Metadata(sessions))
    }

    fn apply_command(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        let payload: CommandPayload = decode_payload(&entry.payload)?;
        let (primitive, open) = match self.sessions.get(payload.session_id) {
            Some(session) => (session.primitive_name().to_string(), session.is_open()),
            None => {
                return Err(ServiceError::UnknownSession(payload.session_id));
            }
        };
        if !open {
            return Err(ServiceError::SessionExpired(payload.session_id));
        }
        let Some(registered) = self.services.iter_mut().find(|s| s.name == primitive) else {
            return Err(ServiceError::UnknownService(primitive));
        };
        if registered.ops.kind(payload.operation) != Some(OperationKind::Command) {
            return Err(ServiceError::UnknownOperation {
                service: primitive,
                operation: payload.operation,
            });
        }
        let output = registered.service.execute(payload.operation, &payload.input)?;
        Ok(ApplyOutcome::Output(output))
    }

    // Queries flow through the log like commands but dispatch to the
    // read-only handler; a bad session fails the query, nothing else.
    fn apply_query(&mut self, entry: &LogEntry) -> Result<ApplyOutcome, ServiceError> {
        let payload: QueryPayload = decode_payload(&entry.payload)?;
        let (primitive, open) = match self.sessions.get(payload.session_id) {
            Some(session) => (session.primitive_name().to_string(), session.is_open()),
            None => {
                return Err(ServiceError::UnknownSession(payload.session_id));
            }
        };
        if !open {
            return Err(ServiceError::SessionExpired(payload.session_id));
        }
        let Some(registered) = self.services.iter().find(|s| s.name == primitive) else {
            return Err(ServiceError::UnknownService(primitive));
        };
        if registered.ops.kind(payload.operation) != Some(OperationKind::Query) {
            return Err(ServiceError::UnknownOperation {
                service: primitive,
                operation: payload.operation,
            });
        }
        let output = registered.service.query(payload.operation, &payload.input)?;
        Ok(ApplyOutcome::Output(output))
    }

    /// Registers interest in the result of the entry at `index`. Must be
    /// called before that entry is applied.
    pub fn register_result(
        &mut self,
        index: u64,
    ) -> Result<oneshot::Receiver<Result<ApplyOutcome, ServiceError>>, PartitionError> {
        self.context.check_thread()?;
        let (tx, rx) = oneshot::channel();
        if index <= self.last_applied {
            let _ = tx.send(Err(ServiceError::CommandFailed(format!(
                "entry {index} was already applied"
            ))));
            return Ok(rx);
        }
        self.results.insert(index, tx);
        Ok(rx)
    }

    fn respond(&mut self, index: u64, outcome: Result<ApplyOutcome, ServiceError>) {
        if let Some(tx) = self.results.remove(&index) {
            if tx.send(outcome).is_err() {
                debug!(index, "result receiver dropped");
            }
        }
    }

    fn policy_met(&self) -> bool {
        let policy = &self.options.policy;
        (policy.entry_interval > 0 && self.applied_since_snapshot >= policy.entry_interval)
            || (policy.byte_interval > 0 && self.bytes_since_snapshot >= policy.byte_interval)
    }

    /// Captures every service's state plus the session registry as of
    /// `last_applied`. Completion is gated on every open session having
    /// acknowledged that index; a gated capture is retried after each
    /// applied batch and completes as soon as the acknowledgments catch
    /// up. Returns the published metadata, or `None` when nothing new
    /// exists or completion is still gated.
    ///
    /// Also the administrative forced-snapshot entry point.
    pub fn take_snapshot(&mut self) -> Result<Option<SnapshotMeta>, PartitionError> {
        self.context.check_thread()?;
        if self.gated.is_some() {
            return self.try_complete_gated();
        }
        if self.last_applied == 0 || self.last_applied <= self.snapshot_floor {
            debug!(
                last_applied = self.last_applied,
                floor = self.snapshot_floor,
                "nothing new to snapshot"
            );
            return Ok(None);
        }

        let archive = self.build_archive()?;
        let mut pending = self
            .snapshots
            .begin_snapshot(self.last_applied, self.last_applied_term)?;
        pending.write(&archive)?;
        self.applied_since_snapshot = 0;
        self.bytes_since_snapshot = 0;
        self.gated = Some(pending);
        self.try_complete_gated()
    }

    fn try_complete_gated(&mut self) -> Result<Option<SnapshotMeta>, PartitionError> {
        let Some(pending) = self.gated.take() else {
            return Ok(None);
        };
        let index = pending.index();
        if let Some(min) = self.sessions.min_acknowledged() {
            if min < index {
                debug!(
                    index,
                    min_acknowledged = min,
                    "snapshot completion deferred until sessions acknowledge"
                );
                self.gated = Some(pending);
                return Ok(None);
            }
        }
        let meta = pending.complete()?;
        self.snapshot_floor = meta.index;
        info!(index = meta.index, term = meta.term, "service snapshot completed");
        Ok(Some(meta))
    }

    fn build_archive(&self) -> Result<Vec<u8>, PartitionError> {
        let mut sections = Vec::with_capacity(self.services.len());
        for registered in &self.services {
            let mut state = Vec::new();
            registered.service.backup(&mut state)?;
            sections.push(ServiceSection {
                name: registered.name.clone(),
                state,
            });
        }
        let archive = ServiceArchive {
            last_applied: self.last_applied,
            last_applied_term: self.last_applied_term,
            sessions: self.sessions.records(),
            services: sections,
        };
        bincode::encode_to_vec(&archive, bincode::config::standard())
            .map_err(|e| PartitionError::Service(ServiceError::Encode(e.to_string())))
    }

    /// Replaces all service state from the latest complete snapshot.
    /// Used after a chunked transfer lands a snapshot in the store.
    pub fn install_latest(&mut self) -> Result<Option<SnapshotMeta>, PartitionError> {
        self.context.check_thread()?;
        match self.snapshots.load_latest()? {
            Some((meta, data)) => {
                self.install_archive(&meta, &data)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// Atomic from the caller's perspective: on any restore failure the
    /// prior state of every service is put back before returning.
    fn install_archive(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<(), PartitionError> {
        let archive: ServiceArchive = decode_payload(data)?;
        if archive.last_applied != meta.index {
            return Err(ServiceError::Decode(format!(
                "archive applied index {} does not match snapshot index {}",
                archive.last_applied, meta.index
            ))
            .into());
        }
        for registered in &self.services {
            if !archive.services.iter().any(|s| s.name == registered.name) {
                return Err(ServiceError::UnknownService(registered.name.clone()).into());
            }
        }
        for section in &archive.services {
            if !self.services.iter().any(|s| s.name == section.name) {
                warn!(
                    service = %section.name,
                    "snapshot section for unregistered service ignored"
                );
            }
        }

        let mut rollback = Vec::with_capacity(self.services.len());
        for registered in &self.services {
            let mut saved = Vec::new();
            registered.service.backup(&mut saved)?;
            rollback.push(saved);
        }

        let mut failure = None;
        let mut touched = 0;
        for registered in self.services.iter_mut() {
            let Some(section) = archive
                .services
                .iter()
                .find(|s| s.name == registered.name)
            else {
                continue;
            };
            touched += 1;
            if let Err(e) = registered.service.restore(&section.state) {
                failure = Some(e);
                break;
            }
        }

        if let Some(err) = failure {
            warn!("snapshot install failed, restoring prior state: {err}");
            for (registered, saved) in self.services.iter_mut().zip(rollback.iter()).take(touched) {
                if let Err(rollback_err) = registered.service.restore(saved) {
                    error!(
                        service = %registered.name,
                        "state rollback failed after aborted install: {rollback_err}"
                    );
                    self.fault.halt();
                    return Err(ServiceError::StateCorrupted(format!(
                        "service {} unrecoverable after failed install",
                        registered.name
                    ))
                    .into());
                }
            }
            return Err(PartitionError::Service(err));
        }

        self.sessions.restore(archive.sessions);
        self.last_applied = meta.index;
        self.last_applied_term = meta.term;
        self.snapshot_floor = meta.index;
        self.applied_since_snapshot = 0;
        self.bytes_since_snapshot = 0;
        // A capture begun before the install reflects obsolete state
        self.gated = None;
        self.reader.seek(meta.index + 1);
        info!(
            index = meta.index,
            term = meta.term,
            sessions = self.sessions.len(),
            "service state installed from snapshot"
        );
        Ok(())
    }

    pub fn last_applied(&self) -> u64 {
        self.last_applied
    }

    pub fn snapshot_floor(&self) -> u64 {
        self.snapshot_floor
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn metrics(&self) -> Arc<ServiceMetrics> {
        self.metrics.clone()
    }

    /// Whether a capture is waiting on session acknowledgments.
    pub fn has_gated_snapshot(&self) -> bool {
        self.gated.is_some()
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager")
            .field("services", &self.services.len())
            .field("sessions", &self.sessions.len())
            .field("last_applied", &self.last_applied)
            .field("snapshot_floor", &self.snapshot_floor)
            .finish()
    }
}
