//! The per-partition runtime facade.
//!
//! Owns the stores, the admission gate, the service manager and the
//! compactor, and serializes every log mutation onto one owning thread.
//! Producers on any thread go through [`Partition::submit`]: admission
//! grants a lease, the append job is queued in grant order, and the
//! caller's future resolves with the entry's apply outcome once the
//! entry commits and applies.
//!
//! A standalone partition is its own quorum: appends commit as soon as
//! they are durable, and the whole log is re-committed at startup.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::info;

use crate::admission::{AdmissionControl, AdmissionOptions, InFlightAppend, WriteOrigin};
use crate::compaction::{CompactionOptions, DeletionService, LogCompactor};
use crate::context::PartitionContext;
use crate::error::{
    ConfigError, ContextError, PartitionError, PartitionFaultHandler, ServiceError, StorageError,
};
use crate::metrics::{AdmissionMetrics, CompactionMetrics, ServiceMetrics, SnapshotMetrics};
use crate::service::{
    ApplyOutcome, CloseSessionPayload, CommandPayload, KeepAlivePayload, MetadataPayload,
    OpenSessionPayload, PrimitiveService, QueryPayload, ServiceManager, ServiceManagerOptions,
    SessionAck, SessionInfo, encode_payload,
};
use crate::storage::log::{EntryType, LogStore, LogStoreOptions, LogWriter};
use crate::storage::snapshot::{
    SnapshotListener, SnapshotMeta, SnapshotStore, SnapshotStoreOptions,
};
use crate::types::{OperationId, PartitionId, SessionId};

#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub partition_id: PartitionId,
    pub log: LogStoreOptions,
    pub snapshots: SnapshotStoreOptions,
    pub admission: AdmissionOptions,
    pub manager: ServiceManagerOptions,
    pub compaction: CompactionOptions,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self::with_dir(PartitionId(0), "./data")
    }
}

impl PartitionOptions {
    /// Options rooted at `dir`, with the log under `dir/log` and
    /// snapshots under `dir/snapshots`.
    pub fn with_dir<P: AsRef<Path>>(partition_id: PartitionId, dir: P) -> Self {
        let dir = dir.as_ref();
        Self {
            partition_id,
            log: LogStoreOptions::with_dir(dir.join("log")),
            snapshots: SnapshotStoreOptions::with_dir(dir.join("snapshots")),
            admission: AdmissionOptions::default(),
            manager: ServiceManagerOptions::default(),
            compaction: CompactionOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.snapshots.validate()?;
        self.admission.validate()?;
        self.manager.validate()?;
        Ok(())
    }
}

/// One replicated-log partition: durable log, snapshots, sessions and
/// primitive services behind a single submission surface.
///
/// Construction is three steps: [`open`] the stores, [`register_service`]
/// every primitive, then [`start`] to recover state and begin serving.
///
/// [`open`]: Partition::open
/// [`register_service`]: Partition::register_service
/// [`start`]: Partition::start
pub struct Partition {
    id: PartitionId,
    context: Arc<PartitionContext>,
    store: LogStore,
    snapshots: SnapshotStore,
    admission: AdmissionControl,
    writer: Arc<Mutex<LogWriter>>,
    manager: Arc<Mutex<ServiceManager>>,
    compactor: Arc<LogCompactor>,
    deletion: Arc<DeletionService>,
    fault: Arc<PartitionFaultHandler>,
    /// Serializes permit grant and job ordering so the entry at the
    /// lower index always belongs to the earlier lease
    grant_order: Mutex<()>,
}

impl Partition {
    pub fn open(options: PartitionOptions) -> Result<Self, PartitionError> {
        options.validate()?;
        let id = options.partition_id;
        let context = Arc::new(
            PartitionContext::spawn(id.to_string())
                .map_err(|e| StorageError::Io(Arc::new(e.into())))?,
        );
        let fault = Arc::new(PartitionFaultHandler::new(id));
        let store = LogStore::open(options.log)?;
        let snapshots = SnapshotStore::open(options.snapshots, Arc::new(SnapshotMetrics::default()))?;
        let admission = AdmissionControl::with_fault_handler(
            options.admission,
            Arc::new(AdmissionMetrics::default()),
            Some(fault.clone()),
        );
        let writer = Arc::new(Mutex::new(LogWriter::new(store.clone(), context.clone())));
        let manager = ServiceManager::new(
            context.clone(),
            store.clone(),
            snapshots.clone(),
            options.manager,
            fault.clone(),
        )?;
        let compactor = Arc::new(LogCompactor::new(
            context.clone(),
            store.clone(),
            options.compaction,
        ));
        let deletion = Arc::new(DeletionService::new(
            context.clone(),
            store.clone(),
            compactor.clone(),
        ));
        snapshots.register_listener(deletion.clone());

        info!(partition = %id, "partition opened");
        Ok(Self {
            id,
            context,
            store,
            snapshots,
            admission,
            writer,
            manager: Arc::new(Mutex::new(manager)),
            compactor,
            deletion,
            fault,
            grant_order: Mutex::new(()),
        })
    }

    /// Registers a primitive service. Call before [`start`]; the service
    /// set is fixed once entries begin applying.
    ///
    /// [`start`]: Partition::start
    pub fn register_service(
        &self,
        name: impl Into<String>,
        service: Box<dyn PrimitiveService>,
    ) -> Result<(), PartitionError> {
        self.manager.lock().register_service(name, service)?;
        Ok(())
    }

    /// Recovers state from the latest snapshot plus the log tail and
    /// begins serving. The whole durable log is re-committed first: a
    /// standalone partition is its own quorum.
    pub async fn start(&self) -> Result<(), PartitionError> {
        let store = self.store.clone();
        let manager = self.manager.clone();
        let result = self
            .on_context(move || {
                let last = store.last_index();
                if last > store.commit_index() {
                    store.commit(last)?;
                }
                manager.lock().recover()
            })
            .await?;
        if result.is_ok() {
            info!(
                partition = %self.id,
                last_applied = self.last_applied(),
                "partition started"
            );
        }
        result
    }

    /// Appends one entry and resolves with its apply outcome. Rejections
    /// under saturation surface immediately; the caller backs off and
    /// retries.
    pub async fn submit(
        &self,
        origin: WriteOrigin,
        entry_type: EntryType,
        payload: Vec<u8>,
    ) -> Result<ApplyOutcome, PartitionError> {
        let mut outcomes = self.submit_inner(origin, vec![(entry_type, payload)]).await?;
        outcomes
            .pop()
            .ok_or_else(|| {
                PartitionError::Service(ServiceError::CommandFailed(
                    "append resolved without an outcome".to_string(),
                ))
            })?
            .map_err(PartitionError::from)
    }

    /// Appends a batch as consecutive entries under one admission lease
    /// and resolves with per-entry outcomes. A failing entry never
    /// blocks the rest of the batch.
    pub async fn submit_batch(
        &self,
        origin: WriteOrigin,
        batch: Vec<(EntryType, Vec<u8>)>,
    ) -> Result<Vec<Result<ApplyOutcome, ServiceError>>, PartitionError> {
        self.submit_inner(origin, batch).await
    }

    async fn submit_inner(
        &self,
        origin: WriteOrigin,
        batch: Vec<(EntryType, Vec<u8>)>,
    ) -> Result<Vec<Result<ApplyOutcome, ServiceError>>, PartitionError> {
        if self.fault.is_halted() {
            return Err(PartitionError::Halted);
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let entry_types: Vec<EntryType> = batch.iter().map(|(t, _)| *t).collect();
        let (tx, rx) = oneshot::channel();
        {
            // Grant and enqueue under one guard; jobs run in queue order,
            // so indices are assigned in grant order.
            let _granted = self.grant_order.lock();
            let lease = self.admission.try_acquire(origin, &entry_types)?;
            let writer = self.writer.clone();
            let manager = self.manager.clone();
            self.context.execute(move || {
                let _ = tx.send(append_apply(&writer, &manager, lease, batch));
            })?;
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self.closed_error()),
        }
    }

    /// Opens a session for `client` against the named primitive. A zero
    /// timeout falls back to the partition default. Returns the session
    /// id, which doubles as the open entry's log index.
    pub async fn open_session(
        &self,
        client: impl Into<String>,
        primitive: impl Into<String>,
        timeout: Duration,
    ) -> Result<SessionId, PartitionError> {
        let payload = encode_payload(&OpenSessionPayload {
            owner_client_name: client.into(),
            primitive_name: primitive.into(),
            timeout_ms: timeout.as_millis() as u64,
        })?;
        match self
            .submit(WriteOrigin::External, EntryType::OpenSession, payload)
            .await?
        {
            ApplyOutcome::SessionOpened(id) => Ok(id),
            outcome => Err(unexpected_outcome("OpenSession", &outcome)),
        }
    }

    /// Closes a session. Closing an unknown or already-closed session is
    /// a no-op, never an error.
    pub async fn close_session(&self, session_id: SessionId) -> Result<(), PartitionError> {
        let payload = encode_payload(&CloseSessionPayload { session_id })?;
        match self
            .submit(WriteOrigin::External, EntryType::CloseSession, payload)
            .await?
        {
            ApplyOutcome::None => Ok(()),
            outcome => Err(unexpected_outcome("CloseSession", &outcome)),
        }
    }

    /// Refreshes sessions and records their acknowledged indices. Expired
    /// sessions are swept as part of the same entry.
    pub async fn keep_alive(&self, acks: Vec<SessionAck>) -> Result<(), PartitionError> {
        let payload = encode_payload(&KeepAlivePayload { acks })?;
        match self
            .submit(WriteOrigin::External, EntryType::KeepAlive, payload)
            .await?
        {
            ApplyOutcome::None => Ok(()),
            outcome => Err(unexpected_outcome("KeepAlive", &outcome)),
        }
    }

    /// Runs a state-mutating operation against the session's primitive.
    pub async fn command(
        &self,
        session_id: SessionId,
        operation: OperationId,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, PartitionError> {
        let payload = encode_payload(&CommandPayload {
            session_id,
            operation,
            input,
        })?;
        match self
            .submit(WriteOrigin::External, EntryType::Command, payload)
            .await?
        {
            ApplyOutcome::Output(output) => Ok(output),
            outcome => Err(unexpected_outcome("Command", &outcome)),
        }
    }

    /// Runs a read-only operation against the session's primitive.
    pub async fn query(
        &self,
        session_id: SessionId,
        operation: OperationId,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, PartitionError> {
        let payload = encode_payload(&QueryPayload {
            session_id,
            operation,
            input,
        })?;
        match self
            .submit(WriteOrigin::External, EntryType::Query, payload)
            .await?
        {
            ApplyOutcome::Output(output) => Ok(output),
            outcome => Err(unexpected_outcome("Query", &outcome)),
        }
    }

    /// Lists sessions. Session id 0 lists every session; any other id
    /// scopes the listing to sessions sharing that session's primitive.
    pub async fn metadata(
        &self,
        session_id: SessionId,
    ) -> Result<Vec<SessionInfo>, PartitionError> {
        let payload = encode_payload(&MetadataPayload { session_id })?;
        match self
            .submit(WriteOrigin::External, EntryType::Metadata, payload)
            .await?
        {
            ApplyOutcome::Metadata(sessions) => Ok(sessions),
            outcome => Err(unexpected_outcome("Metadata", &outcome)),
        }
    }

    /// Captures a snapshot outside the policy interval. Returns `None`
    /// when there is nothing new to capture or completion is still
    /// waiting on session acknowledgments.
    pub async fn force_snapshot(&self) -> Result<Option<SnapshotMeta>, PartitionError> {
        let manager = self.manager.clone();
        self.on_context(move || manager.lock().take_snapshot()).await?
    }

    /// Reclaims log space up to the latest compactable index, ignoring
    /// the replication threshold. Returns the floor now in effect.
    pub async fn force_compact(&self) -> Result<u64, PartitionError> {
        let compactor = self.compactor.clone();
        let floor = self
            .on_context(move || compactor.compact_ignoring_replication_threshold())
            .await??;
        Ok(floor)
    }

    /// Replaces service state from the latest complete snapshot, as after
    /// a chunked transfer from a peer lands one in the store.
    pub async fn install_latest_snapshot(
        &self,
    ) -> Result<Option<SnapshotMeta>, PartitionError> {
        let manager = self.manager.clone();
        self.on_context(move || manager.lock().install_latest()).await?
    }

    /// Updates the term stamped on subsequent entries.
    pub async fn set_term(&self, term: u64) -> Result<(), PartitionError> {
        let writer = self.writer.clone();
        self.on_context(move || writer.lock().set_term(term)).await?
    }

    /// Stops serving: the owning thread drains and joins, and the log
    /// refuses further mutation. Reads stay available.
    pub fn close(&self) {
        let listener: Arc<dyn SnapshotListener> = self.deletion.clone();
        self.snapshots.unregister_listener(&listener);
        self.context.shutdown();
        self.store.close();
        info!(partition = %self.id, "partition closed");
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn log(&self) -> &LogStore {
        &self.store
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    pub fn is_halted(&self) -> bool {
        self.fault.is_halted()
    }

    pub fn last_applied(&self) -> u64 {
        self.manager.lock().last_applied()
    }

    pub fn service_metrics(&self) -> Arc<ServiceMetrics> {
        self.manager.lock().metrics()
    }

    pub fn compaction_metrics(&self) -> Arc<CompactionMetrics> {
        self.compactor.metrics()
    }

    /// Runs `f` on the owning thread and resolves with its result.
    async fn on_context<R, F>(&self, f: F) -> Result<R, PartitionError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.context.execute(move || {
            let _ = tx.send(f());
        })?;
        rx.await.map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> PartitionError {
        PartitionError::Context(ContextError::Closed(self.context.name().to_string()))
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("last_index", &self.store.last_index())
            .field("halted", &self.fault.is_halted())
            .finish()
    }
}

fn unexpected_outcome(operation: &str, outcome: &ApplyOutcome) -> PartitionError {
    PartitionError::Service(ServiceError::CommandFailed(format!(
        "{operation} resolved to an unexpected outcome: {outcome:?}"
    )))
}

/// Owning-thread body of a submission: append, commit, resolve the
/// lease, then apply and collect every entry's outcome.
fn append_apply(
    writer: &Mutex<LogWriter>,
    manager: &Mutex<ServiceManager>,
    lease: InFlightAppend,
    batch: Vec<(EntryType, Vec<u8>)>,
) -> Result<Vec<Result<ApplyOutcome, ServiceError>>, PartitionError> {
    let count = batch.len() as u64;
    let last = {
        let writer = writer.lock();
        let last = match writer.append_batch(batch) {
            Ok(last) => last,
            Err(e) => {
                fail_lease_on_write(lease, &e);
                return Err(e);
            }
        };
        if let Err(e) = writer.commit(last) {
            fail_lease_on_commit(lease, last, &e);
            return Err(e);
        }
        last
    };
    lease.on_commit(last);

    let first = last + 1 - count;
    let mut manager = manager.lock();
    let mut receivers = Vec::with_capacity(count as usize);
    for index in first..=last {
        receivers.push(manager.register_result(index)?);
    }
    manager.apply(last)?;
    drop(manager);

    let mut outcomes = Vec::with_capacity(receivers.len());
    for mut receiver in receivers {
        match receiver.try_recv() {
            Ok(outcome) => outcomes.push(outcome),
            Err(_) => {
                return Err(ServiceError::CommandFailed(
                    "entry applied without a recorded result".to_string(),
                )
                .into());
            }
        }
    }
    Ok(outcomes)
}

fn fail_lease_on_write(lease: InFlightAppend, err: &PartitionError) {
    match err {
        PartitionError::Storage(e) => lease.on_write_error(e),
        PartitionError::Context(e) => lease.on_write_error(e),
        _ => drop(lease),
    }
}

fn fail_lease_on_commit(lease: InFlightAppend, index: u64, err: &PartitionError) {
    match err {
        PartitionError::Storage(e) => lease.on_commit_error(index, e),
        PartitionError::Context(e) => lease.on_commit_error(index, e),
        _ => drop(lease),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdaptiveLimitOptions;
    use crate::error::Rejection;
    use crate::service::{OperationKind, OperationRegistry, SnapshotPolicy};
    use tempfile::TempDir;

    const OP_ADD: OperationId = 1;
    const OP_GET: OperationId = 2;
    const OP_POISON: OperationId = 3;

    struct CounterService {
        value: u64,
    }

    impl CounterService {
        fn new() -> Self {
            Self { value: 0 }
        }
    }

    fn parse_u64(input: &[u8]) -> Result<u64, ServiceError> {
        let bytes: [u8; 8] = input
            .try_into()
            .map_err(|_| ServiceError::Decode(format!("expected 8 bytes, got {}", input.len())))?;
        Ok(u64::from_le_bytes(bytes))
    }

    impl PrimitiveService for CounterService {
        fn configure(&mut self, registry: &mut OperationRegistry) {
            registry.register(OP_ADD, OperationKind::Command);
            registry.register(OP_GET, OperationKind::Query);
            registry.register(OP_POISON, OperationKind::Command);
        }

        fn execute(
            &mut self,
            operation: OperationId,
            input: &[u8],
        ) -> Result<Vec<u8>, ServiceError> {
            match operation {
                OP_ADD => {
                    self.value += parse_u64(input)?;
                    Ok(self.value.to_le_bytes().to_vec())
                }
                OP_POISON => Err(ServiceError::StateCorrupted("poisoned".to_string())),
                _ => Err(ServiceError::UnknownOperation {
                    service: "counter".to_string(),
                    operation,
                }),
            }
        }

        fn query(&self, operation: OperationId, _input: &[u8]) -> Result<Vec<u8>, ServiceError> {
            match operation {
                OP_GET => Ok(self.value.to_le_bytes().to_vec()),
                _ => Err(ServiceError::UnknownOperation {
                    service: "counter".to_string(),
                    operation,
                }),
            }
        }

        fn backup(&self, output: &mut Vec<u8>) -> Result<(), ServiceError> {
            output.extend_from_slice(&self.value.to_le_bytes());
            Ok(())
        }

        fn restore(&mut self, input: &[u8]) -> Result<(), ServiceError> {
            self.value = parse_u64(input)?;
            Ok(())
        }
    }

    fn test_options(dir: &TempDir) -> PartitionOptions {
        let mut options = PartitionOptions::with_dir(PartitionId(7), dir.path());
        options.log.sync_on_write = false;
        options.snapshots.sync_on_write = false;
        options
    }

    async fn open_partition(options: PartitionOptions) -> Partition {
        let partition = Partition::open(options).unwrap();
        partition
            .register_service("counter", Box::new(CounterService::new()))
            .unwrap();
        partition.start().await.unwrap();
        partition
    }

    async fn fence(partition: &Partition) {
        partition.on_context(|| ()).await.unwrap();
    }

    #[tokio::test]
    async fn command_and_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let partition = open_partition(test_options(&dir)).await;

        let session = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(session, 1);

        let output = partition
            .command(session, OP_ADD, 5u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        assert_eq!(parse_u64(&output).unwrap(), 5);

        let output = partition
            .command(session, OP_ADD, 3u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        assert_eq!(parse_u64(&output).unwrap(), 8);

        let output = partition.query(session, OP_GET, Vec::new()).await.unwrap();
        assert_eq!(parse_u64(&output).unwrap(), 8);

        let sessions = partition.metadata(0).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, session);
        assert_eq!(sessions[0].primitive_name, "counter");

        partition.close();
    }

    #[tokio::test]
    async fn close_session_twice_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let partition = open_partition(test_options(&dir)).await;

        let session = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();

        partition.close_session(session).await.unwrap();
        partition.close_session(session).await.unwrap();

        assert!(partition.metadata(0).await.unwrap().is_empty());
        partition.close();
    }

    #[tokio::test]
    async fn saturated_admission_rejects_until_a_lease_resolves() {
        let dir = TempDir::new().unwrap();
        let mut options = test_options(&dir);
        options.admission.limit = AdaptiveLimitOptions {
            initial_limit: 1,
            min_limit: 1,
            max_limit: 1,
            ..Default::default()
        };
        let partition = open_partition(options).await;

        let held = partition
            .admission()
            .try_acquire(WriteOrigin::Internal, &[EntryType::Command])
            .unwrap();

        let err = partition
            .submit(WriteOrigin::External, EntryType::Initialize, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Rejected(Rejection::ConcurrencyLimitExhausted { .. })
        ));

        held.on_commit(1);
        partition
            .submit(WriteOrigin::External, EntryType::Initialize, Vec::new())
            .await
            .unwrap();
        partition.close();
    }

    #[tokio::test]
    async fn rate_limit_rejects_commands_but_spares_the_control_plane() {
        let dir = TempDir::new().unwrap();
        let mut options = test_options(&dir);
        options.admission.write_rate_limit = 1;
        options.admission.write_burst = 1;
        let partition = open_partition(options).await;

        // OpenSession is rate-exempt, so setup is unaffected.
        let session = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();

        partition
            .command(session, OP_ADD, 1u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        let err = partition
            .command(session, OP_ADD, 1u64.to_le_bytes().to_vec())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Rejected(Rejection::WriteRateLimitExhausted)
        ));

        partition.keep_alive(Vec::new()).await.unwrap();
        partition.close();
    }

    #[tokio::test]
    async fn batch_applies_in_order_and_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let partition = open_partition(test_options(&dir)).await;

        let session = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();

        let command = |session_id: u64, delta: u64| {
            let payload = encode_payload(&CommandPayload {
                session_id,
                operation: OP_ADD,
                input: delta.to_le_bytes().to_vec(),
            })
            .unwrap();
            (EntryType::Command, payload)
        };

        let outcomes = partition
            .submit_batch(
                WriteOrigin::External,
                vec![command(session, 5), command(99, 1), command(session, 3)],
            )
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert_eq!(
            outcomes[0],
            Ok(ApplyOutcome::Output(5u64.to_le_bytes().to_vec()))
        );
        assert_eq!(outcomes[1], Err(ServiceError::UnknownSession(99)));
        assert_eq!(
            outcomes[2],
            Ok(ApplyOutcome::Output(8u64.to_le_bytes().to_vec()))
        );
        partition.close();
    }

    #[tokio::test]
    async fn corrupted_state_halts_the_partition() {
        let dir = TempDir::new().unwrap();
        let partition = open_partition(test_options(&dir)).await;

        let session = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();

        let err = partition
            .command(session, OP_POISON, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Service(ServiceError::StateCorrupted(_))
        ));
        assert!(partition.is_halted());

        let err = partition
            .command(session, OP_ADD, 1u64.to_le_bytes().to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, PartitionError::Halted));
        partition.close();
    }

    #[tokio::test]
    async fn snapshot_then_restart_resumes_where_it_left_off() {
        let dir = TempDir::new().unwrap();

        let partition = open_partition(test_options(&dir)).await;
        let s1 = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();
        partition
            .command(s1, OP_ADD, 5u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        partition
            .command(s1, OP_ADD, 3u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        partition.close_session(s1).await.unwrap();

        // No open sessions, so completion is not gated.
        let meta = partition.force_snapshot().await.unwrap().unwrap();
        assert_eq!(meta.index, 4);

        let s2 = partition
            .open_session("client-b", "counter", Duration::ZERO)
            .await
            .unwrap();
        partition
            .command(s2, OP_ADD, 4u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        partition.close();

        // A fresh runtime over the same directory recovers the snapshot,
        // replays the tail (recreating session s2 at the same id) and
        // serves the accumulated state.
        let reopened = open_partition(test_options(&dir)).await;
        assert_eq!(reopened.last_applied(), 6);

        let s3 = reopened
            .open_session("client-c", "counter", Duration::ZERO)
            .await
            .unwrap();
        let output = reopened.query(s3, OP_GET, Vec::new()).await.unwrap();
        assert_eq!(parse_u64(&output).unwrap(), 12);

        let sessions = reopened.metadata(0).await.unwrap();
        let ids: Vec<u64> = sessions.iter().map(|s| s.session_id).collect();
        assert_eq!(ids, vec![s2, s3]);
        reopened.close();
    }

    #[tokio::test]
    async fn policy_snapshot_drives_log_compaction() {
        let dir = TempDir::new().unwrap();
        let mut options = test_options(&dir);
        options.manager.policy = SnapshotPolicy {
            entry_interval: 4,
            byte_interval: 0,
        };
        options.compaction.replication_threshold = 0;
        let partition = open_partition(options).await;

        for _ in 0..4 {
            partition
                .submit(WriteOrigin::Internal, EntryType::Initialize, Vec::new())
                .await
                .unwrap();
        }
        fence(&partition).await;

        let latest = partition.snapshots().latest().unwrap();
        assert_eq!(latest.index, 4);
        assert_eq!(partition.log().first_index(), 4);
        partition.close();
    }

    #[tokio::test]
    async fn forced_compaction_ignores_the_replication_threshold() {
        let dir = TempDir::new().unwrap();
        let mut options = test_options(&dir);
        options.compaction.replication_threshold = 2;
        let partition = open_partition(options).await;

        let session = partition
            .open_session("client-a", "counter", Duration::ZERO)
            .await
            .unwrap();
        partition
            .command(session, OP_ADD, 5u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        partition
            .command(session, OP_ADD, 3u64.to_le_bytes().to_vec())
            .await
            .unwrap();
        partition.close_session(session).await.unwrap();

        let meta = partition.force_snapshot().await.unwrap().unwrap();
        assert_eq!(meta.index, 4);
        fence(&partition).await;

        // Routine compaction held back two entries behind the snapshot.
        assert_eq!(partition.log().first_index(), 2);

        let floor = partition.force_compact().await.unwrap();
        assert_eq!(floor, 4);
        assert_eq!(partition.log().first_index(), 4);
        partition.close();
    }
}
