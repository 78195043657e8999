//! Client sessions owned by the service manager.
//!
//! A session is created by applying an `OpenSession` entry and carries
//! the log index of that entry as its id. All expiry decisions are driven
//! by entry timestamps, never by wall clock at apply time, so replaying
//! the same log always produces the same session states.

use std::collections::BTreeMap;
use std::time::Duration;

use bincode::{Decode, Encode};
use tracing::{debug, info};

use crate::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub enum SessionState {
    Open,
    /// No keep-alive within one timeout; revived by the next keep-alive.
    Suspended,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: SessionId,
    owner_client_name: String,
    primitive_name: String,
    timeout: Duration,
    last_keep_alive_ms: u64,
    /// Highest log index the owning client has acknowledged. Starts at
    /// the open entry's index so a silent client never gates completion
    /// below its own creation point.
    last_acknowledged: u64,
    state: SessionState,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn owner_client_name(&self) -> &str {
        &self.owner_client_name
    }

    pub fn primitive_name(&self) -> &str {
        &self.primitive_name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn last_keep_alive_ms(&self) -> u64 {
        self.last_keep_alive_ms
    }

    pub fn last_acknowledged(&self) -> u64 {
        self.last_acknowledged
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    fn refresh(&mut self, now_ms: u64) {
        self.last_keep_alive_ms = self.last_keep_alive_ms.max(now_ms);
        if self.state == SessionState::Suspended {
            debug!(session = self.id, "session revived by keep-alive");
            self.state = SessionState::Open;
        }
    }
}

/// Durable form of a session inside a snapshot archive.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SessionRecord {
    pub id: SessionId,
    pub owner_client_name: String,
    pub primitive_name: String,
    pub timeout_ms: u64,
    pub last_keep_alive_ms: u64,
    pub last_acknowledged: u64,
    pub state: SessionState,
}

impl From<&Session> for SessionRecord {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            owner_client_name: session.owner_client_name.clone(),
            primitive_name: session.primitive_name.clone(),
            timeout_ms: session.timeout.as_millis() as u64,
            last_keep_alive_ms: session.last_keep_alive_ms,
            last_acknowledged: session.last_acknowledged,
            state: session.state,
        }
    }
}

/// All live sessions of one partition. Ordered by id so iteration and
/// archived form are deterministic.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session. `id` is the index of the `OpenSession` entry,
    /// which also seeds the acknowledgment watermark.
    pub fn open(
        &mut self,
        id: SessionId,
        owner_client_name: String,
        primitive_name: String,
        timeout: Duration,
        now_ms: u64,
    ) -> &Session {
        let session = Session {
            id,
            owner_client_name,
            primitive_name,
            timeout,
            last_keep_alive_ms: now_ms,
            last_acknowledged: id,
            state: SessionState::Open,
        };
        info!(
            session = id,
            client = %session.owner_client_name,
            primitive = %session.primitive_name,
            "session opened"
        );
        self.sessions.entry(id).or_insert(session)
    }

    /// Removes the session. Returns false when no such session exists,
    /// which callers treat as an already-closed no-op.
    pub fn close(&mut self, id: SessionId) -> bool {
        match self.sessions.remove(&id) {
            Some(_) => {
                info!(session = id, "session closed");
                true
            }
            None => false,
        }
    }

    /// Refreshes one session's keep-alive and acknowledgment watermarks.
    /// Returns false for unknown ids (already expired or never opened).
    pub fn keep_alive(&mut self, id: SessionId, acknowledged: u64, now_ms: u64) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.refresh(now_ms);
                session.last_acknowledged = session.last_acknowledged.max(acknowledged);
                true
            }
            None => false,
        }
    }

    /// Refreshes every session's keep-alive watermark. Applied for
    /// `Initialize` and `Configuration` entries so a quiet control plane
    /// never expires sessions behind a leadership change.
    pub fn refresh_all(&mut self, now_ms: u64) {
        for session in self.sessions.values_mut() {
            session.refresh(now_ms);
        }
    }

    /// Sweeps session timeouts as of `now_ms`: one missed timeout
    /// suspends, two closes and removes. Returns the ids removed.
    pub fn expire(&mut self, now_ms: u64) -> Vec<SessionId> {
        let mut removed = Vec::new();
        for session in self.sessions.values_mut() {
            let idle_ms = now_ms.saturating_sub(session.last_keep_alive_ms);
            let timeout_ms = session.timeout.as_millis() as u64;
            if idle_ms > timeout_ms.saturating_mul(2) {
                session.state = SessionState::Closed;
                removed.push(session.id);
            } else if idle_ms > timeout_ms && session.state == SessionState::Open {
                debug!(session = session.id, idle_ms, "session suspended");
                session.state = SessionState::Suspended;
            }
        }
        for id in &removed {
            self.sessions.remove(id);
            info!(session = id, "session expired");
        }
        removed
    }

    pub fn get(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Sessions bound to one primitive, in id order.
    pub fn sessions_for_primitive<'a>(
        &'a self,
        primitive_name: &'a str,
    ) -> impl Iterator<Item = &'a Session> {
        self.sessions
            .values()
            .filter(move |s| s.primitive_name == primitive_name)
    }

    /// Lowest acknowledgment watermark across open sessions, or `None`
    /// when no session is open. Gates snapshot completion.
    pub fn min_acknowledged(&self) -> Option<u64> {
        self.sessions
            .values()
            .filter(|s| s.is_open())
            .map(|s| s.last_acknowledged)
            .min()
    }

    pub fn records(&self) -> Vec<SessionRecord> {
        self.sessions.values().map(SessionRecord::from).collect()
    }

    /// Rebuilds the registry from archived records, dropping any that
    /// were already closed when the archive was taken.
    pub fn restore(&mut self, records: Vec<SessionRecord>) {
        self.sessions.clear();
        for record in records {
            if record.state == SessionState::Closed {
                continue;
            }
            self.sessions.insert(
                record.id,
                Session {
                    id: record.id,
                    owner_client_name: record.owner_client_name,
                    primitive_name: record.primitive_name,
                    timeout: Duration::from_millis(record.timeout_ms),
                    last_keep_alive_ms: record.last_keep_alive_ms,
                    last_acknowledged: record.last_acknowledged,
                    state: record.state,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_test_session(registry: &mut SessionRegistry, id: u64, now_ms: u64) {
        registry.open(
            id,
            format!("client-{id}"),
            "test-map".to_string(),
            Duration::from_millis(100),
            now_ms,
        );
    }

    #[test]
    fn open_and_close() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 5, 1_000);

        assert!(registry.contains(5));
        assert_eq!(registry.get(5).unwrap().last_acknowledged(), 5);
        assert!(registry.close(5));
        assert!(!registry.contains(5));
    }

    #[test]
    fn close_unknown_session_is_a_no_op() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 5, 1_000);

        assert!(registry.close(5));
        assert!(!registry.close(5));
        assert!(!registry.close(99));
    }

    #[test]
    fn keep_alive_refreshes_and_advances_ack() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 3, 1_000);

        assert!(registry.keep_alive(3, 10, 1_050));
        let session = registry.get(3).unwrap();
        assert_eq!(session.last_keep_alive_ms(), 1_050);
        assert_eq!(session.last_acknowledged(), 10);

        // A stale ack never rolls the watermark back.
        assert!(registry.keep_alive(3, 4, 1_060));
        assert_eq!(registry.get(3).unwrap().last_acknowledged(), 10);

        assert!(!registry.keep_alive(99, 0, 1_060));
    }

    #[test]
    fn expiry_suspends_then_closes() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 1, 1_000);

        // Within one timeout: untouched.
        assert!(registry.expire(1_100).is_empty());
        assert_eq!(registry.get(1).unwrap().state(), SessionState::Open);

        // Past one timeout: suspended, still present.
        assert!(registry.expire(1_150).is_empty());
        assert_eq!(registry.get(1).unwrap().state(), SessionState::Suspended);

        // Past two timeouts: removed.
        let removed = registry.expire(1_250);
        assert_eq!(removed, vec![1]);
        assert!(!registry.contains(1));
    }

    #[test]
    fn keep_alive_revives_suspended_session() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 1, 1_000);

        registry.expire(1_150);
        assert_eq!(registry.get(1).unwrap().state(), SessionState::Suspended);

        assert!(registry.keep_alive(1, 1, 1_160));
        assert_eq!(registry.get(1).unwrap().state(), SessionState::Open);
    }

    #[test]
    fn refresh_all_keeps_every_session_alive() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 1, 1_000);
        open_test_session(&mut registry, 2, 1_000);

        registry.refresh_all(1_140);
        assert!(registry.expire(1_180).is_empty());
        assert_eq!(registry.get(1).unwrap().state(), SessionState::Open);
        assert_eq!(registry.get(2).unwrap().state(), SessionState::Open);
    }

    #[test]
    fn min_acknowledged_covers_open_sessions_only() {
        let mut registry = SessionRegistry::new();
        assert_eq!(registry.min_acknowledged(), None);

        open_test_session(&mut registry, 4, 1_000);
        open_test_session(&mut registry, 9, 1_000);
        registry.keep_alive(9, 20, 1_010);
        assert_eq!(registry.min_acknowledged(), Some(4));

        // Suspended sessions stop gating.
        registry.keep_alive(9, 20, 1_200);
        registry.expire(1_200);
        assert_eq!(registry.min_acknowledged(), Some(20));
    }

    #[test]
    fn records_round_trip() {
        let mut registry = SessionRegistry::new();
        open_test_session(&mut registry, 2, 1_000);
        open_test_session(&mut registry, 7, 1_500);
        registry.keep_alive(7, 12, 1_600);

        let records = registry.records();
        assert_eq!(records.len(), 2);

        let mut restored = SessionRegistry::new();
        restored.restore(records);
        assert_eq!(restored.len(), 2);
        let session = restored.get(7).unwrap();
        assert_eq!(session.owner_client_name(), "client-7");
        assert_eq!(session.last_acknowledged(), 12);
        assert_eq!(session.last_keep_alive_ms(), 1_600);
    }

    #[test]
    fn sessions_for_primitive_filters() {
        let mut registry = SessionRegistry::new();
        registry.open(
            1,
            "a".to_string(),
            "map".to_string(),
            Duration::from_millis(100),
            0,
        );
        registry.open(
            2,
            "b".to_string(),
            "set".to_string(),
            Duration::from_millis(100),
            0,
        );
        registry.open(
            3,
            "c".to_string(),
            "map".to_string(),
            Duration::from_millis(100),
            0,
        );

        let ids: Vec<u64> = registry
            .sessions_for_primitive("map")
            .map(|s| s.id())
            .collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
