use crate::client::RemoteSession;
use crate::core::{SessionId, SessionKind, TransactionId};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Pool-side lifecycle of a session
///
/// ```text
/// BeingCreated ──> Idle <──> CheckedOut
///                   │            │
///                   └─────┬──────┘
///                         v
///                     Destroyed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    BeingCreated,
    Idle,
    CheckedOut,
    Destroyed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::BeingCreated => write!(f, "BEING_CREATED"),
            SessionState::Idle => write!(f, "IDLE"),
            SessionState::CheckedOut => write!(f, "CHECKED_OUT"),
            SessionState::Destroyed => write!(f, "DESTROYED"),
        }
    }
}

/// A pooled handle to a remote session.
///
/// Sessions are deliberately not `Clone`: whoever holds the value owns the
/// session until it is handed back with [`SessionPool::release`].
///
/// [`SessionPool::release`]: crate::pool::SessionPool::release
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    remote: RemoteSession,
    kind: SessionKind,
    state: SessionState,
    created_at: Instant,
    last_used_at: Instant,
    last_checked_at: Instant,
    /// Read-write transaction begun ahead of time
    prepared: Option<TransactionId>,
    uses: u64,
}

impl Session {
    pub(crate) fn new(remote: RemoteSession, kind: SessionKind) -> Self {
        let now = Instant::now();
        Self {
            id: SessionId::next(),
            remote,
            kind,
            state: SessionState::BeingCreated,
            created_at: now,
            last_used_at: now,
            last_checked_at: now,
            prepared: None,
            uses: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn remote(&self) -> &RemoteSession {
        &self.remote
    }

    pub fn name(&self) -> &str {
        self.remote.name()
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    /// Number of times this session was checked out
    pub fn uses(&self) -> u64 {
        self.uses
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.is_some()
    }

    pub fn prepared_transaction(&self) -> Option<&TransactionId> {
        self.prepared.as_ref()
    }

    /// Consume the pre-begun read-write transaction, if any
    pub fn take_prepared_transaction(&mut self) -> Option<TransactionId> {
        self.prepared.take()
    }

    pub(crate) fn set_prepared(&mut self, transaction: TransactionId) {
        self.kind = SessionKind::ReadWritePrepared;
        self.prepared = Some(transaction);
    }

    /// Turn a read-write session back into a plain one, returning the
    /// transaction that must be rolled back.
    pub(crate) fn demote(&mut self) -> Option<TransactionId> {
        self.kind = SessionKind::ReadOnly;
        self.prepared.take()
    }

    /// A read-only session handed to a writer becomes read-write
    pub(crate) fn upgrade(&mut self) {
        self.kind = SessionKind::ReadWritePrepared;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = SessionState::Idle;
    }

    /// Record caller activity
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_used_at = now;
    }

    pub(crate) fn mark_checked_out(&mut self) {
        self.state = SessionState::CheckedOut;
        self.uses += 1;
    }

    pub(crate) fn mark_checked(&mut self, now: Instant) {
        self.last_checked_at = now;
    }

    pub(crate) fn mark_destroyed(&mut self) {
        self.state = SessionState::Destroyed;
        self.prepared = None;
    }

    /// Time since a caller last used the session
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at)
    }

    /// Time since the service last saw any activity on the session
    pub fn quiet_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used_at.max(self.last_checked_at))
    }
}
