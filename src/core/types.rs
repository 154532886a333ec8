use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global session generation counter
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// What a pooled session is prepared for.
///
/// A `ReadWritePrepared` session carries a read-write transaction that was begun
/// ahead of time, so a writer can skip the begin round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionKind {
    ReadOnly,
    ReadWritePrepared,
}

impl SessionKind {
    pub const ALL: [SessionKind; 2] = [SessionKind::ReadOnly, SessionKind::ReadWritePrepared];

    /// Stable slot for per-kind counters
    pub(crate) fn index(self) -> usize {
        match self {
            SessionKind::ReadOnly => 0,
            SessionKind::ReadWritePrepared => 1,
        }
    }

    /// Transaction mode a caller asking for this kind runs in
    pub fn transaction_mode(self) -> TransactionMode {
        match self {
            SessionKind::ReadOnly => TransactionMode::ReadOnly,
            SessionKind::ReadWritePrepared => TransactionMode::ReadWrite,
        }
    }

    /// Whether an idle session of kind `self` may be handed to a request for `requested`.
    ///
    /// Readers may take any session. Writers may take a read-only session only
    /// when upgrades are allowed.
    pub fn can_serve(self, requested: SessionKind, allow_upgrade: bool) -> bool {
        match (requested, self) {
            (SessionKind::ReadOnly, _) => true,
            (SessionKind::ReadWritePrepared, SessionKind::ReadWritePrepared) => true,
            (SessionKind::ReadWritePrepared, SessionKind::ReadOnly) => allow_upgrade,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::ReadOnly => write!(f, "read_only"),
            SessionKind::ReadWritePrepared => write!(f, "read_write_prepared"),
        }
    }
}

/// Mode of a remote transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "READ ONLY"),
            TransactionMode::ReadWrite => write!(f, "READ WRITE"),
        }
    }
}

/// Locally generated, monotonic generation id of a pooled session.
///
/// Never reused within a process, so a replaced session is always
/// distinguishable from the one it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Generate the next session generation id
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Opaque transaction identifier assigned by the remote service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(Arc<str>);

impl TransactionId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}
