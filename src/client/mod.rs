// ============================================================================
// Session Client
// ============================================================================
//
// The narrow seam to the remote database service. Everything below this
// trait (RPC channel, wire encoding, row decoding) belongs to the transport
// layer; the pool and the retry engine only ever see `Result<_, Status>`.
//
// ============================================================================

pub mod memory;

pub use memory::{CallCounts, MemorySessionClient, Operation};

use crate::core::{ErrorClass, SessionKind, TransactionId, TransactionMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Message prefix the service uses when a session is unknown or expired
pub const SESSION_NOT_FOUND: &str = "Session not found";

/// Canonical status codes reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    Unauthenticated,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Aborted => "ABORTED",
            Self::OutOfRange => "OUT_OF_RANGE",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Internal => "INTERNAL",
            Self::Unavailable => "UNAVAILABLE",
            Self::Unauthenticated => "UNAUTHENTICATED",
        };
        write!(f, "{label}")
    }
}

/// Classified error returned by every Session Client call.
///
/// `retry_delay` is the service's retry hint: the minimum time to wait
/// before re-running an aborted transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
    pub retry_delay: Option<Duration>,
}

impl Status {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_delay: None,
        }
    }

    /// Transaction lost a concurrency conflict
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Aborted, message)
    }

    /// The service no longer knows `session` (deleted or expired)
    pub fn session_not_found(session: &str) -> Self {
        Self::new(
            StatusCode::NotFound,
            format!("{SESSION_NOT_FOUND}: {session}"),
        )
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn is_session_not_found(&self) -> bool {
        self.code == StatusCode::NotFound && self.message.starts_with(SESSION_NOT_FOUND)
    }

    /// Transport-level failures after which a session must be re-validated
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self.code,
            StatusCode::Unavailable | StatusCode::Internal | StatusCode::Unknown
        )
    }

    pub fn class(&self) -> ErrorClass {
        match self.code {
            StatusCode::Aborted => ErrorClass::Abort,
            StatusCode::NotFound if self.is_session_not_found() => ErrorClass::InvalidSession,
            StatusCode::DeadlineExceeded => ErrorClass::DeadlineExceeded,
            _ => ErrorClass::Fatal,
        }
    }
}

/// Opaque handle of a session as known by the service
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteSession {
    name: Arc<str>,
}

impl RemoteSession {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for RemoteSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Result of a statement, already decoded by the transport layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
    pub rows: Vec<serde_json::Value>,
    pub rows_affected: u64,
}

impl ResultSet {
    pub fn from_rows(rows: Vec<serde_json::Value>) -> Self {
        Self {
            rows,
            rows_affected: 0,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Remote calls the pool and the transaction runner depend on.
///
/// Implementations wrap the real RPC stub. Every call may fail with a
/// classified [`Status`].
#[async_trait]
pub trait SessionClient: Send + Sync + 'static {
    /// Create up to `count` sessions. The service may return fewer.
    async fn batch_create_sessions(
        &self,
        kind: SessionKind,
        count: usize,
    ) -> Result<Vec<RemoteSession>, Status>;

    async fn delete_session(&self, session: &RemoteSession) -> Result<(), Status>;

    /// Keep-alive no-op that stops the service from reclaiming an idle session
    async fn ping_session(&self, session: &RemoteSession) -> Result<(), Status>;

    async fn begin_transaction(
        &self,
        session: &RemoteSession,
        mode: TransactionMode,
    ) -> Result<TransactionId, Status>;

    async fn execute_sql(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
        sql: &str,
    ) -> Result<ResultSet, Status>;

    async fn commit(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status>;

    async fn rollback(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status>;

    /// Release a read-only snapshot transaction
    async fn end_transaction(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status>;
}
