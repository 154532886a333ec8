use super::{RemoteSession, ResultSet, SessionClient, Status, StatusCode};
use crate::core::{SessionKind, TransactionId, TransactionMode};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Remote call a fault can be injected into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateSessions,
    DeleteSession,
    PingSession,
    BeginTransaction,
    ExecuteSql,
    Commit,
    Rollback,
    EndTransaction,
}

/// Number of calls the in-memory service received, per operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_batches: u64,
    pub sessions_created: u64,
    pub deletes: u64,
    pub pings: u64,
    pub begins: u64,
    pub executes: u64,
    pub commits: u64,
    pub rollbacks: u64,
    pub ends: u64,
}

struct Fault {
    status: Status,
    /// `None` keeps failing until cleared
    remaining: Option<usize>,
}

struct ServerSession {
    kind: SessionKind,
    open_transactions: HashSet<String>,
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<String, ServerSession>,
    next_transaction: u64,
    faults: HashMap<Operation, VecDeque<Fault>>,
    results: HashMap<String, ResultSet>,
    counts: CallCounts,
}

impl MemoryState {
    fn take_fault(&mut self, operation: Operation) -> Option<Status> {
        let queue = self.faults.get_mut(&operation)?;
        let fault = queue.front_mut()?;
        let status = fault.status.clone();
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                queue.pop_front();
            }
        }
        Some(status)
    }

    fn session_mut(&mut self, session: &RemoteSession) -> Result<&mut ServerSession, Status> {
        self.sessions
            .get_mut(session.name())
            .ok_or_else(|| Status::session_not_found(session.name()))
    }

    fn close_transaction(
        &mut self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status> {
        let server_session = self.session_mut(session)?;
        if !server_session.open_transactions.remove(transaction.as_str()) {
            return Err(Status::new(
                StatusCode::FailedPrecondition,
                format!("Transaction {} is not active", transaction.as_str()),
            ));
        }
        Ok(())
    }
}

/// In-process stand-in for the remote database service.
///
/// Keeps server-side session and transaction bookkeeping, counts every call
/// and lets tests script failures per [`Operation`]. Useful for tests,
/// demos and load experiments that must not touch a real service.
///
/// # Examples
///
/// ```
/// use sessionpool::client::{MemorySessionClient, Operation, Status};
///
/// let client = MemorySessionClient::new("orders")
///     .with_create_latency(std::time::Duration::from_millis(5));
/// client.fail_times(Operation::Commit, 2, Status::aborted("conflict"));
/// assert_eq!(client.live_sessions(), 0);
/// ```
pub struct MemorySessionClient {
    database: String,
    create_latency: Duration,
    call_latency: Duration,
    batch_surplus: usize,
    state: Mutex<MemoryState>,
}

impl MemorySessionClient {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            create_latency: Duration::ZERO,
            call_latency: Duration::ZERO,
            batch_surplus: 0,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Simulated round-trip time of `batch_create_sessions`
    pub fn with_create_latency(mut self, latency: Duration) -> Self {
        self.create_latency = latency;
        self
    }

    /// Simulated round-trip time of every other call
    pub fn with_call_latency(mut self, latency: Duration) -> Self {
        self.call_latency = latency;
        self
    }

    /// Hand out `surplus` more sessions than each batch asked for
    pub fn with_batch_surplus(mut self, surplus: usize) -> Self {
        self.batch_surplus = surplus;
        self
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next call of `operation` with `status`
    pub fn fail_next(&self, operation: Operation, status: Status) {
        self.fail_times(operation, 1, status);
    }

    /// Fail the next `times` calls of `operation` with `status`
    pub fn fail_times(&self, operation: Operation, times: usize, status: Status) {
        if times == 0 {
            return;
        }
        self.lock_state()
            .faults
            .entry(operation)
            .or_default()
            .push_back(Fault {
                status,
                remaining: Some(times),
            });
    }

    /// Fail every call of `operation` until [`clear_faults`](Self::clear_faults)
    pub fn fail_always(&self, operation: Operation, status: Status) {
        self.lock_state()
            .faults
            .entry(operation)
            .or_default()
            .push_back(Fault {
                status,
                remaining: None,
            });
    }

    pub fn clear_faults(&self) {
        self.lock_state().faults.clear();
    }

    /// Drop a session server-side, as if it expired.
    ///
    /// Returns `false` when the session was already gone.
    pub fn invalidate_session(&self, name: &str) -> bool {
        self.lock_state().sessions.remove(name).is_some()
    }

    pub fn invalidate_all_sessions(&self) -> usize {
        let mut state = self.lock_state();
        let count = state.sessions.len();
        state.sessions.clear();
        count
    }

    /// Canned result for a statement
    pub fn set_result(&self, sql: &str, result: ResultSet) {
        self.lock_state().results.insert(sql.to_string(), result);
    }

    pub fn counts(&self) -> CallCounts {
        self.lock_state().counts.clone()
    }

    /// Sessions the service currently knows about
    pub fn live_sessions(&self) -> usize {
        self.lock_state().sessions.len()
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.lock_state().sessions.contains_key(name)
    }

    /// Server-side sessions created for `kind` that are still alive
    pub fn live_sessions_of_kind(&self, kind: SessionKind) -> usize {
        self.lock_state()
            .sessions
            .values()
            .filter(|session| session.kind == kind)
            .count()
    }

    /// Transactions begun and not yet committed, rolled back or ended
    pub fn open_transactions(&self) -> usize {
        self.lock_state()
            .sessions
            .values()
            .map(|session| session.open_transactions.len())
            .sum()
    }

    async fn simulate_latency(latency: Duration) {
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl SessionClient for MemorySessionClient {
    async fn batch_create_sessions(
        &self,
        kind: SessionKind,
        count: usize,
    ) -> Result<Vec<RemoteSession>, Status> {
        Self::simulate_latency(self.create_latency).await;

        let mut state = self.lock_state();
        state.counts.create_batches += 1;
        if let Some(status) = state.take_fault(Operation::CreateSessions) {
            return Err(status);
        }

        let count = count + self.batch_surplus;
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            let name = format!(
                "projects/memory/instances/memory/databases/{}/sessions/{}",
                self.database,
                uuid::Uuid::new_v4().simple()
            );
            state.sessions.insert(
                name.clone(),
                ServerSession {
                    kind,
                    open_transactions: HashSet::new(),
                },
            );
            created.push(RemoteSession::new(name));
        }
        state.counts.sessions_created += created.len() as u64;

        Ok(created)
    }

    async fn delete_session(&self, session: &RemoteSession) -> Result<(), Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.deletes += 1;
        if let Some(status) = state.take_fault(Operation::DeleteSession) {
            return Err(status);
        }
        state
            .sessions
            .remove(session.name())
            .map(|_| ())
            .ok_or_else(|| Status::session_not_found(session.name()))
    }

    async fn ping_session(&self, session: &RemoteSession) -> Result<(), Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.pings += 1;
        state.session_mut(session)?;
        if let Some(status) = state.take_fault(Operation::PingSession) {
            return Err(status);
        }
        Ok(())
    }

    async fn begin_transaction(
        &self,
        session: &RemoteSession,
        _mode: TransactionMode,
    ) -> Result<TransactionId, Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.begins += 1;
        state.session_mut(session)?;
        if let Some(status) = state.take_fault(Operation::BeginTransaction) {
            return Err(status);
        }

        state.next_transaction += 1;
        let id = state.next_transaction.to_string();
        state
            .session_mut(session)?
            .open_transactions
            .insert(id.clone());
        Ok(TransactionId::new(id))
    }

    async fn execute_sql(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
        sql: &str,
    ) -> Result<ResultSet, Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.executes += 1;
        let active = state
            .session_mut(session)?
            .open_transactions
            .contains(transaction.as_str());
        if !active {
            return Err(Status::new(
                StatusCode::FailedPrecondition,
                format!("Transaction {} is not active", transaction.as_str()),
            ));
        }
        if let Some(status) = state.take_fault(Operation::ExecuteSql) {
            return Err(status);
        }
        Ok(state.results.get(sql).cloned().unwrap_or_default())
    }

    async fn commit(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.commits += 1;
        state.session_mut(session)?;
        if let Some(status) = state.take_fault(Operation::Commit) {
            // An aborted commit still ends the transaction server-side
            let _ = state.close_transaction(session, transaction);
            return Err(status);
        }
        state.close_transaction(session, transaction)
    }

    async fn rollback(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.rollbacks += 1;
        state.session_mut(session)?;
        if let Some(status) = state.take_fault(Operation::Rollback) {
            return Err(status);
        }
        state.close_transaction(session, transaction)
    }

    async fn end_transaction(
        &self,
        session: &RemoteSession,
        transaction: &TransactionId,
    ) -> Result<(), Status> {
        Self::simulate_latency(self.call_latency).await;

        let mut state = self.lock_state();
        state.counts.ends += 1;
        state.session_mut(session)?;
        if let Some(status) = state.take_fault(Operation::EndTransaction) {
            return Err(status);
        }
        state.close_transaction(session, transaction)
    }
}
