// ============================================================================
// Session Pool
// ============================================================================
//
// Bounded, self-growing pool of remote sessions shared by many callers.
//
// - acquire: idle fast path, otherwise enqueue (FIFO per kind) and trigger at
//   most one growth burst per kind
// - release: back to Idle and drain the wait queue, or destroy and replace
// - maintainer: keep-alive pings, idle eviction, refill to `min_sessions`,
//   read/write rebalancing
//
// All shared state sits in `PoolState` behind one mutex. Remote calls are
// made outside the lock, from spawned tasks or the maintainer.
//
// ============================================================================

pub mod config;
mod demand;
mod growth;
mod maintainer;
mod state;

pub use config::PoolConfig;

use crate::client::SessionClient;
use crate::core::{Error, Result, SessionKind};
use crate::session::Session;
use futures::future::join_all;
use log::{debug, info, warn};
use maintainer::Maintainer;
use serde::Serialize;
use state::PoolState;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// What the caller learned about a session while using it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Still usable; goes back to Idle
    Valid,
    /// Rejected by the service; destroyed and replaced
    Invalid,
    /// State unknown after a transport failure; pinged before reuse
    Suspect,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_sessions: usize,
    pub idle_read_only: usize,
    pub idle_read_write: usize,
    pub checked_out: usize,
    pub creating: usize,
    pub maintaining: usize,
    pub waiters: usize,
    pub longest_wait: Duration,
    pub min_sessions: usize,
    pub max_sessions: usize,
    pub write_fraction: f64,
    pub read_requests: u64,
    pub write_requests: u64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    pub create_bursts: u64,
    pub create_failures: u64,
    pub evicted: u64,
    pub invalidated: u64,
    pub pings: u64,
    pub ping_failures: u64,
    pub upgrades: u64,
    pub acquire_timeouts: u64,
    pub closed: bool,
}

impl PoolStats {
    pub fn idle(&self) -> usize {
        self.idle_read_only + self.idle_read_write
    }
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool Stats: {}/{} live ({} min), {} checked out, {} idle ({} ro / {} rw), {} creating, {} waiting, write fraction {:.2}",
            self.total_sessions,
            self.max_sessions,
            self.min_sessions,
            self.checked_out,
            self.idle(),
            self.idle_read_only,
            self.idle_read_write,
            self.creating,
            self.waiters,
            self.write_fraction
        )
    }
}

pub(crate) struct PoolInner {
    pub(crate) config: PoolConfig,
    pub(crate) client: Arc<dyn SessionClient>,
    state: Mutex<PoolState>,
    maintainer: Mutex<Option<Maintainer>>,
}

impl PoolInner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // Critical sections never leave the state half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release_session(self: &Arc<Self>, mut session: Session, outcome: ReleaseOutcome) {
        let now = Instant::now();
        let kind = session.kind();
        let mut plans = Vec::new();
        let mut doomed = None;
        let mut suspect = None;

        {
            let mut state = self.lock_state();
            if !state.check_in(session.id()) {
                warn!(
                    "Ignoring release of {} ({}): not checked out from this pool",
                    session.id(),
                    session.name()
                );
                return;
            }

            if state.closed {
                session.mark_destroyed();
                state.counters.sessions_destroyed += 1;
                doomed = Some(session);
            } else {
                match outcome {
                    ReleaseOutcome::Valid => {
                        session.touch(now);
                        state.insert_idle(session);
                        state.dispatch(self.config.allow_upgrade);
                    }
                    ReleaseOutcome::Invalid => {
                        session.mark_destroyed();
                        state.counters.invalidated += 1;
                        state.counters.sessions_destroyed += 1;
                        if let Some(count) = state.plan_replacement(kind, now, &self.config) {
                            plans.push((kind, count));
                        }
                        doomed = Some(session);
                    }
                    ReleaseOutcome::Suspect => {
                        session.touch(now);
                        state.maintaining += 1;
                        suspect = Some(session);
                    }
                }
            }
        }

        if let Some(session) = doomed {
            debug!("Destroying {} ({})", session.id(), session.name());
            self.spawn_delete(vec![session]);
        }
        if let Some(session) = suspect {
            let inner = Arc::clone(self);
            spawn_detached(async move { inner.revalidate(session).await });
        }
        self.spawn_growth(plans);
    }

    /// Best-effort remote deletion of destroyed sessions
    pub(crate) fn spawn_delete(self: &Arc<Self>, sessions: Vec<Session>) {
        if sessions.is_empty() {
            return;
        }
        let client = Arc::clone(&self.client);
        spawn_detached(async move {
            let results = join_all(sessions.iter().map(|s| client.delete_session(s.remote()))).await;
            for (session, result) in sessions.iter().zip(results) {
                if let Err(status) = result {
                    debug!("Failed to delete session {}: {}", session.name(), status);
                }
            }
        });
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.closed && !state.idle.is_empty() {
            debug!(
                "Session pool dropped without close(); {} idle sessions left to expire server-side",
                state.idle.len()
            );
        }
    }
}

/// Run background pool work on the current runtime, if there is one
pub(crate) fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => warn!("No tokio runtime available; dropping background session pool work"),
    }
}

/// Shared pool of sessions.
///
/// Cheap to clone; all clones refer to the same pool.
///
/// # Examples
///
/// ```
/// use sessionpool::client::MemorySessionClient;
/// use sessionpool::{PoolConfig, ReleaseOutcome, SessionKind, SessionPool};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> sessionpool::Result<()> {
/// let client = Arc::new(MemorySessionClient::new("orders"));
/// let pool = SessionPool::new(client, PoolConfig::new().min_sessions(0).max_sessions(4))?;
///
/// let session = pool.acquire(SessionKind::ReadOnly, None).await?;
/// pool.release(session, ReleaseOutcome::Valid);
/// assert_eq!(pool.size(), 1);
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    /// Create a pool and start its background maintainer.
    ///
    /// The pool starts empty and grows toward `min_sessions` in the
    /// background. Must be called from within a tokio runtime.
    pub fn new(client: Arc<dyn SessionClient>, config: PoolConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Config("SessionPool must be created inside a tokio runtime".into())
        })?;

        let inner = Arc::new(PoolInner {
            state: Mutex::new(PoolState::new(&config)),
            maintainer: Mutex::new(None),
            client,
            config,
        });

        let maintainer =
            maintainer::spawn_maintainer(Arc::downgrade(&inner), inner.config.maintenance_interval);
        *inner
            .maintainer
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(maintainer);

        let plans = inner
            .lock_state()
            .plan_fill_to_min(Instant::now(), &inner.config);
        inner.spawn_growth(plans);

        info!(
            "Session pool started: min={}, max={}, inc_step={}",
            inner.config.min_sessions, inner.config.max_sessions, inner.config.inc_step
        );

        Ok(Self { inner })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub(crate) fn client(&self) -> &Arc<dyn SessionClient> {
        &self.inner.client
    }

    /// Check out a session of `kind`.
    ///
    /// Waits at most `acquire_timeout`, and never past `deadline`, before
    /// failing with [`Error::PoolExhausted`]. Dropping the returned future
    /// withdraws the request without leaking a session.
    pub async fn acquire(&self, kind: SessionKind, deadline: Option<Instant>) -> Result<Session> {
        let started = Instant::now();
        let mut wait_until = started + self.inner.config.acquire_timeout;
        if let Some(deadline) = deadline {
            wait_until = wait_until.min(deadline);
        }

        let (waiter_id, slot, plans, displaced) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return Err(Error::PoolClosed);
            }

            state.demand.record(kind);
            if let Some(session) = state.try_check_out(kind, self.inner.config.allow_upgrade) {
                return Ok(session);
            }

            let (tx, rx) = oneshot::channel();
            let waiter_id = state.enqueue(kind, tx);

            let mut plans = Vec::new();
            let mut displaced = None;
            if let Some(count) = state.plan_growth(kind, started, &self.inner.config) {
                plans.push((kind, count));
            } else if kind == SessionKind::ReadWritePrepared {
                displaced = state.make_room_for_writer(started, &self.inner.config);
                if displaced.is_some() {
                    if let Some(count) = state.plan_growth(kind, started, &self.inner.config) {
                        plans.push((kind, count));
                    }
                }
            }

            (waiter_id, rx, plans, displaced)
        };

        if let Some(session) = displaced {
            debug!("Displacing idle reader {} to make room for a writer", session.id());
            self.inner.spawn_delete(vec![session]);
        }
        self.inner.spawn_growth(plans);

        WaitTicket {
            inner: &self.inner,
            waiter_id,
            slot,
            settled: false,
        }
        .wait(wait_until, started)
        .await
    }

    /// Hand a session back.
    ///
    /// Always drains the wait queue before returning. Must be called from
    /// within a tokio runtime when the outcome requires remote follow-up
    /// work (deleting, re-validating or replacing the session).
    pub fn release(&self, session: Session, outcome: ReleaseOutcome) {
        self.inner.release_session(session, outcome);
    }

    /// Number of live sessions, including those being created
    pub fn size(&self) -> usize {
        self.inner.lock_state().live()
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.lock_state().stats(&self.inner.config)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed
    }

    /// Run one maintainer pass now instead of waiting for the next tick
    pub async fn run_maintenance(&self) {
        self.inner.run_maintenance_tick().await;
    }

    /// Shut the pool down.
    ///
    /// Waiting callers fail with [`Error::PoolClosed`], idle sessions are
    /// deleted, and sessions still checked out are deleted when released.
    /// Calling `close` again is a no-op.
    pub async fn close(&self) {
        let (idle, rejected) = {
            let mut state = self.inner.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            let rejected = state.reject_waiters();
            let mut idle: Vec<Session> = state.idle.drain(..).collect();
            for session in idle.iter_mut() {
                session.mark_destroyed();
            }
            state.counters.sessions_destroyed += idle.len() as u64;
            (idle, rejected)
        };

        let maintainer = self
            .inner
            .maintainer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(maintainer) = maintainer {
            maintainer.stop().await;
        }

        let results = join_all(
            idle.iter()
                .map(|session| self.inner.client.delete_session(session.remote())),
        )
        .await;
        let failed = results.iter().filter(|r| r.is_err()).count();
        if failed > 0 {
            warn!("Failed to delete {} of {} sessions on close", failed, idle.len());
        }

        info!(
            "Session pool closed: {} sessions deleted, {} waiters rejected",
            idle.len() - failed,
            rejected
        );
    }
}

/// A queued acquire request.
///
/// Removes itself from the wait queue when abandoned, and returns a
/// session that raced in to the pool.
struct WaitTicket<'a> {
    inner: &'a Arc<PoolInner>,
    waiter_id: u64,
    slot: oneshot::Receiver<Session>,
    settled: bool,
}

impl WaitTicket<'_> {
    async fn wait(mut self, until: Instant, started: Instant) -> Result<Session> {
        let received = tokio::time::timeout_at(until, &mut self.slot).await;
        self.settled = true;

        match received {
            Ok(Ok(session)) => Ok(session),
            Ok(Err(_)) => Err(Error::PoolClosed),
            Err(_) => {
                if let Some(session) = self.abandon() {
                    return Ok(session);
                }
                self.inner.lock_state().counters.acquire_timeouts += 1;
                debug!(
                    "Acquire timed out after {:?} (waiter {})",
                    started.elapsed(),
                    self.waiter_id
                );
                Err(Error::PoolExhausted {
                    waited: started.elapsed(),
                })
            }
        }
    }

    fn abandon(&mut self) -> Option<Session> {
        self.inner.lock_state().remove_waiter(self.waiter_id);
        // Sessions are only sent under the state lock, so nothing can
        // arrive after this point
        self.slot.close();
        self.slot.try_recv().ok()
    }
}

impl Drop for WaitTicket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(session) = self.abandon() {
            self.inner.release_session(session, ReleaseOutcome::Valid);
        }
    }
}
