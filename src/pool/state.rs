// ============================================================================
// Pool State
// ============================================================================
//
// Everything the pool shares between callers lives here, behind the single
// mutex owned by `PoolInner`. Methods are synchronous and never call out to
// the service: they only decide what has to happen and hand the remote work
// back to the caller, which performs it after the lock is released.
//
// Live sessions = idle + checked out + being created + held by the maintainer.
//
// ============================================================================

use super::PoolStats;
use super::config::PoolConfig;
use super::demand::DemandTracker;
use crate::client::RemoteSession;
use crate::core::{SessionId, SessionKind, TransactionId};
use crate::session::Session;
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// A pending acquire request
pub(crate) struct Waiter {
    pub id: u64,
    pub kind: SessionKind,
    pub enqueued_at: Instant,
    pub slot: oneshot::Sender<Session>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PoolCounters {
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
}

/// Remote work produced by a rebalance pass
#[derive(Default)]
pub(crate) struct Rebalance {
    /// Sessions taken out of Idle to have a read-write transaction begun
    pub to_prepare: Vec<Session>,
    /// Prepared transactions dropped by demoted sessions
    pub to_rollback: Vec<(RemoteSession, TransactionId)>,
}

pub(crate) struct PoolState {
    pub closed: bool,
    /// Ordered by `last_used_at`: front is the least recently used
    pub idle: VecDeque<Session>,
    pub checked_out: HashMap<SessionId, SessionKind>,
    pub creating: [usize; 2],
    pub maintaining: usize,
    pub waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    pub demand: DemandTracker,
    /// Consecutive failed growth bursts
    pub create_failures: u32,
    pub create_retry_at: Option<Instant>,
    pub counters: PoolCounters,
}

impl PoolState {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            closed: false,
            idle: VecDeque::new(),
            checked_out: HashMap::new(),
            creating: [0, 0],
            maintaining: 0,
            waiters: VecDeque::new(),
            next_waiter_id: 1,
            demand: DemandTracker::new(config.write_sessions_fraction, config.demand_window),
            create_failures: 0,
            create_retry_at: None,
            counters: PoolCounters::default(),
        }
    }

    pub fn live(&self) -> usize {
        self.idle.len() + self.checked_out.len() + self.creating_total() + self.maintaining
    }

    pub fn creating_total(&self) -> usize {
        self.creating.iter().sum()
    }

    pub fn idle_of_kind(&self, kind: SessionKind) -> usize {
        self.idle.iter().filter(|s| s.kind() == kind).count()
    }

    /// Sessions of `kind` that are idle, checked out or on their way
    pub fn live_of_kind(&self, kind: SessionKind) -> usize {
        self.idle_of_kind(kind)
            + self.checked_out.values().filter(|k| **k == kind).count()
            + self.creating[kind.index()]
    }

    pub fn waiting(&self, kind: SessionKind) -> usize {
        self.waiters.iter().filter(|w| w.kind == kind).count()
    }

    // ------------------------------------------------------------------
    // Check-out / check-in
    // ------------------------------------------------------------------

    /// Best idle session for a request, most recently used first
    fn find_idle(&self, requested: SessionKind, allow_upgrade: bool) -> Option<usize> {
        let rposition = |pred: &dyn Fn(&Session) -> bool| {
            self.idle.iter().rposition(|session| pred(session))
        };

        match requested {
            // Readers take pre-warmed writers last
            SessionKind::ReadOnly => rposition(&|s| s.kind() == SessionKind::ReadOnly)
                .or_else(|| rposition(&|s| !s.is_prepared()))
                .or_else(|| rposition(&|_| true)),
            SessionKind::ReadWritePrepared => {
                rposition(&|s| s.kind() == SessionKind::ReadWritePrepared && s.is_prepared())
                    .or_else(|| rposition(&|s| s.kind() == SessionKind::ReadWritePrepared))
                    .or_else(|| {
                        if allow_upgrade {
                            rposition(&|s| s.kind() == SessionKind::ReadOnly)
                        } else {
                            None
                        }
                    })
            }
        }
    }

    fn check_out_at(&mut self, position: usize, requested: SessionKind) -> Option<Session> {
        let mut session = self.idle.remove(position)?;
        if requested == SessionKind::ReadWritePrepared && session.kind() == SessionKind::ReadOnly
        {
            session.upgrade();
            self.counters.upgrades += 1;
        }
        session.mark_checked_out();
        self.checked_out.insert(session.id(), session.kind());
        Some(session)
    }

    /// Fast path of `acquire`
    pub fn try_check_out(&mut self, requested: SessionKind, allow_upgrade: bool) -> Option<Session> {
        let position = self.find_idle(requested, allow_upgrade)?;
        self.check_out_at(position, requested)
    }

    /// Put a session into Idle, keeping the LRU order
    pub fn insert_idle(&mut self, mut session: Session) {
        session.mark_idle();
        let last_used = session.last_used_at();
        let position = self
            .idle
            .partition_point(|other| other.last_used_at() <= last_used);
        self.idle.insert(position, session);
    }

    /// Forget a checked-out session. `false` if it was not checked out from here.
    pub fn check_in(&mut self, id: SessionId) -> bool {
        self.checked_out.remove(&id).is_some()
    }

    // ------------------------------------------------------------------
    // Wait queue
    // ------------------------------------------------------------------

    pub fn enqueue(&mut self, kind: SessionKind, slot: oneshot::Sender<Session>) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        self.waiters.push_back(Waiter {
            id,
            kind,
            enqueued_at: Instant::now(),
            slot,
        });
        id
    }

    /// Remove a waiter that gave up. `false` if it was already fulfilled.
    pub fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(position) => {
                self.waiters.remove(position);
                true
            }
            None => false,
        }
    }

    /// Hand idle sessions to waiters in arrival order.
    ///
    /// A waiter that finds no compatible session is skipped, which never
    /// reorders waiters of the same kind: they all share the same
    /// compatibility. Returns the number of waiters served.
    pub fn dispatch(&mut self, allow_upgrade: bool) -> usize {
        let mut served = 0;
        let mut index = 0;

        while index < self.waiters.len() && !self.idle.is_empty() {
            if self.waiters[index].slot.is_closed() {
                self.waiters.remove(index);
                continue;
            }

            let kind = self.waiters[index].kind;
            let Some(position) = self.find_idle(kind, allow_upgrade) else {
                index += 1;
                continue;
            };
            let Some(waiter) = self.waiters.remove(index) else {
                break;
            };
            let Some(session) = self.check_out_at(position, kind) else {
                break;
            };

            match waiter.slot.send(session) {
                Ok(()) => served += 1,
                Err(session) => {
                    // Receiver went away between the check and the send
                    self.check_in(session.id());
                    self.insert_idle(session);
                }
            }
        }

        served
    }

    /// Drop all waiters; their receivers observe the pool closing
    pub fn reject_waiters(&mut self) -> usize {
        let count = self.waiters.len();
        self.waiters.clear();
        count
    }

    // ------------------------------------------------------------------
    // Growth planning
    // ------------------------------------------------------------------

    fn growth_allowed(&self, kind: SessionKind, now: Instant) -> bool {
        if self.closed || self.creating[kind.index()] > 0 {
            return false;
        }
        !matches!(self.create_retry_at, Some(retry_at) if retry_at > now)
    }

    /// Reserve a burst of up to `wanted` sessions of `kind`.
    ///
    /// At most one burst per kind is in flight; the reservation counts as
    /// live immediately so concurrent planners never overshoot `max`.
    fn reserve(&mut self, kind: SessionKind, wanted: usize, now: Instant, config: &PoolConfig) -> Option<usize> {
        if !self.growth_allowed(kind, now) {
            return None;
        }
        let room = config.max_sessions.saturating_sub(self.live());
        let count = wanted.min(config.inc_step).min(room);
        if count == 0 {
            return None;
        }
        self.creating[kind.index()] += count;
        self.counters.create_bursts += 1;
        Some(count)
    }

    /// Demand-driven burst after a cache miss in `acquire`
    pub fn plan_growth(&mut self, kind: SessionKind, now: Instant, config: &PoolConfig) -> Option<usize> {
        self.reserve(kind, config.inc_step, now, config)
    }

    /// Single replacement for a destroyed session, if anyone still needs it
    pub fn plan_replacement(&mut self, kind: SessionKind, now: Instant, config: &PoolConfig) -> Option<usize> {
        if self.live() >= config.min_sessions && self.waiters.is_empty() {
            return None;
        }
        self.reserve(kind, 1, now, config)
    }

    /// Next bursts for kinds that still have callers waiting
    pub fn plan_for_waiters(&mut self, now: Instant, config: &PoolConfig) -> Vec<(SessionKind, usize)> {
        let mut planned = Vec::new();
        for kind in SessionKind::ALL {
            if self.waiting(kind) == 0 {
                continue;
            }
            if let Some(count) = self.plan_growth(kind, now, config) {
                planned.push((kind, count));
            }
        }
        planned
    }

    /// Bursts that bring the pool back to `min_sessions`, split by write demand
    pub fn plan_fill_to_min(&mut self, now: Instant, config: &PoolConfig) -> Vec<(SessionKind, usize)> {
        let deficit = config.min_sessions.saturating_sub(self.live());
        if deficit == 0 {
            return Vec::new();
        }

        let write_target = self.demand.write_target(config.min_sessions);
        let writes = write_target
            .saturating_sub(self.live_of_kind(SessionKind::ReadWritePrepared))
            .min(deficit);
        let reads = deficit - writes;

        [
            (SessionKind::ReadWritePrepared, writes),
            (SessionKind::ReadOnly, reads),
        ]
        .into_iter()
        .filter(|(_, wanted)| *wanted > 0)
        .filter_map(|(kind, wanted)| self.reserve(kind, wanted, now, config).map(|count| (kind, count)))
        .collect()
    }

    /// Everything still owed after a burst ends: the fill to `min_sessions`
    /// plus bursts for kinds with callers waiting
    pub fn plan_follow_up(&mut self, now: Instant, config: &PoolConfig) -> Vec<(SessionKind, usize)> {
        let mut plans = self.plan_fill_to_min(now, config);
        plans.extend(self.plan_for_waiters(now, config));
        plans
    }

    /// Growth is still owed to someone: the pool is below `min_sessions`
    /// or callers are waiting
    pub fn needs_growth(&self, config: &PoolConfig) -> bool {
        !self.closed && (self.live() < config.min_sessions || !self.waiters.is_empty())
    }

    /// When the pool is full of read-only sessions and a writer may not
    /// upgrade, give up the least recently used idle reader so a
    /// read-write session can be created in its place.
    pub fn make_room_for_writer(&mut self, now: Instant, config: &PoolConfig) -> Option<Session> {
        if config.allow_upgrade || self.live() < config.max_sessions {
            return None;
        }
        if !self.growth_allowed(SessionKind::ReadWritePrepared, now) {
            return None;
        }
        let position = self
            .idle
            .iter()
            .position(|s| s.kind() == SessionKind::ReadOnly)?;
        let mut session = self.idle.remove(position)?;
        session.mark_destroyed();
        self.counters.evicted += 1;
        self.counters.sessions_destroyed += 1;
        Some(session)
    }

    /// Register the outcome of a successful burst.
    ///
    /// Returns the sessions that must be deleted again because the pool
    /// closed while they were being created.
    pub fn complete_growth(
        &mut self,
        kind: SessionKind,
        reserved: usize,
        sessions: Vec<Session>,
        now: Instant,
        allow_upgrade: bool,
    ) -> Vec<Session> {
        let slot = &mut self.creating[kind.index()];
        *slot = slot.saturating_sub(reserved);
        self.create_failures = 0;
        self.create_retry_at = None;

        if self.closed {
            return sessions;
        }

        self.counters.sessions_created += sessions.len() as u64;
        for mut session in sessions {
            session.touch(now);
            self.insert_idle(session);
        }
        self.dispatch(allow_upgrade);
        Vec::new()
    }

    /// Register a failed burst and back off further growth
    pub fn fail_growth(&mut self, kind: SessionKind, reserved: usize, now: Instant, config: &PoolConfig) {
        let slot = &mut self.creating[kind.index()];
        *slot = slot.saturating_sub(reserved);
        self.create_failures = self.create_failures.saturating_add(1);
        self.counters.create_failures += 1;
        self.create_retry_at = Some(now + config.create_backoff_after(self.create_failures));
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Idle sessions unused for longer than `max_idle`, oldest first, while
    /// the pool stays at or above `min_sessions`.
    pub fn take_evictable(&mut self, now: Instant, config: &PoolConfig) -> Vec<Session> {
        let mut evicted = Vec::new();
        while self.live() > config.min_sessions {
            match self.idle.front() {
                Some(oldest) if oldest.idle_for(now) > config.max_idle => {}
                _ => break,
            }
            let Some(mut session) = self.idle.pop_front() else {
                break;
            };
            session.mark_destroyed();
            self.counters.evicted += 1;
            self.counters.sessions_destroyed += 1;
            evicted.push(session);
        }
        evicted
    }

    /// Idle sessions the service has not heard from for a keep-alive
    /// interval. They stay live but are held by the maintainer.
    pub fn take_for_keep_alive(&mut self, now: Instant, config: &PoolConfig) -> Vec<Session> {
        let (quiet, fresh): (Vec<Session>, Vec<Session>) = self
            .idle
            .drain(..)
            .partition(|s| s.quiet_for(now) >= config.keep_alive_interval);
        self.idle = fresh.into();
        self.maintaining += quiet.len();
        quiet
    }

    /// Move idle sessions between kinds toward the demanded write share.
    pub fn take_for_rebalance(&mut self) -> Rebalance {
        let mut rebalance = Rebalance::default();
        let live = self.live();
        let target = self.demand.write_target(live);
        let writers = self.live_of_kind(SessionKind::ReadWritePrepared);

        // Writers whose prepared transaction was consumed
        let mut index = 0;
        while index < self.idle.len() {
            let session = &self.idle[index];
            if session.kind() == SessionKind::ReadWritePrepared && !session.is_prepared() {
                if let Some(session) = self.idle.remove(index) {
                    rebalance.to_prepare.push(session);
                }
                continue;
            }
            index += 1;
        }

        if writers < target {
            let mut missing = target - writers;
            let mut index = 0;
            while missing > 0 && index < self.idle.len() {
                if self.idle[index].kind() == SessionKind::ReadOnly {
                    if let Some(session) = self.idle.remove(index) {
                        rebalance.to_prepare.push(session);
                        missing -= 1;
                    }
                    continue;
                }
                index += 1;
            }
        } else if writers > target && self.waiting(SessionKind::ReadWritePrepared) == 0 {
            let mut surplus = writers - target;
            for session in self.idle.iter_mut() {
                if surplus == 0 {
                    break;
                }
                if session.kind() != SessionKind::ReadWritePrepared {
                    continue;
                }
                if let Some(transaction) = session.demote() {
                    rebalance
                        .to_rollback
                        .push((session.remote().clone(), transaction));
                }
                surplus -= 1;
            }
        }

        self.maintaining += rebalance.to_prepare.len();
        rebalance
    }

    /// A session held by the maintainer goes back to Idle.
    ///
    /// Hands the session back when the pool closed in the meantime; the
    /// caller deletes it.
    pub fn return_from_maintenance(&mut self, mut session: Session) -> Option<Session> {
        self.maintaining = self.maintaining.saturating_sub(1);
        if self.closed {
            session.mark_destroyed();
            self.counters.sessions_destroyed += 1;
            return Some(session);
        }
        self.insert_idle(session);
        None
    }

    /// A session held by the maintainer turned out to be dead
    pub fn drop_from_maintenance(&mut self) {
        self.maintaining = self.maintaining.saturating_sub(1);
        self.counters.sessions_destroyed += 1;
    }

    pub fn stats(&self, config: &PoolConfig) -> PoolStats {
        PoolStats {
            total_sessions: self.live(),
            idle_read_only: self.idle_of_kind(SessionKind::ReadOnly),
            idle_read_write: self.idle_of_kind(SessionKind::ReadWritePrepared),
            checked_out: self.checked_out.len(),
            creating: self.creating_total(),
            maintaining: self.maintaining,
            waiters: self.waiters.len(),
            longest_wait: self
                .waiters
                .front()
                .map(|w| w.enqueued_at.elapsed())
                .unwrap_or_default(),
            min_sessions: config.min_sessions,
            max_sessions: config.max_sessions,
            write_fraction: self.demand.write_fraction(),
            read_requests: self.demand.observed(SessionKind::ReadOnly),
            write_requests: self.demand.observed(SessionKind::ReadWritePrepared),
            sessions_created: self.counters.sessions_created,
            sessions_destroyed: self.counters.sessions_destroyed,
            create_bursts: self.counters.create_bursts,
            create_failures: self.counters.create_failures,
            evicted: self.counters.evicted,
            invalidated: self.counters.invalidated,
            pings: self.counters.pings,
            ping_failures: self.counters.ping_failures,
            upgrades: self.counters.upgrades,
            acquire_timeouts: self.counters.acquire_timeouts,
            closed: self.closed,
        }
    }
}
