use super::{PoolInner, spawn_detached};
use crate::client::Status;
use crate::core::{SessionKind, TransactionMode};
use crate::session::Session;
use futures::future::join_all;
use log::{debug, warn};
use std::sync::Arc;
use tokio::time::Instant;

impl PoolInner {
    /// Start one background burst per planned `(kind, count)` reservation
    pub(crate) fn spawn_growth(self: &Arc<Self>, plans: Vec<(SessionKind, usize)>) {
        for (kind, reserved) in plans {
            let inner = Arc::clone(self);
            spawn_detached(async move { inner.grow(kind, reserved).await });
        }
    }

    async fn grow(self: Arc<Self>, kind: SessionKind, reserved: usize) {
        debug!("Creating {} {} sessions", reserved, kind);

        let remotes = match self.client.batch_create_sessions(kind, reserved).await {
            Ok(remotes) => remotes,
            Err(status) => {
                let (failures, retry_at, owed) = {
                    let mut state = self.lock_state();
                    state.fail_growth(kind, reserved, Instant::now(), &self.config);
                    (state.create_failures, state.create_retry_at, state.needs_growth(&self.config))
                };
                warn!(
                    "Failed to create {} {} sessions ({} consecutive failures): {}",
                    reserved, kind, failures, status
                );
                if let (true, Some(retry_at)) = (owed, retry_at) {
                    self.retry_growth_at(retry_at);
                }
                return;
            }
        };

        let mut sessions: Vec<Session> = remotes
            .into_iter()
            .map(|remote| Session::new(remote, kind))
            .collect();

        let mut dead = Vec::new();
        if sessions.len() > reserved {
            debug!(
                "Service returned {} sessions for a burst of {}; deleting the surplus",
                sessions.len(),
                reserved
            );
            dead.extend(sessions.drain(reserved..).map(|mut session| {
                session.mark_destroyed();
                session
            }));
        }
        if kind == SessionKind::ReadWritePrepared {
            let prepared = join_all(sessions.into_iter().map(|s| self.prepare(s))).await;
            sessions = Vec::with_capacity(prepared.len());
            for (mut session, failure) in prepared {
                match failure {
                    Some(status) if status.is_session_not_found() => {
                        session.mark_destroyed();
                        dead.push(session);
                    }
                    Some(status) => {
                        debug!(
                            "Could not prepare {} ({}), keeping it read-only: {}",
                            session.id(),
                            session.name(),
                            status
                        );
                        session.demote();
                        sessions.push(session);
                    }
                    None => sessions.push(session),
                }
            }
        }

        let created = sessions.len();
        let (leftovers, follow_up) = {
            let mut state = self.lock_state();
            let now = Instant::now();
            let leftovers =
                state.complete_growth(kind, reserved, sessions, now, self.config.allow_upgrade);
            state.counters.sessions_destroyed += leftovers.len() as u64;
            let follow_up = state.plan_follow_up(now, &self.config);
            (leftovers, follow_up)
        };

        if leftovers.is_empty() {
            debug!("Created {} {} sessions", created, kind);
        } else {
            debug!(
                "Pool closed while creating sessions; deleting {} new sessions",
                leftovers.len()
            );
        }

        dead.extend(leftovers.into_iter().map(|mut session| {
            session.mark_destroyed();
            session
        }));
        self.spawn_delete(dead);
        self.spawn_growth(follow_up);
    }

    /// Plan the growth still owed once the create backoff ends
    fn retry_growth_at(self: &Arc<Self>, retry_at: Instant) {
        let inner = Arc::clone(self);
        spawn_detached(async move {
            tokio::time::sleep_until(retry_at).await;
            let plans = inner
                .lock_state()
                .plan_follow_up(Instant::now(), &inner.config);
            inner.spawn_growth(plans);
        });
    }

    /// Begin a read-write transaction ahead of time
    pub(crate) async fn prepare(&self, mut session: Session) -> (Session, Option<Status>) {
        match self
            .client
            .begin_transaction(session.remote(), TransactionMode::ReadWrite)
            .await
        {
            Ok(transaction) => {
                session.set_prepared(transaction);
                (session, None)
            }
            Err(status) => (session, Some(status)),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::client::{MemorySessionClient, Operation, Status, StatusCode};
    use crate::core::SessionKind;
    use crate::pool::{PoolConfig, ReleaseOutcome, SessionPool};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_write_sessions_are_prepared() {
        let client = Arc::new(MemorySessionClient::new("growth"));
        let pool = SessionPool::new(
            client.clone(),
            PoolConfig::new().min_sessions(0).max_sessions(2).inc_step(1),
        )
        .unwrap();

        let session = pool
            .acquire(SessionKind::ReadWritePrepared, None)
            .await
            .unwrap();
        assert!(session.is_prepared());
        assert_eq!(client.counts().begins, 1);

        pool.release(session, ReleaseOutcome::Valid);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_burst_backs_off_then_retries_for_waiters() {
        let client = Arc::new(MemorySessionClient::new("growth"));
        client.fail_next(
            Operation::CreateSessions,
            Status::new(StatusCode::Unavailable, "backend down"),
        );

        let pool = SessionPool::new(
            client.clone(),
            PoolConfig::new()
                .min_sessions(0)
                .max_sessions(2)
                .inc_step(1)
                .create_backoff(Duration::from_millis(100), Duration::from_secs(1))
                .acquire_timeout(Duration::from_secs(5)),
        )
        .unwrap();

        let acquire = tokio::spawn({
            let pool = pool.clone();
            async move { pool.acquire(SessionKind::ReadOnly, None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.stats().create_failures, 1);
        assert_eq!(pool.size(), 0);

        let started = Instant::now();
        let session = acquire.await.unwrap().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(80));
        assert_eq!(client.counts().create_batches, 2);
        pool.release(session, ReleaseOutcome::Valid);
    }
}
