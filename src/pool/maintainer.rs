// ============================================================================
// Pool Maintainer
// ============================================================================
//
// Periodic background pass over the idle sessions:
//
// - evict sessions idle longer than `max_idle` (never below `min_sessions`)
// - ping sessions the service has not heard from for `keep_alive_interval`
// - refill to `min_sessions` and retry growth for waiting callers
// - move idle sessions between kinds toward the demanded write share
//
// The task only holds a `Weak` reference between ticks, so dropping the
// last `SessionPool` handle also ends the maintainer.
//
// ============================================================================

use super::PoolInner;
use crate::client::Status;
use crate::session::Session;
use futures::future::join_all;
use log::{debug, info, warn};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};

/// Handle of the background maintenance task.
pub(crate) struct Maintainer {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl Maintainer {
    /// Signals the task to stop and waits for the running tick to finish.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            if let Err(err) = join_handle.await {
                if !err.is_cancelled() {
                    warn!("Session pool maintainer ended abnormally: {}", err);
                }
            }
        }
    }
}

impl Drop for Maintainer {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

pub(crate) fn spawn_maintainer(pool: Weak<PoolInner>, interval: Duration) -> Maintainer {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    let Some(inner) = pool.upgrade() else {
                        break;
                    };
                    inner.run_maintenance_tick().await;
                }
            }
        }
        debug!("Session pool maintainer stopped");
    });

    Maintainer {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

/// Result of a liveness check on a session held by the maintainer
enum Checked {
    Alive(Session),
    Dead(Session, Status),
}

impl PoolInner {
    pub(crate) async fn run_maintenance_tick(self: &Arc<Self>) {
        let now = Instant::now();
        let (evicted, quiet, rebalance, plans) = {
            let mut state = self.lock_state();
            if state.closed {
                return;
            }
            let evicted = state.take_evictable(now, &self.config);
            let quiet = state.take_for_keep_alive(now, &self.config);
            let rebalance = state.take_for_rebalance();
            let plans = state.plan_follow_up(now, &self.config);
            (evicted, quiet, rebalance, plans)
        };

        if !evicted.is_empty() {
            info!("Evicting {} sessions idle for more than {:?}", evicted.len(), self.config.max_idle);
        }
        self.spawn_delete(evicted);
        self.spawn_growth(plans);

        let pings = join_all(quiet.into_iter().map(|session| self.ping(session)));
        let prepares = join_all(rebalance.to_prepare.into_iter().map(|session| self.prepare(session)));
        let rollbacks = join_all(
            rebalance
                .to_rollback
                .iter()
                .map(|(remote, transaction)| self.client.rollback(remote, transaction)),
        );
        let (pinged, prepared, rolled_back) = futures::join!(pings, prepares, rollbacks);

        for result in rolled_back {
            if let Err(status) = result {
                debug!("Failed to roll back prepared transaction of demoted session: {}", status);
            }
        }

        let ping_failures = pinged
            .iter()
            .filter(|checked| matches!(checked, Checked::Dead(..)))
            .count();
        {
            let mut state = self.lock_state();
            state.counters.pings += pinged.len() as u64;
            state.counters.ping_failures += ping_failures as u64;
        }
        if ping_failures > 0 {
            warn!("{} of {} keep-alive pings failed", ping_failures, pinged.len());
        }

        let prepared = prepared.into_iter().map(|(session, failure)| match failure {
            Some(status) if status.is_session_not_found() => Checked::Dead(session, status),
            Some(status) => {
                debug!("Could not prepare {}: {}", session.id(), status);
                Checked::Alive(session)
            }
            None => Checked::Alive(session),
        });

        self.settle(pinged.into_iter().chain(prepared).collect());
    }

    /// Ping a session released as Suspect before it may be reused
    pub(crate) async fn revalidate(self: Arc<Self>, session: Session) {
        let checked = self.ping(session).await;
        {
            let mut state = self.lock_state();
            state.counters.pings += 1;
            if matches!(checked, Checked::Dead(..)) {
                state.counters.ping_failures += 1;
                state.counters.invalidated += 1;
            }
        }
        self.settle(vec![checked]);
    }

    async fn ping(&self, session: Session) -> Checked {
        match self.client.ping_session(session.remote()).await {
            Ok(()) => Checked::Alive(session),
            Err(status) => Checked::Dead(session, status),
        }
    }

    /// Hand maintained sessions back to Idle, or destroy and replace them
    fn settle(self: &Arc<Self>, checked: Vec<Checked>) {
        if checked.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut doomed = Vec::new();
        let mut plans = Vec::new();
        {
            let mut state = self.lock_state();
            for outcome in checked {
                match outcome {
                    Checked::Alive(mut session) => {
                        session.mark_checked(now);
                        doomed.extend(state.return_from_maintenance(session));
                    }
                    Checked::Dead(mut session, status) => {
                        debug!("Destroying {} ({}): {}", session.id(), session.name(), status);
                        let kind = session.kind();
                        session.mark_destroyed();
                        state.drop_from_maintenance();
                        if let Some(count) = state.plan_replacement(kind, now, &self.config) {
                            plans.push((kind, count));
                        }
                        doomed.push(session);
                    }
                }
            }
            state.dispatch(self.config.allow_upgrade);
        }

        self.spawn_delete(doomed);
        self.spawn_growth(plans);
    }
}
