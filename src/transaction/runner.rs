// ============================================================================
// Transaction Runner
// ============================================================================
//
// acquire -> begin (or reuse the prepared transaction) -> body -> commit/end
// -> release, repeated with backoff while attempts fail with a retryable
// class and the deadline allows it.
//
// ============================================================================

use super::handle::{Transaction, within_deadline};
use super::retry::RetryPolicy;
use crate::client::{SessionClient, StatusCode};
use crate::core::{Error, ErrorClass, Result, SessionKind, TransactionId, TransactionMode};
use crate::pool::{ReleaseOutcome, SessionPool};
use crate::session::Session;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{Instrument, Level, event, info_span};

/// Runs transaction bodies against pooled sessions and retries them
/// transparently on aborts and lost sessions.
#[derive(Clone)]
pub struct TransactionRunner {
    pool: SessionPool,
    policy: RetryPolicy,
    default_timeout: Duration,
}

impl TransactionRunner {
    /// Runner with the pool's retry policy and transaction deadline
    pub fn new(pool: SessionPool) -> Self {
        let policy = pool.config().retry.clone();
        let default_timeout = pool.config().transaction_deadline;
        Self {
            pool,
            policy,
            default_timeout,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    /// Run `body` in a transaction of `kind`, retrying until it commits,
    /// fails with a non-retryable error or `timeout` runs out.
    ///
    /// # Re-execution
    ///
    /// `body` may run several times, each time against a fresh
    /// [`Transaction`]. Only effects made through that handle are undone by a
    /// retry; anything else the body does (sending messages, bumping local
    /// counters) happens once per attempt. Keep bodies free of such side
    /// effects or make them idempotent.
    ///
    /// # Errors
    ///
    /// - a non-retryable error from the body or the service, verbatim
    /// - [`Error::DeadlineExceeded`] carrying the last retryable cause, no
    ///   earlier than the deadline
    /// - [`Error::PoolExhausted`] or [`Error::PoolClosed`] from the pool
    ///
    /// # Cancellation
    ///
    /// Dropping the returned future stops at the current await point. An
    /// open transaction is rolled back and the session is returned to the
    /// pool in the background.
    pub async fn run<T, F, Fut>(
        &self,
        kind: SessionKind,
        timeout: Option<Duration>,
        mut body: F,
    ) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let started = Instant::now();
        let deadline = started + timeout.unwrap_or(self.default_timeout);
        let mut backoff = self.policy.backoff();
        let mut last_retryable: Option<Error> = None;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let span = info_span!("transaction.attempt", kind = %kind, attempt = attempts);
            let err = match self
                .attempt(kind, deadline, attempts, &mut body)
                .instrument(span)
                .await
            {
                Ok(value) => {
                    if attempts > 1 {
                        event!(Level::DEBUG, attempts, "transaction committed after retries");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            let class = if err.is_pool_exhausted() && Instant::now() >= deadline {
                ErrorClass::DeadlineExceeded
            } else {
                err.class()
            };

            let delay = match class {
                ErrorClass::Fatal => {
                    event!(Level::DEBUG, error = %err, attempts, "transaction failed");
                    return Err(err);
                }
                ErrorClass::DeadlineExceeded => {
                    event!(Level::WARN, error = %err, attempts, "transaction deadline exceeded");
                    return Err(Error::DeadlineExceeded {
                        elapsed: started.elapsed(),
                        attempts,
                        last_cause: Some(Box::new(last_retryable.unwrap_or(err))),
                    });
                }
                ErrorClass::InvalidSession => Duration::ZERO,
                ErrorClass::Abort => backoff.next_delay(err.retry_delay()),
            };

            if Instant::now() + delay >= deadline {
                tokio::time::sleep_until(deadline).await;
                event!(
                    Level::WARN,
                    error = %err,
                    attempts,
                    "transaction deadline exceeded while retrying"
                );
                return Err(Error::DeadlineExceeded {
                    elapsed: started.elapsed(),
                    attempts,
                    last_cause: Some(Box::new(err)),
                });
            }

            event!(
                Level::DEBUG,
                error = %err,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying transaction"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            last_retryable = Some(err);
        }
    }

    async fn attempt<T, F, Fut>(
        &self,
        kind: SessionKind,
        deadline: Instant,
        attempt: u32,
        body: &mut F,
    ) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut session = self.pool.acquire(kind, Some(deadline)).await?;
        let client = Arc::clone(self.pool.client());
        let mode = kind.transaction_mode();
        let remote = session.remote().clone();
        event!(Level::DEBUG, session = %remote, "session acquired");

        // A read-only transaction supersedes the prepared one, which is rolled back
        let prepared = session.take_prepared_transaction();
        let mut lease = SessionLease::new(&self.pool, session);
        let id = match (mode, prepared) {
            (TransactionMode::ReadWrite, Some(id)) => id,
            (_, superseded) => {
                if let Some(prepared) = superseded {
                    lease.opened(prepared.clone(), TransactionMode::ReadWrite);
                    if let Err(status) =
                        within_deadline(deadline, client.rollback(&remote, &prepared)).await
                    {
                        event!(Level::DEBUG, error = %status, "rolling back prepared transaction failed");
                    }
                    lease.closed();
                }
                match within_deadline(deadline, client.begin_transaction(&remote, mode)).await {
                    Ok(id) => id,
                    Err(status) => {
                        let err = Error::from(status);
                        lease.release(release_outcome(&err));
                        return Err(err);
                    }
                }
            }
        };
        lease.opened(id.clone(), mode);

        let transaction = Transaction::new(
            Arc::clone(&client),
            remote.clone(),
            id.clone(),
            mode,
            deadline,
            attempt,
        );

        match body(transaction).await {
            Ok(value) => {
                let finished = match mode {
                    TransactionMode::ReadWrite => {
                        within_deadline(deadline, client.commit(&remote, &id)).await
                    }
                    TransactionMode::ReadOnly => {
                        within_deadline(deadline, client.end_transaction(&remote, &id)).await
                    }
                };
                lease.closed();

                match finished {
                    Ok(()) => {
                        lease.release(ReleaseOutcome::Valid);
                        Ok(value)
                    }
                    Err(status) if mode == TransactionMode::ReadOnly => {
                        // The reads already succeeded
                        let err = Error::from(status);
                        event!(Level::DEBUG, error = %err, "ending read-only transaction failed");
                        lease.release(release_outcome(&err));
                        Ok(value)
                    }
                    Err(status) => {
                        let err = Error::from(status);
                        lease.release(release_outcome(&err));
                        Err(err)
                    }
                }
            }
            Err(app_err) => {
                let err = into_error(app_err);
                let class = err.class();
                if class != ErrorClass::InvalidSession && Instant::now() < deadline {
                    let closing = match mode {
                        TransactionMode::ReadWrite => {
                            within_deadline(deadline, client.rollback(&remote, &id)).await
                        }
                        TransactionMode::ReadOnly => {
                            within_deadline(deadline, client.end_transaction(&remote, &id)).await
                        }
                    };
                    if let Err(status) = closing {
                        event!(Level::DEBUG, error = %status, "best-effort rollback failed");
                    }
                }
                lease.closed();
                lease.release(release_outcome(&err));
                Err(err)
            }
        }
    }
}

/// Unwrap crate errors the body propagated through `anyhow`
fn into_error(err: anyhow::Error) -> Error {
    match err.downcast::<Error>() {
        Ok(err) => err,
        Err(err) => Error::Application(err),
    }
}

/// How a session goes back to the pool after an attempt failed with `err`
pub(crate) fn release_outcome(err: &Error) -> ReleaseOutcome {
    if err.class() == ErrorClass::InvalidSession {
        return ReleaseOutcome::Invalid;
    }
    match err.status() {
        Some(status) if status.code == StatusCode::DeadlineExceeded => ReleaseOutcome::Suspect,
        Some(status) if status.is_transport_failure() => ReleaseOutcome::Suspect,
        _ => ReleaseOutcome::Valid,
    }
}

/// Checked-out session of one attempt.
///
/// Returns the session to the pool when dropped, after rolling back a
/// transaction the attempt left open.
struct SessionLease<'a> {
    pool: &'a SessionPool,
    session: Option<Session>,
    open: Option<(TransactionId, TransactionMode)>,
}

impl<'a> SessionLease<'a> {
    fn new(pool: &'a SessionPool, session: Session) -> Self {
        Self {
            pool,
            session: Some(session),
            open: None,
        }
    }

    fn opened(&mut self, id: TransactionId, mode: TransactionMode) {
        self.open = Some((id, mode));
    }

    fn closed(&mut self) {
        self.open = None;
    }

    fn release(mut self, outcome: ReleaseOutcome) {
        self.open = None;
        if let Some(session) = self.session.take() {
            self.pool.release(session, outcome);
        }
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let Some((id, mode)) = self.open.take() else {
            self.pool.release(session, ReleaseOutcome::Valid);
            return;
        };

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            self.pool.release(session, ReleaseOutcome::Valid);
            return;
        };
        let pool = self.pool.clone();
        let client: Arc<dyn SessionClient> = Arc::clone(pool.client());
        handle.spawn(async move {
            let closing = match mode {
                TransactionMode::ReadWrite => client.rollback(session.remote(), &id).await,
                TransactionMode::ReadOnly => client.end_transaction(session.remote(), &id).await,
            };
            let outcome = match closing {
                Ok(()) => ReleaseOutcome::Valid,
                Err(status) => release_outcome(&Error::from(status)),
            };
            pool.release(session, outcome);
        });
    }
}
