// ============================================================================
// sessionpool Library
// ============================================================================
//
// Client-side session pool and transaction retry engine for a remote
// transactional database.
//
// - pool: bounded, self-growing pool of sessions with a background maintainer
// - transaction: runs transaction bodies with transparent retry on aborts
// - client: the `SessionClient` seam to the service, plus an in-memory stand-in
//
// ============================================================================

pub mod client;
pub mod core;
pub mod pool;
pub mod prelude;
pub mod session;
pub mod transaction;

// Re-export main types for convenience
pub use client::{RemoteSession, ResultSet, SessionClient, Status, StatusCode};
pub use core::{Error, ErrorClass, Result, SessionId, SessionKind, TransactionId, TransactionMode};
pub use pool::{PoolConfig, PoolStats, ReleaseOutcome, SessionPool};
pub use session::{Session, SessionState};
pub use transaction::{RetryPolicy, Transaction, TransactionRunner};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// High-level Client API
// ============================================================================

/// Database handle with session pooling and transparent transaction retry.
///
/// This is the recommended way to use the crate in applications.
///
/// # Examples
///
/// ```
/// use sessionpool::client::MemorySessionClient;
/// use sessionpool::{Database, PoolConfig};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> sessionpool::Result<()> {
/// let client = Arc::new(MemorySessionClient::new("orders"));
/// let db = Database::open(client, PoolConfig::new().min_sessions(1).max_sessions(4))?;
///
/// let affected = db
///     .read_write(|txn| async move {
///         let affected = txn.execute_update("UPDATE orders SET state = 'PAID' WHERE id = 7").await?;
///         Ok(affected)
///     })
///     .await?;
/// assert_eq!(affected, 0);
///
/// db.close().await;
/// # Ok(())
/// # }
/// ```
pub struct Database {
    pool: SessionPool,
    runner: TransactionRunner,
}

impl Database {
    /// Open a database over `client`.
    ///
    /// Starts the session pool, which fills up to `min_sessions` in the
    /// background. Must be called from within a tokio runtime.
    pub fn open(client: Arc<dyn SessionClient>, config: PoolConfig) -> Result<Self> {
        let pool = SessionPool::new(client, config)?;
        let runner = TransactionRunner::new(pool.clone());
        Ok(Self { pool, runner })
    }

    /// Run `body` in a transaction of `kind`, bounded by `timeout` (the
    /// pool's `transaction_deadline` when `None`).
    ///
    /// See [`TransactionRunner::run`] for the retry and re-execution contract.
    pub async fn run_transaction<T, F, Fut>(
        &self,
        kind: SessionKind,
        timeout: Option<Duration>,
        body: F,
    ) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.runner.run(kind, timeout, body).await
    }

    /// Read-write transaction with the default deadline
    pub async fn read_write<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_transaction(SessionKind::ReadWritePrepared, None, body)
            .await
    }

    /// Read-only transaction with the default deadline
    pub async fn read_only<T, F, Fut>(&self, body: F) -> Result<T>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.run_transaction(SessionKind::ReadOnly, None, body).await
    }

    /// The underlying pool, for direct session checkout
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub fn runner(&self) -> &TransactionRunner {
        &self.runner
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Close the pool. Running transactions fail once they need a new session.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
