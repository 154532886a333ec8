use crate::client::{RemoteSession, ResultSet, SessionClient, Status, StatusCode};
use crate::core::{Result, TransactionId, TransactionMode};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;

/// The open transaction handed to a transaction body.
///
/// Only valid for the attempt it was created for. Every call is bounded by
/// the transaction deadline; a call cut short locally fails with a
/// `DEADLINE_EXCEEDED` status.
#[derive(Clone)]
pub struct Transaction {
    client: Arc<dyn SessionClient>,
    session: RemoteSession,
    id: TransactionId,
    mode: TransactionMode,
    deadline: Instant,
    attempt: u32,
}

impl Transaction {
    pub(crate) fn new(
        client: Arc<dyn SessionClient>,
        session: RemoteSession,
        id: TransactionId,
        mode: TransactionMode,
        deadline: Instant,
        attempt: u32,
    ) -> Self {
        Self {
            client,
            session,
            id,
            mode,
            deadline,
            attempt,
        }
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    pub fn session_name(&self) -> &str {
        self.session.name()
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    /// 1 on the first run of the body, incremented on every retry
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub async fn execute(&self, sql: &str) -> Result<ResultSet> {
        let result = within_deadline(
            self.deadline,
            self.client.execute_sql(&self.session, &self.id, sql),
        )
        .await?;
        Ok(result)
    }

    /// Rows returned by a query
    pub async fn query(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        Ok(self.execute(sql).await?.rows)
    }

    /// Run a DML statement and return the number of affected rows
    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Status::new(
                StatusCode::FailedPrecondition,
                "Cannot execute an update in a read-only transaction",
            )
            .into());
        }
        Ok(self.execute(sql).await?.rows_affected)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("session", &self.session)
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// Bound a remote call by `deadline`
pub(crate) async fn within_deadline<T>(
    deadline: Instant,
    call: impl Future<Output = std::result::Result<T, Status>>,
) -> std::result::Result<T, Status> {
    match tokio::time::timeout_at(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(Status::new(
            StatusCode::DeadlineExceeded,
            "Transaction deadline reached during a remote call",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MemorySessionClient;
    use crate::core::{Error, ErrorClass, SessionKind};
    use std::time::Duration;

    async fn open(
        client: &Arc<MemorySessionClient>,
        mode: TransactionMode,
        deadline: Instant,
    ) -> Transaction {
        let session = client
            .batch_create_sessions(SessionKind::ReadOnly, 1)
            .await
            .unwrap()
            .remove(0);
        let id = client.begin_transaction(&session, mode).await.unwrap();
        Transaction::new(client.clone(), session, id, mode, deadline, 1)
    }

    #[tokio::test]
    async fn test_query_returns_canned_rows() {
        let client = Arc::new(MemorySessionClient::new("handle"));
        client.set_result(
            "SELECT 1",
            ResultSet::from_rows(vec![serde_json::json!({ "one": 1 })]),
        );

        let txn = open(&client, TransactionMode::ReadOnly, Instant::now() + Duration::from_secs(5)).await;
        let rows = txn.query("SELECT 1").await.unwrap();
        assert_eq!(rows, vec![serde_json::json!({ "one": 1 })]);
        assert_eq!(txn.attempt(), 1);
    }

    #[tokio::test]
    async fn test_update_rejected_in_read_only_transaction() {
        let client = Arc::new(MemorySessionClient::new("handle"));
        let txn = open(&client, TransactionMode::ReadOnly, Instant::now() + Duration::from_secs(5)).await;

        let err = txn.execute_update("UPDATE t SET x = 1").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert_eq!(client.counts().executes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_bounded_by_deadline() {
        let client = Arc::new(
            MemorySessionClient::new("handle").with_call_latency(Duration::from_millis(50)),
        );
        let txn = open(&client, TransactionMode::ReadWrite, Instant::now() + Duration::from_millis(10)).await;

        let err = txn.execute("SELECT 1").await.unwrap_err();
        assert!(matches!(&err, Error::Status(status) if status.code == StatusCode::DeadlineExceeded));
        assert_eq!(err.class(), ErrorClass::DeadlineExceeded);
    }
}
