/// Session pool tests
///
/// Growth, wait queue, eviction, rebalancing and shutdown of `SessionPool`
/// against the in-memory session client.
/// Run with: cargo test --test pool_tests

use sessionpool::client::{MemorySessionClient, Operation};
use sessionpool::{Error, PoolConfig, ReleaseOutcome, SessionKind, SessionPool, Status, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn test_config() -> PoolConfig {
    PoolConfig::new()
        .min_sessions(0)
        .max_sessions(4)
        .inc_step(2)
        .write_sessions_fraction(0.0)
        .maintenance_interval(Duration::from_secs(3600))
}

fn new_pool(config: PoolConfig) -> (Arc<MemorySessionClient>, SessionPool) {
    let client = Arc::new(
        MemorySessionClient::new("pool_tests").with_create_latency(Duration::from_millis(10)),
    );
    let pool = SessionPool::new(client.clone(), config).unwrap();
    (client, pool)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn test_two_reads_share_one_burst_and_third_triggers_another() {
    let (client, pool) = new_pool(test_config());

    let (first, second) = tokio::join!(
        pool.acquire(SessionKind::ReadOnly, None),
        pool.acquire(SessionKind::ReadOnly, None)
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(client.counts().create_batches, 1);
    assert_eq!(client.counts().sessions_created, 2);

    let third = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
    assert_eq!(client.counts().create_batches, 2);
    assert!(pool.size() <= 4);

    for session in [first, second, third] {
        pool.release(session, ReleaseOutcome::Valid);
    }
    assert_eq!(pool.stats().checked_out, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_acquires_coalesce_growth() {
    let (client, pool) = new_pool(
        PoolConfig::new()
            .min_sessions(0)
            .max_sessions(16)
            .inc_step(3)
            .write_sessions_fraction(0.0)
            .maintenance_interval(Duration::from_secs(3600)),
    );

    let mut handles = vec![];
    for _ in 0..10 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.acquire(SessionKind::ReadOnly, None).await
        }));
    }

    let mut sessions = vec![];
    for handle in handles {
        sessions.push(handle.await.unwrap().unwrap());
    }

    // ceil(10 / 3)
    assert!(client.counts().create_batches <= 4);
    assert_eq!(pool.stats().checked_out, 10);

    for session in sessions {
        pool.release(session, ReleaseOutcome::Valid);
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_sessions_stay_within_bounds() {
    let (_client, pool) = new_pool(
        PoolConfig::new()
            .min_sessions(2)
            .max_sessions(5)
            .inc_step(2)
            .maintenance_interval(Duration::from_secs(3600)),
    );
    settle().await;
    assert_eq!(pool.size(), 2);

    let mut handles = vec![];
    for task_id in 0..20u64 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            let kind = if task_id % 3 == 0 {
                SessionKind::ReadWritePrepared
            } else {
                SessionKind::ReadOnly
            };
            for _ in 0..5 {
                let session = pool.acquire(kind, None).await.unwrap();
                assert!(pool.size() <= 5, "Task {} saw more than max sessions", task_id);
                tokio::time::sleep(Duration::from_millis(1 + task_id % 4)).await;
                pool.release(session, ReleaseOutcome::Valid);
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    pool.run_maintenance().await;
    settle().await;
    let stats = pool.stats();
    assert!(stats.total_sessions >= 2);
    assert!(stats.total_sessions <= 5);
    assert_eq!(stats.checked_out, 0);
}

#[tokio::test(start_paused = true)]
async fn test_min_sessions_are_created_in_background() {
    let (client, pool) = new_pool(
        PoolConfig::new()
            .min_sessions(5)
            .max_sessions(10)
            .inc_step(5)
            .write_sessions_fraction(0.2)
            .maintenance_interval(Duration::from_secs(3600)),
    );
    settle().await;

    let stats = pool.stats();
    assert_eq!(stats.total_sessions, 5);
    assert_eq!(stats.idle(), 5);
    assert_eq!(stats.idle_read_write, 1);
    assert_eq!(client.live_sessions(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_min_fill_continues_past_the_first_burst() {
    let (client, pool) = new_pool(
        PoolConfig::new()
            .min_sessions(6)
            .max_sessions(10)
            .inc_step(2)
            .write_sessions_fraction(0.0)
            .maintenance_interval(Duration::from_secs(60)),
    );

    // Three back-to-back bursts of 2, well before the first maintainer tick
    settle().await;
    let stats = pool.stats();
    assert_eq!(stats.total_sessions, 6);
    assert_eq!(stats.idle(), 6);
    assert_eq!(stats.creating, 0);
    assert_eq!(client.counts().create_batches, 3);
    assert_eq!(client.live_sessions(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_min_fill_resumes_after_create_backoff() {
    let (client, pool) = new_pool(
        PoolConfig::new()
            .min_sessions(4)
            .max_sessions(8)
            .inc_step(2)
            .write_sessions_fraction(0.0)
            .create_backoff(Duration::from_millis(100), Duration::from_secs(1))
            .maintenance_interval(Duration::from_secs(3600)),
    );
    client.fail_next(
        Operation::CreateSessions,
        Status::new(StatusCode::Unavailable, "backend down"),
    );

    settle().await;
    assert_eq!(pool.size(), 0);
    assert_eq!(pool.stats().create_failures, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.size(), 4);
    assert_eq!(pool.stats().idle(), 4);
    assert_eq!(client.counts().create_batches, 3);
}

#[tokio::test(start_paused = true)]
async fn test_surplus_sessions_from_a_batch_are_deleted() {
    let client = Arc::new(MemorySessionClient::new("pool_tests").with_batch_surplus(1));
    let pool = SessionPool::new(client.clone(), test_config()).unwrap();

    let session = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
    settle().await;

    assert_eq!(pool.size(), 2);
    assert_eq!(client.counts().sessions_created, 3);
    assert_eq!(client.counts().deletes, 1);
    assert_eq!(client.live_sessions(), 2);
    pool.release(session, ReleaseOutcome::Valid);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_is_never_handed_out_again() {
    let (client, pool) = new_pool(test_config());

    let session = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
    let invalid_id = session.id();
    let invalid_name = session.name().to_string();
    assert!(client.invalidate_session(&invalid_name));

    let live_before = pool.size();
    pool.release(session, ReleaseOutcome::Invalid);
    assert_eq!(pool.size(), live_before - 1);
    assert_eq!(pool.stats().invalidated, 1);

    for _ in 0..5 {
        let session = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
        assert_ne!(session.id(), invalid_id);
        assert_ne!(session.name(), invalid_name);
        pool.release(session, ReleaseOutcome::Valid);
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_session_below_min_is_replaced() {
    let (_client, pool) = new_pool(test_config().min_sessions(2));
    settle().await;
    assert_eq!(pool.size(), 2);

    let session = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
    pool.release(session, ReleaseOutcome::Invalid);
    settle().await;

    let stats = pool.stats();
    assert_eq!(stats.total_sessions, 2);
    assert_eq!(stats.sessions_created, 3);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_honors_caller_deadline() {
    let (_client, pool) = new_pool(test_config().max_sessions(1).inc_step(1));
    let held = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();

    let started = Instant::now();
    let err = pool
        .acquire(SessionKind::ReadOnly, Some(started + Duration::from_millis(50)))
        .await
        .unwrap_err();

    match err {
        Error::PoolExhausted { waited } => {
            assert!(waited >= Duration::from_millis(50));
            assert!(waited < Duration::from_millis(60));
        }
        other => panic!("expected PoolExhausted, got {other:?}"),
    }
    assert_eq!(pool.stats().waiters, 0);
    pool.release(held, ReleaseOutcome::Valid);
}

#[tokio::test(start_paused = true)]
async fn test_waiters_are_served_in_arrival_order() {
    let (_client, pool) = new_pool(test_config().max_sessions(1).inc_step(1));
    let held = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = vec![];
    for name in ["A", "B", "C"] {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let session = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
            order.lock().unwrap().push(name);
            tokio::time::sleep(Duration::from_millis(5)).await;
            pool.release(session, ReleaseOutcome::Valid);
        }));
        // Let the waiter enqueue before the next one
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(pool.stats().waiters, 3);

    pool.release(held, ReleaseOutcome::Valid);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_acquire_leaves_no_waiter() {
    let (_client, pool) = new_pool(test_config().max_sessions(1).inc_step(1));
    let held = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        pool.acquire(SessionKind::ReadOnly, None),
    )
    .await;
    assert!(cancelled.is_err());
    assert_eq!(pool.stats().waiters, 0);

    pool.release(held, ReleaseOutcome::Valid);
    assert_eq!(pool.stats().idle(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_sessions_above_min_are_evicted() {
    let (client, pool) = new_pool(
        test_config()
            .min_sessions(1)
            .inc_step(1)
            .max_idle(Duration::from_secs(60))
            .keep_alive_interval(Duration::from_secs(600)),
    );
    settle().await;

    let (a, b, c) = tokio::join!(
        pool.acquire(SessionKind::ReadOnly, None),
        pool.acquire(SessionKind::ReadOnly, None),
        pool.acquire(SessionKind::ReadOnly, None)
    );
    for session in [a.unwrap(), b.unwrap(), c.unwrap()] {
        pool.release(session, ReleaseOutcome::Valid);
    }
    let before = pool.size();
    assert!(before >= 3);

    tokio::time::advance(Duration::from_secs(61)).await;
    pool.run_maintenance().await;
    settle().await;

    let stats = pool.stats();
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.evicted as usize, before - 1);
    assert_eq!(client.live_sessions(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_writer_upgrades_idle_reader() {
    let (_client, pool) = new_pool(test_config());

    let reader = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
    pool.release(reader, ReleaseOutcome::Valid);
    assert_eq!(pool.stats().idle_read_only, 2);

    let writer = pool
        .acquire(SessionKind::ReadWritePrepared, None)
        .await
        .unwrap();
    assert_eq!(writer.kind(), SessionKind::ReadWritePrepared);
    assert!(!writer.is_prepared());
    assert_eq!(pool.stats().upgrades, 1);
    assert_eq!(pool.stats().sessions_created, 2);

    pool.release(writer, ReleaseOutcome::Valid);
}

#[tokio::test(start_paused = true)]
async fn test_full_pool_of_readers_makes_room_for_writer() {
    let (client, pool) = new_pool(test_config().max_sessions(2).allow_upgrade(false));

    let (a, b) = tokio::join!(
        pool.acquire(SessionKind::ReadOnly, None),
        pool.acquire(SessionKind::ReadOnly, None)
    );
    pool.release(a.unwrap(), ReleaseOutcome::Valid);
    pool.release(b.unwrap(), ReleaseOutcome::Valid);
    assert_eq!(pool.size(), 2);

    let writer = pool
        .acquire(SessionKind::ReadWritePrepared, None)
        .await
        .unwrap();
    assert_eq!(writer.kind(), SessionKind::ReadWritePrepared);
    assert!(writer.is_prepared());

    let stats = pool.stats();
    assert_eq!(stats.evicted, 1);
    assert!(stats.total_sessions <= 2);
    pool.release(writer, ReleaseOutcome::Valid);

    settle().await;
    assert_eq!(client.live_sessions(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_composition_follows_demand() {
    let (client, pool) = new_pool(
        test_config()
            .min_sessions(4)
            .inc_step(4)
            .demand_window(4),
    );
    settle().await;
    assert_eq!(pool.stats().idle_read_only, 4);

    for _ in 0..20 {
        let session = pool
            .acquire(SessionKind::ReadWritePrepared, None)
            .await
            .unwrap();
        pool.release(session, ReleaseOutcome::Valid);
    }
    assert!(pool.stats().write_fraction > 0.9);

    pool.run_maintenance().await;
    let stats = pool.stats();
    assert_eq!(stats.idle_read_write, 4);
    assert_eq!(stats.maintaining, 0);

    for _ in 0..20 {
        let session = pool.acquire(SessionKind::ReadOnly, None).await.unwrap();
        pool.release(session, ReleaseOutcome::Valid);
    }
    assert!(pool.stats().write_fraction < 0.1);

    pool.run_maintenance().await;
    let stats = pool.stats();
    assert_eq!(stats.idle_read_only, 4);
    assert_eq!(client.counts().rollbacks, 4);
}

#[tokio::test(start_paused = true)]
async fn test_close_rejects_waiters_and_deletes_sessions() {
    let (client, pool) = new_pool(test_config().max_sessions(2).inc_step(2));

    let (a, b) = tokio::join!(
        pool.acquire(SessionKind::ReadOnly, None),
        pool.acquire(SessionKind::ReadOnly, None)
    );
    let held = a.unwrap();
    pool.release(b.unwrap(), ReleaseOutcome::Valid);

    let waiter = tokio::spawn({
        let pool = pool.clone();
        async move {
            let first = pool.acquire(SessionKind::ReadOnly, None).await?;
            let second = pool.acquire(SessionKind::ReadOnly, None).await;
            pool.release(first, ReleaseOutcome::Valid);
            second
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(pool.stats().waiters, 1);

    pool.close().await;
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::PoolClosed)));

    pool.release(held, ReleaseOutcome::Valid);
    settle().await;
    assert_eq!(client.live_sessions(), 0);
    assert!(pool.is_closed());
}
