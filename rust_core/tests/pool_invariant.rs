//! Pool behavior under concurrent stress: the size invariant, exclusive
//! ownership of checked-out connections, exhaustion and shutdown.

use parking_lot::Mutex;
use spreadscan_core::config::PoolConfig;
use spreadscan_core::errors::PoolError;
use spreadscan_core::exchange::{ConnectorRegistry, ExchangeConnector};
use spreadscan_core::pool::ConnectionPoolManager;
use spreadscan_core::testkit::{MockExchange, UnreachableExchange};
use spreadscan_core::types::ConnectionKind;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn manager_for(connector: MockExchange, config: PoolConfig) -> Arc<ConnectionPoolManager> {
    let id = connector.exchange_id().to_string();
    let mut registry = ConnectorRegistry::new();
    registry.register(Arc::new(connector));
    Arc::new(ConnectionPoolManager::new(&registry, &[id], &config).unwrap())
}

#[tokio::test]
async fn test_invariant_and_exclusive_ownership_under_stress() {
    const MAX_SIZE: usize = 4;
    const TASKS: usize = 16;
    const ITERATIONS: usize = 50;

    let pools = manager_for(
        MockExchange::new("mock").with_tick_interval(Duration::from_micros(100)),
        PoolConfig {
            max_rest_size: MAX_SIZE,
            max_stream_size: MAX_SIZE,
            acquire_timeout: Duration::from_secs(5),
            health_check_timeout: Duration::from_secs(1),
        },
    );

    // Every currently checked-out connection id; an insert that reports
    // "already present" means two owners hold the same connection.
    let owned: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));

    let mut handles = Vec::new();
    for _ in 0..TASKS {
        let pools = pools.clone();
        let owned = owned.clone();
        handles.push(tokio::spawn(async move {
            for _ in 0..ITERATIONS {
                let conn = pools.acquire("mock", ConnectionKind::Rest).await.unwrap();
                assert!(
                    owned.lock().insert(conn.id()),
                    "connection {} observed by two owners at once",
                    conn.id()
                );

                let stats = pools.stats("mock", ConnectionKind::Rest).unwrap();
                assert!(
                    stats.idle + stats.in_flight <= MAX_SIZE,
                    "pool overshot: idle={} in_flight={}",
                    stats.idle,
                    stats.in_flight
                );

                tokio::time::sleep(Duration::from_micros(200)).await;
                assert!(owned.lock().remove(&conn.id()));
                pools.release(conn);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = pools.stats("mock", ConnectionKind::Rest).unwrap();
    assert_eq!(stats.in_flight, 0);
    assert!(stats.idle <= MAX_SIZE);
    assert!(stats.created as usize <= MAX_SIZE);
}

#[tokio::test]
async fn test_exhausted_pool_fails_after_timeout_then_recovers() {
    let pools = manager_for(
        MockExchange::new("mock"),
        PoolConfig {
            max_rest_size: 10,
            max_stream_size: 1,
            acquire_timeout: Duration::from_millis(100),
            health_check_timeout: Duration::from_secs(1),
        },
    );

    let held = pools.acquire("mock", ConnectionKind::Stream).await.unwrap();

    let err = pools
        .acquire("mock", ConnectionKind::Stream)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));
    assert!(pools.stats("mock", ConnectionKind::Stream).unwrap().exhausted >= 1);

    // A waiter blocked on the pool gets the connection once it comes back
    let waiter = {
        let pools = pools.clone();
        tokio::spawn(async move {
            pools.acquire("mock", ConnectionKind::Stream).await.unwrap()
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    pools.release(held);
    let conn = waiter.await.unwrap();
    pools.release(conn);
}

#[tokio::test]
async fn test_failed_connect_does_not_leak_the_slot() {
    let mut registry = ConnectorRegistry::new();
    registry.register(Arc::new(UnreachableExchange::new("down")));
    let pools = Arc::new(
        ConnectionPoolManager::new(
            &registry,
            &["down".to_string()],
            &PoolConfig {
                max_rest_size: 1,
                max_stream_size: 1,
                acquire_timeout: Duration::from_millis(100),
                health_check_timeout: Duration::from_secs(1),
            },
        )
        .unwrap(),
    );

    // With a slot leak the second attempt would see a full pool and fail
    // with Exhausted instead of another connect error.
    for _ in 0..3 {
        let err = pools.acquire("down", ConnectionKind::Rest).await.unwrap_err();
        assert!(matches!(err, PoolError::Connect(_)), "got {:?}", err);
    }
}

#[tokio::test]
async fn test_unhealthy_connection_is_closed_on_release() {
    let mock = MockExchange::new("mock").fail_ping();
    let state = mock.state();
    let pools = manager_for(mock, PoolConfig::default());

    let mut conn = pools.acquire("mock", ConnectionKind::Rest).await.unwrap();
    assert!(!pools.health_check(&mut conn).await);
    pools.release(conn);

    let stats = pools.stats("mock", ConnectionKind::Rest).unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.closed, 1);
    assert_eq!(stats.health_check_failures, 1);

    // The replacement is a fresh session on the next acquire
    let conn = pools.acquire("mock", ConnectionKind::Rest).await.unwrap();
    pools.release(conn);
    assert_eq!(state.sessions_opened.load(std::sync::atomic::Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_close_all_drains_and_rejects_new_acquires() {
    let pools = manager_for(MockExchange::new("mock"), PoolConfig::default());

    let a = pools.acquire("mock", ConnectionKind::Rest).await.unwrap();
    let b = pools.acquire("mock", ConnectionKind::Rest).await.unwrap();
    pools.release(a);
    pools.release(b);
    assert_eq!(pools.stats("mock", ConnectionKind::Rest).unwrap().idle, 2);

    pools.close_all().await;

    let stats = pools.stats("mock", ConnectionKind::Rest).unwrap();
    assert_eq!(stats.idle, 0);
    let err = pools.acquire("mock", ConnectionKind::Rest).await.unwrap_err();
    assert!(matches!(err, PoolError::Closed { .. }));
}

#[tokio::test]
async fn test_sweep_discards_dead_idle_connections() {
    let mock = MockExchange::new("mock").fail_ping();
    let pools = manager_for(mock, PoolConfig::default());

    let conn = pools.acquire("mock", ConnectionKind::Rest).await.unwrap();
    pools.release(conn);
    assert_eq!(pools.stats("mock", ConnectionKind::Rest).unwrap().idle, 1);

    pools.sweep_idle().await;

    let stats = pools.stats("mock", ConnectionKind::Rest).unwrap();
    assert_eq!(stats.idle, 0);
    assert_eq!(stats.in_flight, 0);
    assert!(stats.health_check_failures >= 1);
}
