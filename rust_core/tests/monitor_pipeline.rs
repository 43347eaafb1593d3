//! End-to-end monitoring pipeline against scripted venues: reconnect
//! liveness, the global watcher bound, cooperative shutdown and the
//! monitor -> batch -> cache -> detector path.

use spreadscan_core::cache::MemoryCache;
use spreadscan_core::config::{
    BatchConfig, DetectorConfig, MonitorConfig, MonitorMode, PoolConfig, UniverseConfig,
};
use spreadscan_core::exchange::{ConnectorRegistry, ExchangeConnector, ExchangeGateway};
use spreadscan_core::ingest::BatchWriter;
use spreadscan_core::monitor::PriceMonitor;
use spreadscan_core::pool::ConnectionPoolManager;
use spreadscan_core::testkit::MockExchange;
use spreadscan_core::types::{ConnectionKind, MarketType, Tick};
use spreadscan_core::universe::UniverseResolver;
use spreadscan_core::detector::OpportunityDetector;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

struct Rig {
    pools: Arc<ConnectionPoolManager>,
    resolver: Arc<UniverseResolver>,
    monitor: PriceMonitor,
    queue_rx: Option<mpsc::Receiver<Tick>>,
    sink: Arc<MemoryCache>,
}

fn fast_monitor_config(max_watchers: usize) -> MonitorConfig {
    MonitorConfig {
        mode: MonitorMode::Stream,
        max_concurrent_watchers: max_watchers,
        queue_capacity: 1024,
        queue_send_timeout: Duration::from_millis(50),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        // High threshold: these tests exercise reconnects, not the breaker
        breaker_error_threshold: 10_000,
        breaker_window: Duration::from_secs(60),
        breaker_cooldown: Duration::from_millis(50),
        poll_interval: Duration::from_millis(50),
    }
}

fn rig(mocks: Vec<MockExchange>, monitor_config: MonitorConfig) -> Rig {
    let mut registry = ConnectorRegistry::new();
    let exchanges: Vec<String> = mocks.iter().map(|m| m.exchange_id().to_string()).collect();
    for mock in mocks {
        registry.register(Arc::new(mock));
    }
    let registry = Arc::new(registry);

    let pools = Arc::new(
        ConnectionPoolManager::new(
            &registry,
            &exchanges,
            &PoolConfig {
                max_rest_size: 4,
                max_stream_size: 8,
                acquire_timeout: Duration::from_secs(2),
                health_check_timeout: Duration::from_secs(1),
            },
        )
        .unwrap(),
    );

    let gateways: HashMap<String, Arc<ExchangeGateway>> = exchanges
        .iter()
        .map(|id| {
            let connector = registry.get_required(id).unwrap();
            (
                id.clone(),
                Arc::new(ExchangeGateway::new(connector, pools.clone())),
            )
        })
        .collect();

    let resolver = Arc::new(UniverseResolver::new(
        registry,
        UniverseConfig {
            exchanges,
            market_types: vec![MarketType::Spot],
            quote_currencies: vec!["USDT".to_string()],
            refresh_interval: Duration::from_secs(3600),
        },
    ));

    let (monitor, queue_rx) = PriceMonitor::new(monitor_config, gateways);
    let sink = Arc::new(MemoryCache::new(Duration::from_secs(60)));

    Rig {
        pools,
        resolver,
        monitor,
        queue_rx: Some(queue_rx),
        sink,
    }
}

/// Drain the queue without persisting, for tests that only watch stats.
fn discard_queue(mut queue_rx: mpsc::Receiver<Tick>) {
    tokio::spawn(async move { while queue_rx.recv().await.is_some() {} });
}

#[tokio::test]
async fn test_watch_loop_survives_repeated_stream_failures() {
    let alpha = MockExchange::new("alpha")
        .with_spot("BTC", "USDT")
        .with_tick_interval(Duration::from_millis(2))
        .fail_stream_every(3);
    let mut rig = rig(vec![alpha], fast_monitor_config(10));
    discard_queue(rig.queue_rx.take().unwrap());

    let universe = rig.resolver.refresh().await;
    rig.monitor.start(&universe).await;
    tokio::time::sleep(Duration::from_millis(600)).await;

    let stats = rig.monitor.stats().snapshot();
    // The stream dies every 3 reads; steady delivery means the loop kept
    // reconnecting instead of exiting
    assert!(
        stats.reconnects >= 5,
        "expected repeated reconnects, got {}",
        stats.reconnects
    );
    assert!(
        stats.ticks_received >= 3 * stats.reconnects,
        "ticks did not keep flowing across reconnects: {} ticks, {} reconnects",
        stats.ticks_received,
        stats.reconnects
    );

    rig.monitor.stop().await;
    rig.pools.close_all().await;
}

#[tokio::test]
async fn test_watcher_count_never_exceeds_limit() {
    const LIMIT: usize = 3;

    let symbols = ["BTC", "ETH", "SOL", "XRP"];
    let mut alpha = MockExchange::new("alpha")
        .with_tick_interval(Duration::from_millis(1))
        .fail_stream_every(2);
    let mut beta = MockExchange::new("beta")
        .with_tick_interval(Duration::from_millis(1))
        .fail_stream_every(2);
    for base in symbols {
        alpha = alpha.with_spot(base, "USDT");
        beta = beta.with_spot(base, "USDT");
    }

    let mut rig = rig(vec![alpha, beta], fast_monitor_config(LIMIT));
    discard_queue(rig.queue_rx.take().unwrap());

    let universe = rig.resolver.refresh().await;
    // 4 common symbols on 2 venues: 8 eligible pairs, 3 allowed at once
    assert_eq!(universe.watch_entries().len(), 8);

    rig.monitor.start(&universe).await;
    tokio::time::sleep(Duration::from_millis(400)).await;

    let stats = rig.monitor.stats().snapshot();
    assert!(stats.ticks_received > 0);
    assert!(
        (1..=LIMIT as u64).contains(&stats.peak_active_watchers),
        "peak {} outside 1..={}",
        stats.peak_active_watchers,
        LIMIT
    );

    rig.monitor.stop().await;
    rig.pools.close_all().await;
}

#[tokio::test]
async fn test_stop_returns_every_connection() {
    let alpha = MockExchange::new("alpha")
        .with_spot("BTC", "USDT")
        .with_spot("ETH", "USDT")
        .with_tick_interval(Duration::from_millis(2));
    let state = alpha.state();
    let mut rig = rig(vec![alpha], fast_monitor_config(10));
    discard_queue(rig.queue_rx.take().unwrap());

    let universe = rig.resolver.refresh().await;
    rig.monitor.start(&universe).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    rig.monitor.stop().await;

    // Both loops exited through release: nothing is checked out
    let stats = rig.pools.stats("alpha", ConnectionKind::Stream).unwrap();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(rig.monitor.stats().snapshot().active_watchers, 0);

    rig.pools.close_all().await;
    assert_eq!(state.active_streams.load(Ordering::SeqCst), 0);
}

async fn run_pipeline_and_scan(
    alpha_quotes: (f64, f64),
    beta_quotes: (f64, f64),
) -> (Vec<spreadscan_core::types::ArbitrageCandidate>, mpsc::Receiver<spreadscan_core::types::ArbitrageCandidate>) {
    let alpha = MockExchange::new("alpha")
        .with_spot("BTC", "USDT")
        .with_quotes(alpha_quotes.0, alpha_quotes.1)
        .with_tick_interval(Duration::from_millis(2));
    let beta = MockExchange::new("beta")
        .with_spot("BTC", "USDT")
        .with_quotes(beta_quotes.0, beta_quotes.1)
        .with_tick_interval(Duration::from_millis(2));

    let mut rig = rig(vec![alpha, beta], fast_monitor_config(10));
    let queue_rx = rig.queue_rx.take().unwrap();

    let writer = Arc::new(BatchWriter::new(
        BatchConfig {
            batch_size: 10,
            flush_interval: Duration::from_millis(20),
            max_pending_batches: 4,
        },
        rig.sink.clone(),
    ));
    let (writer_shutdown_tx, writer_shutdown_rx) = watch::channel(false);
    let writer_task = {
        let writer = writer.clone();
        tokio::spawn(async move { writer.run(queue_rx, writer_shutdown_rx).await })
    };

    let universe = rig.resolver.refresh().await;
    rig.monitor.start(&universe).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let (candidates_tx, candidates_rx) = mpsc::channel(16);
    let detector = OpportunityDetector::new(
        DetectorConfig {
            scan_interval: Duration::from_millis(50),
            min_spread_pct: 0.1,
            max_tick_age: Duration::from_secs(30),
        },
        rig.sink.clone(),
        rig.resolver.clone(),
        candidates_tx,
    );
    let emitted = detector.scan_once().await;

    rig.monitor.stop().await;
    let _ = writer_shutdown_tx.send(true);
    writer_task.await.unwrap();
    rig.pools.close_all().await;

    (emitted, candidates_rx)
}

#[tokio::test]
async fn test_pipeline_detects_crossed_market() {
    let (emitted, mut candidates_rx) =
        run_pipeline_and_scan((100.5, 100.6), (100.8, 100.9)).await;

    assert_eq!(emitted.len(), 1, "expected exactly one candidate");
    let candidate = &emitted[0];
    assert_eq!(candidate.symbol, "BTC/USDT");
    assert_eq!(candidate.buy_exchange, "alpha");
    assert_eq!(candidate.buy_price, 100.6);
    assert_eq!(candidate.sell_exchange, "beta");
    assert_eq!(candidate.sell_price, 100.8);
    assert!((candidate.spread - 0.2).abs() < 1e-9);

    // The same candidate went out on the strategy channel
    let delivered = candidates_rx.recv().await.unwrap();
    assert_eq!(delivered.buy_exchange, "alpha");
    assert_eq!(delivered.sell_exchange, "beta");
}

#[tokio::test]
async fn test_pipeline_ignores_market_without_viable_cross() {
    // alpha's bid over beta's ask is ~0.0996% of the buy price: under the
    // 0.1% spread floor, so nothing goes out
    let (emitted, mut candidates_rx) =
        run_pipeline_and_scan((100.5, 100.9), (100.2, 100.4)).await;

    assert!(emitted.is_empty(), "no candidate expected, got {:?}", emitted);
    assert!(candidates_rx.try_recv().is_err());
}
