//! Service wiring and lifecycle.
//!
//! Construction builds the object graph once: registry -> pools ->
//! gateways -> resolver -> monitor -> batch writer -> detector. `run`
//! resolves the initial symbol universe, spawns the background tasks and
//! blocks until Ctrl-C, then shuts everything down cooperatively so no
//! connection is left checked out.

use crate::config::MonitorServiceConfig;
use anyhow::{anyhow, Result};
use spreadscan_core::cache::build_sink;
use spreadscan_core::exchange::{ConnectorRegistry, ExchangeGateway};
use spreadscan_core::ingest::BatchWriter;
use spreadscan_core::monitor::PriceMonitor;
use spreadscan_core::pool::ConnectionPoolManager;
use spreadscan_core::types::{ArbitrageCandidate, Tick};
use spreadscan_core::universe::{UniverseResolver, WatchEntry};
use spreadscan_core::detector::OpportunityDetector;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{info, warn};

pub struct MonitorService {
    config: MonitorServiceConfig,
    pools: Arc<ConnectionPoolManager>,
    gateways: HashMap<String, Arc<ExchangeGateway>>,
    resolver: Arc<UniverseResolver>,
    monitor: Arc<PriceMonitor>,
    writer: Arc<BatchWriter>,
    detector: Arc<OpportunityDetector>,
    queue_rx: mpsc::Receiver<Tick>,
    candidates_rx: mpsc::Receiver<ArbitrageCandidate>,
    shutdown_tx: watch::Sender<bool>,
}

impl MonitorService {
    pub async fn new(config: MonitorServiceConfig) -> Result<Self> {
        let exchanges = config.core.universe.exchanges.clone();
        info!("Initializing monitor service for exchanges: {:?}", exchanges);

        let registry = Arc::new(ConnectorRegistry::with_defaults());
        for exchange_id in &exchanges {
            if !registry.contains(exchange_id) {
                return Err(anyhow!(
                    "unknown exchange in SPREADSCAN_EXCHANGES: {}",
                    exchange_id
                ));
            }
        }

        let pools = Arc::new(ConnectionPoolManager::new(
            &registry,
            &exchanges,
            &config.core.pool,
        )?);

        let mut gateways = HashMap::new();
        for exchange_id in &exchanges {
            let connector = registry.get_required(exchange_id)?;
            gateways.insert(
                exchange_id.clone(),
                Arc::new(ExchangeGateway::new(connector, pools.clone())),
            );
        }

        let resolver = Arc::new(UniverseResolver::new(
            registry.clone(),
            config.core.universe.clone(),
        ));

        let sink = build_sink(&config.core.cache).await?;

        let (monitor, queue_rx) = PriceMonitor::new(config.core.monitor.clone(), gateways.clone());
        let writer = Arc::new(BatchWriter::new(config.core.batch.clone(), sink.clone()));

        let (candidates_tx, candidates_rx) = mpsc::channel(config.candidate_channel_capacity);
        let detector = Arc::new(OpportunityDetector::new(
            config.core.detector.clone(),
            sink,
            resolver.clone(),
            candidates_tx,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            pools,
            gateways,
            resolver,
            monitor: Arc::new(monitor),
            writer,
            detector,
            queue_rx,
            candidates_rx,
            shutdown_tx,
        })
    }

    /// Run until Ctrl-C, then shut down cooperatively.
    pub async fn run(self) -> Result<()> {
        let MonitorService {
            config,
            pools,
            gateways,
            resolver,
            monitor,
            writer,
            detector,
            queue_rx,
            mut candidates_rx,
            shutdown_tx,
        } = self;

        // The initial resolve is the only fatal one: with zero catalogs
        // there is nothing to monitor and the configuration is suspect.
        let universe = resolver.refresh().await;
        if universe.exchanges.is_empty() {
            return Err(anyhow!(
                "no exchange catalog could be fetched at startup; check connectivity and SPREADSCAN_EXCHANGES"
            ));
        }
        if universe.is_empty() {
            warn!("symbol universe is empty; monitoring will idle until a refresh finds common instruments");
        }

        // Seed gateway validity caches from the catalogs just fetched
        for (exchange_id, gateway) in &gateways {
            if let Some(catalog) = resolver.catalog(exchange_id) {
                gateway.prime_catalog(&catalog).await;
            }
        }

        let mut tasks = JoinSet::new();

        // Batch drain into the cache sink
        {
            let writer = writer.clone();
            let shutdown = shutdown_tx.subscribe();
            tasks.spawn(async move { writer.run(queue_rx, shutdown).await });
        }

        // Opportunity scanning; the Arc moves in so the candidate channel
        // closes when the detector task exits
        {
            let shutdown = shutdown_tx.subscribe();
            tasks.spawn(async move { detector.run(shutdown).await });
        }

        // Candidate consumer: the strategy layer boundary. This daemon
        // only logs what it would hand over.
        tasks.spawn(async move {
            while let Some(candidate) = candidates_rx.recv().await {
                info!(
                    symbol = %candidate.symbol,
                    buy = %candidate.buy_exchange,
                    buy_price = candidate.buy_price,
                    sell = %candidate.sell_exchange,
                    sell_price = candidate.sell_price,
                    spread = candidate.spread,
                    spread_pct = candidate.spread_pct,
                    "arbitrage candidate"
                );
            }
        });

        // Scheduled universe refresh; pairs new to the universe get their
        // own watch loops, pairs that left it keep streaming until restart
        {
            let resolver = resolver.clone();
            let monitor = monitor.clone();
            let gateways = gateways.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let mut watched: HashSet<WatchEntry> =
                universe.watch_entries().into_iter().collect();
            tasks.spawn(async move {
                let mut ticker = interval(resolver.refresh_interval());
                // The immediate first tick; startup already resolved once
                ticker.tick().await;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = ticker.tick() => {
                            let set = resolver.refresh().await;
                            for (exchange_id, gateway) in &gateways {
                                if let Some(catalog) = resolver.catalog(exchange_id) {
                                    gateway.invalidate_catalog().await;
                                    gateway.prime_catalog(&catalog).await;
                                }
                            }
                            let fresh: Vec<WatchEntry> = set
                                .watch_entries()
                                .into_iter()
                                .filter(|e| !watched.contains(e))
                                .collect();
                            if !fresh.is_empty() {
                                info!(new_pairs = fresh.len(), "universe grew, watching new pairs");
                                watched.extend(fresh.iter().cloned());
                                monitor.watch(fresh).await;
                            }
                        }
                    }
                }
            });
        }

        // Idle-connection health sweep
        {
            let pools = pools.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let sweep_interval = config.pool_sweep_interval;
            tasks.spawn(async move {
                let mut ticker = interval(sweep_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = ticker.tick() => {
                            pools.sweep_idle().await;
                        }
                    }
                }
            });
        }

        // Stats heartbeat
        {
            let monitor_stats = monitor.stats();
            let batch_stats = writer.stats();
            let resolver = resolver.clone();
            let pools = pools.clone();
            let mut shutdown = shutdown_tx.subscribe();
            let heartbeat = config.heartbeat_interval;
            tasks.spawn(async move {
                let mut ticker = interval(heartbeat);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = ticker.tick() => {
                            let m = monitor_stats.snapshot();
                            let b = batch_stats.snapshot();
                            let universe = resolver.current();
                            let (idle, in_flight) = pools
                                .all_stats()
                                .iter()
                                .fold((0, 0), |(i, f), (_, _, s)| (i + s.idle, f + s.in_flight));
                            info!(
                                pairs = universe.total_symbols(),
                                generation = universe.generation,
                                watchers = m.active_watchers,
                                ticks = m.ticks_received,
                                dropped = m.ticks_dropped,
                                reconnects = m.reconnects,
                                written = b.ticks_written,
                                write_failures = b.write_failures,
                                pool_idle = idle,
                                pool_in_flight = in_flight,
                                "heartbeat"
                            );
                        }
                    }
                }
            });
        }

        monitor.start(&universe).await;
        info!("monitor_service running; Ctrl-C to stop");

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");

        let _ = shutdown_tx.send(true);
        monitor.stop().await;
        while tasks.join_next().await.is_some() {}
        pools.close_all().await;

        let final_stats = monitor.stats();
        info!(
            ticks = final_stats.ticks_received.load(Ordering::Relaxed),
            dropped = final_stats.ticks_dropped.load(Ordering::Relaxed),
            reconnects = final_stats.reconnects.load(Ordering::Relaxed),
            "monitor_service stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spreadscan_core::config::{
        BatchConfig, CacheConfig, CoreConfig, DetectorConfig, MonitorConfig, PoolConfig,
        UniverseConfig,
    };
    use spreadscan_core::types::MarketType;
    use std::time::Duration;

    fn test_config() -> MonitorServiceConfig {
        MonitorServiceConfig {
            core: CoreConfig {
                universe: UniverseConfig {
                    exchanges: vec!["binance".to_string(), "okx".to_string()],
                    market_types: vec![MarketType::Spot],
                    quote_currencies: vec!["USDT".to_string()],
                    refresh_interval: Duration::from_secs(3600),
                },
                pool: PoolConfig::default(),
                monitor: MonitorConfig::default(),
                batch: BatchConfig::default(),
                cache: CacheConfig::default(),
                detector: DetectorConfig::default(),
            },
            heartbeat_interval: Duration::from_secs(15),
            pool_sweep_interval: Duration::from_secs(60),
            candidate_channel_capacity: 16,
        }
    }

    #[tokio::test]
    async fn test_wiring_builds_offline() {
        // Construction touches no venue; connections and catalogs are lazy
        let service = MonitorService::new(test_config()).await.unwrap();
        assert_eq!(service.gateways.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_fatal() {
        let mut config = test_config();
        config.core.universe.exchanges.push("mtgox".to_string());
        assert!(MonitorService::new(config).await.is_err());
    }
}
