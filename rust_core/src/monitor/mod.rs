//! Live price monitoring.
//!
//! One watch loop per (exchange, symbol) pair, all gated by a global
//! semaphore so thousands of eligible pairs cannot open thousands of
//! sockets at once. Each loop leases a pooled stream connection, reads
//! and normalizes ticks, and pushes them onto the bounded batch queue.
//!
//! Queue overflow policy: the producer blocks up to the configured send
//! timeout; if the queue is still full the tick is dropped and counted in
//! `ticks_dropped`. Dropping is acceptable here because only the latest
//! observation per key matters downstream.
//!
//! Transport errors never kill a loop: the connection goes back to the
//! pool, the loop sleeps an exponentially growing, capped, jittered delay
//! and leases a fresh connection. A per-exchange circuit breaker pauses
//! every loop of a degraded venue for a cool-down instead.

pub mod backoff;
pub mod breaker;

use crate::config::{MonitorConfig, MonitorMode};
use crate::exchange::ExchangeGateway;
use crate::types::Tick;
use crate::universe::{CommonSymbolSet, WatchEntry};
use backoff::BackoffPolicy;
use breaker::{BreakerConfig, ExchangeBreaker};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Shared monitor counters.
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub ticks_received: AtomicU64,
    pub ticks_dropped: AtomicU64,
    pub reconnects: AtomicU64,
    pub active_watchers: AtomicU64,
    pub peak_active_watchers: AtomicU64,
}

impl MonitorStats {
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            ticks_received: self.ticks_received.load(Ordering::Relaxed),
            ticks_dropped: self.ticks_dropped.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            active_watchers: self.active_watchers.load(Ordering::Relaxed),
            peak_active_watchers: self.peak_active_watchers.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorStatsSnapshot {
    pub ticks_received: u64,
    pub ticks_dropped: u64,
    pub reconnects: u64,
    pub active_watchers: u64,
    pub peak_active_watchers: u64,
}

/// Everything a single watch loop needs.
struct WatchContext {
    gateway: Arc<ExchangeGateway>,
    breaker: Arc<ExchangeBreaker>,
    semaphore: Arc<Semaphore>,
    queue_tx: mpsc::Sender<Tick>,
    stats: Arc<MonitorStats>,
    mode: MonitorMode,
    poll_interval: Duration,
    queue_send_timeout: Duration,
    backoff: BackoffPolicy,
}

/// Drives the watch loops for every pair in the symbol universe.
pub struct PriceMonitor {
    config: MonitorConfig,
    gateways: HashMap<String, Arc<ExchangeGateway>>,
    breakers: HashMap<String, Arc<ExchangeBreaker>>,
    semaphore: Arc<Semaphore>,
    queue_tx: mpsc::Sender<Tick>,
    shutdown_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    stats: Arc<MonitorStats>,
}

impl PriceMonitor {
    /// Build the monitor and the batch queue it feeds. The receiver side
    /// goes to the batch writer.
    pub fn new(
        config: MonitorConfig,
        gateways: HashMap<String, Arc<ExchangeGateway>>,
    ) -> (Self, mpsc::Receiver<Tick>) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let (shutdown_tx, _) = watch::channel(false);

        let breaker_config = BreakerConfig {
            error_threshold: config.breaker_error_threshold,
            window: config.breaker_window,
            cooldown: config.breaker_cooldown,
        };
        let breakers = gateways
            .keys()
            .map(|id| {
                (
                    id.clone(),
                    Arc::new(ExchangeBreaker::new(id.clone(), breaker_config.clone())),
                )
            })
            .collect();

        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_watchers));

        let monitor = Self {
            config,
            gateways,
            breakers,
            semaphore,
            queue_tx,
            shutdown_tx,
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            stats: Arc::new(MonitorStats::default()),
        };
        (monitor, queue_rx)
    }

    pub fn stats(&self) -> Arc<MonitorStats> {
        self.stats.clone()
    }

    pub fn breaker(&self, exchange_id: &str) -> Option<Arc<ExchangeBreaker>> {
        self.breakers.get(exchange_id).cloned()
    }

    /// Spawn watch loops for every pair in the given universe.
    pub async fn start(&self, universe: &CommonSymbolSet) {
        let entries = universe.watch_entries();
        info!(
            pairs = entries.len(),
            limit = self.config.max_concurrent_watchers,
            mode = ?self.config.mode,
            "starting watch loops"
        );
        self.watch(entries).await;
    }

    /// Spawn one watch loop per entry. Entries for venues without a
    /// gateway are skipped with a warning.
    pub async fn watch(&self, entries: Vec<WatchEntry>) {
        let mut tasks = self.tasks.lock().await;
        for entry in entries {
            let Some(gateway) = self.gateways.get(&entry.exchange_id) else {
                warn!(exchange = %entry.exchange_id, "no gateway for watch entry, skipping");
                continue;
            };
            let Some(breaker) = self.breakers.get(&entry.exchange_id) else {
                continue;
            };
            let ctx = Arc::new(WatchContext {
                gateway: gateway.clone(),
                breaker: breaker.clone(),
                semaphore: self.semaphore.clone(),
                queue_tx: self.queue_tx.clone(),
                stats: self.stats.clone(),
                mode: self.config.mode,
                poll_interval: self.config.poll_interval,
                queue_send_timeout: self.config.queue_send_timeout,
                backoff: BackoffPolicy::new(self.config.backoff_base, self.config.backoff_max),
            });
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.spawn(watch_loop(ctx, entry, shutdown_rx));
        }
    }

    /// Cooperative shutdown: signal every loop, then wait for all of them
    /// to exit. Connections are back in their pools when this returns.
    pub async fn stop(&self) {
        info!("stopping price monitor");
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        info!("price monitor stopped");
    }
}

enum SessionEnd {
    /// Shutdown was signalled during the session
    Shutdown,
    /// The session ended on an error after delivering some ticks
    Failed { delivered: u64 },
}

async fn watch_loop(ctx: Arc<WatchContext>, entry: WatchEntry, mut shutdown: watch::Receiver<bool>) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            return;
        }

        // Venue in cool-down: wait it out without touching the venue
        if !ctx.breaker.is_available() {
            let wait = ctx
                .breaker
                .cooldown_remaining()
                .unwrap_or_else(|| Duration::from_millis(500))
                .min(Duration::from_secs(1))
                .max(Duration::from_millis(50));
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = sleep(wait) => {}
            }
            continue;
        }

        // One semaphore slot per active session
        let permit = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
            permit = ctx.semaphore.clone().acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
        };

        ctx.stats.active_watchers.fetch_add(1, Ordering::Relaxed);
        let active = ctx.stats.active_watchers.load(Ordering::Relaxed);
        ctx.stats
            .peak_active_watchers
            .fetch_max(active, Ordering::Relaxed);

        let outcome = match ctx.mode {
            MonitorMode::Stream => stream_session(&ctx, &entry, &mut shutdown).await,
            MonitorMode::Poll => poll_session(&ctx, &entry, &mut shutdown).await,
        };

        ctx.stats.active_watchers.fetch_sub(1, Ordering::Relaxed);
        drop(permit);

        match outcome {
            SessionEnd::Shutdown => return,
            SessionEnd::Failed { delivered } => {
                // A session that produced ticks starts the backoff ladder
                // over; a session that never connected climbs it
                attempt = if delivered > 0 { 1 } else { attempt.saturating_add(1) };
                ctx.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                ctx.breaker.record_failure();

                let delay = ctx.backoff.delay(attempt);
                debug!(
                    exchange = %entry.exchange_id,
                    symbol = %entry.symbol,
                    attempt,
                    ?delay,
                    "watch loop reconnecting after backoff"
                );
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

/// Read ticks from a leased stream until an error or shutdown.
async fn stream_session(
    ctx: &WatchContext,
    entry: &WatchEntry,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut lease = match ctx.gateway.open_stream(&entry.symbol).await {
        Ok(lease) => lease,
        Err(e) => {
            warn!(
                exchange = %entry.exchange_id,
                symbol = %entry.symbol,
                "failed to open stream: {}",
                e
            );
            return SessionEnd::Failed { delivered: 0 };
        }
    };

    let mut delivered = 0u64;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    lease.release();
                    return SessionEnd::Shutdown;
                }
            }
            result = lease.next_tick() => match result {
                Ok(tick) => {
                    delivered += 1;
                    ctx.breaker.record_success();
                    ctx.stats.ticks_received.fetch_add(1, Ordering::Relaxed);
                    enqueue(ctx, tick).await;
                }
                Err(e) => {
                    debug!(
                        exchange = %entry.exchange_id,
                        symbol = %entry.symbol,
                        "stream read failed: {}",
                        e
                    );
                    lease.mark_unhealthy();
                    lease.release();
                    return SessionEnd::Failed { delivered };
                }
            }
        }
    }
}

/// Snapshot fallback for venues with hostile stream limits: fetch a REST
/// ticker on a fixed cadence through the same pool and queue path.
async fn poll_session(
    ctx: &WatchContext,
    entry: &WatchEntry,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let mut delivered = 0u64;
    let mut ticker = tokio::time::interval(ctx.poll_interval);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return SessionEnd::Shutdown;
                }
            }
            _ = ticker.tick() => {
                match ctx.gateway.fetch_snapshot(&entry.symbol).await {
                    Ok(tick) => {
                        delivered += 1;
                        ctx.breaker.record_success();
                        ctx.stats.ticks_received.fetch_add(1, Ordering::Relaxed);
                        enqueue(ctx, tick).await;
                    }
                    Err(e) => {
                        debug!(
                            exchange = %entry.exchange_id,
                            symbol = %entry.symbol,
                            "snapshot poll failed: {}",
                            e
                        );
                        return SessionEnd::Failed { delivered };
                    }
                }
            }
        }
    }
}

/// Push a tick onto the batch queue, blocking briefly on overflow and
/// dropping (with a counter) if the queue stays full.
async fn enqueue(ctx: &WatchContext, tick: Tick) {
    match tokio::time::timeout(ctx.queue_send_timeout, ctx.queue_tx.send(tick)).await {
        Ok(Ok(())) => {}
        Ok(Err(_)) => {
            // Receiver gone; only happens during shutdown
            ctx.stats.ticks_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(_) => {
            ctx.stats.ticks_dropped.fetch_add(1, Ordering::Relaxed);
            debug!("batch queue full, tick dropped");
        }
    }
}
