//! Cross-exchange opportunity scanning.
//!
//! On a fixed interval the detector walks the current symbol universe,
//! reads the latest cached tick per venue, and compares the best bid and
//! best ask across venues. A crossed market (highest bid above lowest
//! ask on a *different* venue) becomes an [`ArbitrageCandidate`] on the
//! outbound channel. Risk filtering, sizing and execution live entirely
//! downstream.

use crate::cache::CacheSink;
use crate::config::DetectorConfig;
use crate::types::{ArbitrageCandidate, Tick, TickKey};
use crate::universe::UniverseResolver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct DetectorStats {
    pub scans: AtomicU64,
    pub candidates_emitted: AtomicU64,
}

/// Periodic scanner over the cache sink.
pub struct OpportunityDetector {
    config: DetectorConfig,
    sink: Arc<dyn CacheSink>,
    resolver: Arc<UniverseResolver>,
    candidates_tx: mpsc::Sender<ArbitrageCandidate>,
    stats: Arc<DetectorStats>,
}

impl OpportunityDetector {
    pub fn new(
        config: DetectorConfig,
        sink: Arc<dyn CacheSink>,
        resolver: Arc<UniverseResolver>,
        candidates_tx: mpsc::Sender<ArbitrageCandidate>,
    ) -> Self {
        Self {
            config,
            sink,
            resolver,
            candidates_tx,
            stats: Arc::new(DetectorStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<DetectorStats> {
        self.stats.clone()
    }

    /// Scan on the configured interval until shutdown flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(
            interval_ms = self.config.scan_interval.as_millis() as u64,
            "opportunity detector started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("opportunity detector stopped");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
            }
        }
    }

    /// One pass over the universe. Emits at most one candidate per
    /// symbol and returns everything emitted, for callers that scan on
    /// demand.
    pub async fn scan_once(&self) -> Vec<ArbitrageCandidate> {
        self.stats.scans.fetch_add(1, Ordering::Relaxed);
        let universe = self.resolver.current();
        let mut emitted = Vec::new();

        for (_key, symbols) in universe.buckets() {
            for symbol in symbols {
                let mut ticks = Vec::with_capacity(universe.exchanges.len());
                for exchange_id in &universe.exchanges {
                    let tick_key = TickKey::new(exchange_id.clone(), symbol.clone());
                    match self.sink.get_latest(&tick_key).await {
                        Ok(Some(tick)) => {
                            if !tick.is_stale(self.config.max_tick_age) {
                                ticks.push(tick);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(key = %tick_key, "cache read failed during scan: {}", e);
                        }
                    }
                }

                if let Some(candidate) =
                    best_cross(&ticks, self.config.min_spread_pct)
                {
                    debug!(
                        symbol = %candidate.symbol,
                        buy = %candidate.buy_exchange,
                        sell = %candidate.sell_exchange,
                        spread = candidate.spread,
                        "arbitrage candidate"
                    );
                    self.stats.candidates_emitted.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = self.candidates_tx.try_send(candidate.clone()) {
                        warn!("candidate channel full or closed, dropping: {}", e);
                    }
                    emitted.push(candidate);
                }
            }
        }
        emitted
    }
}

/// Best crossed market across venues for one symbol's ticks, if any.
///
/// Buys at the venue with the lowest ask, sells at the venue with the
/// highest bid. A single venue crossing itself is a book artifact, not an
/// opportunity, and is skipped.
fn best_cross(ticks: &[Tick], min_spread_pct: f64) -> Option<ArbitrageCandidate> {
    if ticks.len() < 2 {
        return None;
    }

    let mut best_bid: Option<&Tick> = None;
    let mut best_ask: Option<&Tick> = None;
    for tick in ticks {
        if tick.bid <= 0.0 || tick.ask <= 0.0 {
            continue;
        }
        if best_bid.map(|t| tick.bid > t.bid).unwrap_or(true) {
            best_bid = Some(tick);
        }
        if best_ask.map(|t| tick.ask < t.ask).unwrap_or(true) {
            best_ask = Some(tick);
        }
    }

    let (bid_tick, ask_tick) = (best_bid?, best_ask?);
    if bid_tick.exchange_id == ask_tick.exchange_id {
        return None;
    }
    if bid_tick.bid <= ask_tick.ask {
        return None;
    }

    let candidate = ArbitrageCandidate::new(
        ask_tick.symbol.clone(),
        ask_tick.market_type,
        ask_tick.quote.clone(),
        ask_tick.exchange_id.clone(),
        ask_tick.ask,
        bid_tick.exchange_id.clone(),
        bid_tick.bid,
    );
    if candidate.spread_pct < min_spread_pct {
        return None;
    }
    Some(candidate)
}
