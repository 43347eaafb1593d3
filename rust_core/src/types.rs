//! Core data types shared across the aggregation pipeline.
//!
//! This module provides:
//! - Instrument and market-type records from venue catalogs
//! - Normalized price ticks and their cache keys
//! - Arbitrage candidate events handed to the strategy layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Market segment an instrument trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Swap,
    Future,
    Margin,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Swap => "swap",
            MarketType::Future => "future",
            MarketType::Margin => "margin",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MarketType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "spot" => Ok(MarketType::Spot),
            "swap" | "perp" | "perpetual" => Ok(MarketType::Swap),
            "future" | "futures" => Ok(MarketType::Future),
            "margin" => Ok(MarketType::Margin),
            other => Err(format!("unknown market type: {}", other)),
        }
    }
}

/// Which protocol a pooled connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    /// Request/response endpoint (catalog, snapshots, liveness)
    Rest,
    /// Long-lived subscription endpoint (ticker streams)
    Stream,
}

impl fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionKind::Rest => f.write_str("rest"),
            ConnectionKind::Stream => f.write_str("stream"),
        }
    }
}

/// One tradable pair as reported by a venue catalog.
///
/// Immutable once fetched; a catalog refresh produces a new vector of
/// instruments rather than mutating old ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange_id: String,
    /// Canonical symbol, `BASE/QUOTE` (e.g. "BTC/USDT")
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub market_type: MarketType,
    pub active: bool,
}

impl Instrument {
    pub fn new(
        exchange_id: impl Into<String>,
        base: impl Into<String>,
        quote: impl Into<String>,
        market_type: MarketType,
        active: bool,
    ) -> Self {
        let base = base.into();
        let quote = quote.into();
        Self {
            exchange_id: exchange_id.into(),
            symbol: format!("{}/{}", base, quote),
            base,
            quote,
            market_type,
            active,
        }
    }
}

/// Cache key for the latest tick of a symbol on one venue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TickKey {
    pub exchange_id: String,
    pub symbol: String,
}

impl TickKey {
    pub fn new(exchange_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange_id: exchange_id.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for TickKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange_id, self.symbol)
    }
}

/// One normalized price observation for a symbol on a venue.
///
/// Ticks are immutable; a newer observation for the same key supersedes
/// the older one in the cache rather than mutating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tick {
    pub exchange_id: String,
    pub symbol: String,
    pub market_type: MarketType,
    pub quote: String,
    pub last: f64,
    pub bid: f64,
    pub ask: f64,
    pub base_volume: f64,
    pub observed_at: DateTime<Utc>,
}

impl Tick {
    pub fn key(&self) -> TickKey {
        TickKey::new(self.exchange_id.clone(), self.symbol.clone())
    }

    /// Whether the observation is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.observed_at);
        age.num_milliseconds() > max_age.as_millis() as i64
    }

    pub fn mid_price(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }
}

/// A detected crossed market between two venues for the same symbol.
///
/// Ephemeral: handed to the strategy layer through a channel and never
/// persisted by this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitrageCandidate {
    pub id: Uuid,
    pub symbol: String,
    pub market_type: MarketType,
    pub quote: String,
    /// Venue with the lowest ask; buying happens here
    pub buy_exchange: String,
    pub buy_price: f64,
    /// Venue with the highest bid; selling happens here
    pub sell_exchange: String,
    pub sell_price: f64,
    /// `sell_price - buy_price`, always positive
    pub spread: f64,
    /// Spread relative to the buy price, in percent
    pub spread_pct: f64,
    pub observed_at: DateTime<Utc>,
}

impl ArbitrageCandidate {
    pub fn new(
        symbol: impl Into<String>,
        market_type: MarketType,
        quote: impl Into<String>,
        buy_exchange: impl Into<String>,
        buy_price: f64,
        sell_exchange: impl Into<String>,
        sell_price: f64,
    ) -> Self {
        let spread = sell_price - buy_price;
        let spread_pct = if buy_price > 0.0 {
            spread / buy_price * 100.0
        } else {
            0.0
        };
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            market_type,
            quote: quote.into(),
            buy_exchange: buy_exchange.into(),
            buy_price,
            sell_exchange: sell_exchange.into(),
            sell_price,
            spread,
            spread_pct,
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_type_round_trip() {
        assert_eq!("spot".parse::<MarketType>().unwrap(), MarketType::Spot);
        assert_eq!("SWAP".parse::<MarketType>().unwrap(), MarketType::Swap);
        assert_eq!("perpetual".parse::<MarketType>().unwrap(), MarketType::Swap);
        assert!("options".parse::<MarketType>().is_err());
        assert_eq!(MarketType::Future.as_str(), "future");
    }

    #[test]
    fn test_instrument_canonical_symbol() {
        let inst = Instrument::new("binance", "BTC", "USDT", MarketType::Spot, true);
        assert_eq!(inst.symbol, "BTC/USDT");
        assert_eq!(inst.base, "BTC");
        assert_eq!(inst.quote, "USDT");
    }

    #[test]
    fn test_tick_staleness() {
        let mut tick = Tick {
            exchange_id: "okx".to_string(),
            symbol: "ETH/USDT".to_string(),
            market_type: MarketType::Spot,
            quote: "USDT".to_string(),
            last: 2000.0,
            bid: 1999.5,
            ask: 2000.5,
            base_volume: 10.0,
            observed_at: Utc::now(),
        };
        assert!(!tick.is_stale(Duration::from_secs(60)));

        tick.observed_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(tick.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn test_candidate_spread() {
        let cand = ArbitrageCandidate::new(
            "BTC/USDT",
            MarketType::Spot,
            "USDT",
            "binance",
            100.6,
            "okx",
            100.8,
        );
        assert!((cand.spread - 0.2).abs() < 1e-9);
        assert!(cand.spread_pct > 0.19 && cand.spread_pct < 0.21);
    }
}
