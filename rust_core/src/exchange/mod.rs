//! Exchange boundary: connector trait, live sessions and the registry.
//!
//! A connector is the per-venue factory (catalog fetch, session creation,
//! symbol format translation); a session is one live handle that the
//! connection pool checks out to exactly one caller at a time. The wire
//! protocol behind a session is the venue's problem; this crate only
//! relies on the contract below.

use crate::errors::ExchangeError;
use crate::types::{ConnectionKind, Instrument, Tick};
use async_trait::async_trait;
use std::fmt;

pub mod binance;
pub mod gateway;
pub mod okx;
pub mod registry;

pub use gateway::{ExchangeGateway, StreamLease};
pub use registry::ConnectorRegistry;

/// Per-venue factory and catalog source.
///
/// Implementations must be Send + Sync for use in async contexts.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Stable lowercase identifier ("binance", "okx", ...)
    fn exchange_id(&self) -> &str;

    /// Translate a canonical `BASE/QUOTE` symbol into the venue's wire
    /// format (e.g. "BTC/USDT" -> "BTCUSDT" or "BTC-USDT").
    fn to_venue_symbol(&self, symbol: &str) -> String;

    /// Fetch the venue's full instrument catalog.
    async fn load_catalog(&self) -> Result<Vec<Instrument>, ExchangeError>;

    /// Open a fresh live handle of the given kind.
    async fn connect(&self, kind: ConnectionKind)
        -> Result<Box<dyn ExchangeSession>, ExchangeError>;
}

impl fmt::Debug for dyn ExchangeConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeConnector")
            .field("exchange_id", &self.exchange_id())
            .finish_non_exhaustive()
    }
}

/// One live handle to a venue, owned by a single caller at a time.
#[async_trait]
pub trait ExchangeSession: Send {
    fn exchange_id(&self) -> &str;

    fn kind(&self) -> ConnectionKind;

    /// Fetch the current ticker for one symbol (request-style handles).
    async fn fetch_snapshot(&mut self, symbol: &str) -> Result<Tick, ExchangeError>;

    /// Subscribe the stream to a symbol's ticker channel (stream-style
    /// handles). May be called once per session.
    async fn subscribe(&mut self, symbol: &str) -> Result<(), ExchangeError>;

    /// Block until the next tick arrives on the subscribed stream.
    async fn next_tick(&mut self) -> Result<Tick, ExchangeError>;

    /// Cheap liveness probe (server time query or protocol ping).
    async fn ping(&mut self) -> Result<(), ExchangeError>;

    /// Graceful close. Dropping a session also closes the underlying
    /// socket, so this is best-effort.
    async fn close(&mut self);
}

/// Parse a numeric string field from a venue payload, tolerating the
/// empty strings some venues send for quiet markets.
pub(crate) fn lenient_f64(raw: &str) -> f64 {
    raw.parse().unwrap_or(0.0)
}

/// Split a canonical `BASE/QUOTE` symbol.
pub(crate) fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    symbol.split_once('/')
}
