//! Scripted mock venues for unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests). A [`MockExchange`] serves a fixed catalog and
//! produces synthetic ticks on a configurable cadence; its streams can be
//! told to fail every K reads to exercise the reconnect path. Counters on
//! the shared state let tests observe connection churn from the outside.

use crate::errors::ExchangeError;
use crate::exchange::{ExchangeConnector, ExchangeSession};
use crate::types::{ConnectionKind, Instrument, MarketType, Tick};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Observable side of a mock venue, shared by all its sessions.
#[derive(Debug, Default)]
pub struct MockState {
    pub catalog_loads: AtomicU64,
    pub sessions_opened: AtomicU64,
    pub active_streams: AtomicUsize,
    pub peak_active_streams: AtomicUsize,
    pub ticks_produced: AtomicU64,
}

/// A scripted venue.
pub struct MockExchange {
    id: String,
    instruments: Vec<Instrument>,
    /// Constant quote every tick carries: (bid, ask)
    quotes: (f64, f64),
    tick_interval: Duration,
    /// Streams error after this many reads per session
    fail_stream_every: Option<u64>,
    fail_catalog: bool,
    fail_ping: bool,
    state: Arc<MockState>,
    sequence: Arc<AtomicU64>,
}

impl MockExchange {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            instruments: Vec::new(),
            quotes: (99.5, 100.5),
            tick_interval: Duration::from_millis(5),
            fail_stream_every: None,
            fail_catalog: false,
            fail_ping: false,
            state: Arc::new(MockState::default()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_spot(mut self, base: &str, quote: &str) -> Self {
        self.instruments
            .push(Instrument::new(self.id.clone(), base, quote, MarketType::Spot, true));
        self
    }

    pub fn with_instrument(mut self, instrument: Instrument) -> Self {
        self.instruments.push(instrument);
        self
    }

    pub fn with_quotes(mut self, bid: f64, ask: f64) -> Self {
        self.quotes = (bid, ask);
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Make every stream session fail after `k` delivered ticks.
    pub fn fail_stream_every(mut self, k: u64) -> Self {
        self.fail_stream_every = Some(k);
        self
    }

    pub fn fail_catalog(mut self) -> Self {
        self.fail_catalog = true;
        self
    }

    pub fn fail_ping(mut self) -> Self {
        self.fail_ping = true;
        self
    }

    pub fn state(&self) -> Arc<MockState> {
        self.state.clone()
    }
}

#[async_trait]
impl ExchangeConnector for MockExchange {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    fn to_venue_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "")
    }

    async fn load_catalog(&self) -> Result<Vec<Instrument>, ExchangeError> {
        self.state.catalog_loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_catalog {
            return Err(ExchangeError::Catalog {
                exchange: self.id.clone(),
                source: anyhow::anyhow!("scripted catalog failure"),
            });
        }
        Ok(self.instruments.clone())
    }

    async fn connect(
        &self,
        kind: ConnectionKind,
    ) -> Result<Box<dyn ExchangeSession>, ExchangeError> {
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        if kind == ConnectionKind::Stream {
            let active = self.state.active_streams.fetch_add(1, Ordering::SeqCst) + 1;
            self.state
                .peak_active_streams
                .fetch_max(active, Ordering::SeqCst);
        }
        Ok(Box::new(MockSession {
            exchange_id: self.id.clone(),
            kind,
            quotes: self.quotes,
            tick_interval: self.tick_interval,
            fail_stream_every: self.fail_stream_every,
            fail_ping: self.fail_ping,
            reads_this_session: 0,
            subscribed: None,
            state: self.state.clone(),
            sequence: self.sequence.clone(),
            closed: false,
        }))
    }
}

pub struct MockSession {
    exchange_id: String,
    kind: ConnectionKind,
    quotes: (f64, f64),
    tick_interval: Duration,
    fail_stream_every: Option<u64>,
    fail_ping: bool,
    reads_this_session: u64,
    subscribed: Option<(String, String, MarketType)>,
    state: Arc<MockState>,
    sequence: Arc<AtomicU64>,
    closed: bool,
}

impl MockSession {
    fn make_tick(&self, symbol: &str, quote: &str, market_type: MarketType) -> Tick {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        self.state.ticks_produced.fetch_add(1, Ordering::SeqCst);
        let (bid, ask) = self.quotes;
        Tick {
            exchange_id: self.exchange_id.clone(),
            symbol: symbol.to_string(),
            market_type,
            quote: quote.to_string(),
            last: (bid + ask) / 2.0,
            bid,
            ask,
            base_volume: seq as f64,
            observed_at: Utc::now(),
        }
    }

    fn split(symbol: &str) -> (String, MarketType) {
        match symbol.split_once('/') {
            Some((_, rest)) => match rest.split_once(':') {
                Some((quote, _)) => (quote.to_string(), MarketType::Swap),
                None => (rest.to_string(), MarketType::Spot),
            },
            None => ("USDT".to_string(), MarketType::Spot),
        }
    }

    fn release_stream_slot(&mut self) {
        if self.kind == ConnectionKind::Stream && !self.closed {
            self.closed = true;
            self.state.active_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl ExchangeSession for MockSession {
    fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    fn kind(&self) -> ConnectionKind {
        self.kind
    }

    async fn fetch_snapshot(&mut self, symbol: &str) -> Result<Tick, ExchangeError> {
        if self.kind != ConnectionKind::Rest {
            return Err(ExchangeError::protocol(
                &self.exchange_id,
                "snapshot requested on a stream handle",
            ));
        }
        tokio::time::sleep(self.tick_interval).await;
        let (quote, market_type) = Self::split(symbol);
        Ok(self.make_tick(symbol, &quote, market_type))
    }

    async fn subscribe(&mut self, symbol: &str) -> Result<(), ExchangeError> {
        if self.kind != ConnectionKind::Stream {
            return Err(ExchangeError::protocol(
                &self.exchange_id,
                "subscribe requested on a rest handle",
            ));
        }
        let (quote, market_type) = Self::split(symbol);
        self.subscribed = Some((symbol.to_string(), quote, market_type));
        // A fresh subscription reads from a clean failure budget
        self.reads_this_session = 0;
        Ok(())
    }

    async fn next_tick(&mut self) -> Result<Tick, ExchangeError> {
        let (symbol, quote, market_type) = match &self.subscribed {
            Some((s, q, m)) => (s.clone(), q.clone(), *m),
            None => {
                return Err(ExchangeError::protocol(
                    &self.exchange_id,
                    "next_tick called before subscribe",
                ))
            }
        };
        tokio::time::sleep(self.tick_interval).await;

        self.reads_this_session += 1;
        if let Some(k) = self.fail_stream_every {
            if self.reads_this_session > k {
                return Err(ExchangeError::transport(
                    &self.exchange_id,
                    "scripted stream failure",
                ));
            }
        }
        Ok(self.make_tick(&symbol, &quote, market_type))
    }

    async fn ping(&mut self) -> Result<(), ExchangeError> {
        if self.fail_ping {
            return Err(ExchangeError::transport(
                &self.exchange_id,
                "scripted ping failure",
            ));
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.release_stream_slot();
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.release_stream_slot();
    }
}

/// Connector whose `connect` always fails; for pool error-path tests.
pub struct UnreachableExchange {
    id: String,
}

impl UnreachableExchange {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl ExchangeConnector for UnreachableExchange {
    fn exchange_id(&self) -> &str {
        &self.id
    }

    fn to_venue_symbol(&self, symbol: &str) -> String {
        symbol.replace('/', "")
    }

    async fn load_catalog(&self) -> Result<Vec<Instrument>, ExchangeError> {
        Err(ExchangeError::Catalog {
            exchange: self.id.clone(),
            source: anyhow::anyhow!("venue unreachable"),
        })
    }

    async fn connect(
        &self,
        _kind: ConnectionKind,
    ) -> Result<Box<dyn ExchangeSession>, ExchangeError> {
        Err(ExchangeError::transport(&self.id, "venue unreachable"))
    }
}
