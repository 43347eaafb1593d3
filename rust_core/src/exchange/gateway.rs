//! Per-exchange facade over the connection pools.
//!
//! The gateway hides pooling and symbol-format details from the monitor:
//! snapshots and stream subscriptions check a connection out, use it, and
//! always hand it back, on the error path included. Symbol validity
//! checks are memoized per canonical symbol for the process lifetime,
//! until the catalog is explicitly refreshed.

use super::{ExchangeConnector, ExchangeSession};
use crate::errors::{ExchangeError, GatewayError};
use crate::pool::{ConnectionPoolManager, PooledConnection};
use crate::types::{ConnectionKind, Instrument, Tick};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Facade for one venue: symbol validation, snapshots and streams with
/// pooled connections.
pub struct ExchangeGateway {
    exchange_id: String,
    connector: Arc<dyn ExchangeConnector>,
    pools: Arc<ConnectionPoolManager>,
    /// Memoized validity verdicts per canonical symbol
    validity: RwLock<HashMap<String, bool>>,
    /// Active symbols from the last catalog load, lazily populated
    catalog: tokio::sync::Mutex<Option<HashSet<String>>>,
}

impl ExchangeGateway {
    pub fn new(connector: Arc<dyn ExchangeConnector>, pools: Arc<ConnectionPoolManager>) -> Self {
        Self {
            exchange_id: connector.exchange_id().to_string(),
            connector,
            pools,
            validity: RwLock::new(HashMap::new()),
            catalog: tokio::sync::Mutex::new(None),
        }
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    /// Venue wire format for a canonical symbol.
    pub fn to_venue_symbol(&self, symbol: &str) -> String {
        self.connector.to_venue_symbol(symbol)
    }

    /// Seed the catalog from instruments that were already fetched
    /// elsewhere, avoiding a second venue round-trip.
    pub async fn prime_catalog(&self, instruments: &[Instrument]) {
        let symbols: HashSet<String> = instruments
            .iter()
            .filter(|i| i.active)
            .map(|i| i.symbol.clone())
            .collect();
        *self.catalog.lock().await = Some(symbols);
    }

    /// Drop the memoized catalog and validity verdicts. The next
    /// validation will refetch the catalog.
    pub async fn invalidate_catalog(&self) {
        *self.catalog.lock().await = None;
        self.validity.write().clear();
        debug!(exchange = %self.exchange_id, "catalog and validity cache invalidated");
    }

    /// Whether the symbol is actively tradable on this venue.
    ///
    /// The verdict is memoized: the first miss consults the catalog
    /// (fetching it if needed) and later calls for the same symbol never
    /// touch the venue again until `invalidate_catalog`.
    pub async fn validate_symbol(&self, symbol: &str) -> Result<bool, ExchangeError> {
        if let Some(valid) = self.validity.read().get(symbol) {
            return Ok(*valid);
        }

        let mut catalog = self.catalog.lock().await;
        if catalog.is_none() {
            let instruments = self.connector.load_catalog().await?;
            let symbols: HashSet<String> = instruments
                .iter()
                .filter(|i| i.active)
                .map(|i| i.symbol.clone())
                .collect();
            *catalog = Some(symbols);
        }
        let valid = catalog
            .as_ref()
            .map(|set| set.contains(symbol))
            .unwrap_or(false);
        drop(catalog);

        self.validity.write().insert(symbol.to_string(), valid);
        Ok(valid)
    }

    /// Fetch a fresh ticker snapshot through a pooled request connection.
    /// The connection is returned on every path.
    pub async fn fetch_snapshot(&self, symbol: &str) -> Result<Tick, GatewayError> {
        let mut conn = self
            .pools
            .acquire(&self.exchange_id, ConnectionKind::Rest)
            .await?;

        let result = conn.session_mut().fetch_snapshot(symbol).await;
        if matches!(result, Err(ExchangeError::Transport { .. })) {
            conn.mark_unhealthy();
        }
        self.pools.release(conn);
        Ok(result?)
    }

    /// Open a subscribed ticker stream through a pooled stream
    /// connection. The returned lease gives the stream back to the pool
    /// on release or drop.
    pub async fn open_stream(&self, symbol: &str) -> Result<StreamLease, GatewayError> {
        let mut conn = self
            .pools
            .acquire(&self.exchange_id, ConnectionKind::Stream)
            .await?;

        if let Err(e) = conn.session_mut().subscribe(symbol).await {
            conn.mark_unhealthy();
            self.pools.release(conn);
            return Err(e.into());
        }

        Ok(StreamLease {
            conn: Some(conn),
            pools: self.pools.clone(),
        })
    }
}

/// A checked-out, subscribed stream connection.
///
/// The lease owns the connection exclusively; dropping it returns the
/// connection to the pool, so a panicking or early-returning caller can
/// never leak a slot.
pub struct StreamLease {
    conn: Option<PooledConnection>,
    pools: Arc<ConnectionPoolManager>,
}

impl StreamLease {
    /// Wait for the next tick on this stream. Transport errors mark the
    /// underlying connection unhealthy so the pool will close it instead
    /// of shelving it.
    pub async fn next_tick(&mut self) -> Result<Tick, ExchangeError> {
        let conn = self
            .conn
            .as_mut()
            .expect("stream lease used after release");
        let result = conn.session_mut().next_tick().await;
        if matches!(result, Err(ExchangeError::Transport { .. })) {
            conn.mark_unhealthy();
        }
        result
    }

    pub fn mark_unhealthy(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_unhealthy();
        }
    }

    /// Return the connection to its pool.
    pub fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pools.release(conn);
        }
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                exchange = %conn.exchange_id,
                "stream lease dropped without release; returning connection"
            );
            self.pools.release(conn);
        }
    }
}
