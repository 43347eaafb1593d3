//! Error taxonomy for the aggregation core.
//!
//! Per-exchange and per-symbol failures are isolated by design: a catalog
//! fetch error excludes one venue from one resolution round, a transport
//! error sends one watch loop through backoff, a cache write error is
//! retried on the next drain. None of them are fatal to the process.

use crate::types::ConnectionKind;
use std::time::Duration;
use thiserror::Error;

/// Failures at the exchange boundary.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Instrument catalog could not be fetched. Non-fatal: the venue is
    /// excluded from the current resolution round.
    #[error("catalog fetch failed for {exchange}: {source}")]
    Catalog {
        exchange: String,
        #[source]
        source: anyhow::Error,
    },

    /// Transport-level failure on a live connection (socket closed,
    /// request timed out, TLS error). Triggers backoff-and-reconnect.
    #[error("transport error on {exchange}: {message}")]
    Transport { exchange: String, message: String },

    /// The venue answered, but with something we cannot interpret.
    #[error("protocol error on {exchange}: {message}")]
    Protocol { exchange: String, message: String },

    #[error("no connector registered for exchange: {0}")]
    UnknownExchange(String),

    #[error("symbol {symbol} is not tradable on {exchange}")]
    UnknownSymbol { exchange: String, symbol: String },
}

impl ExchangeError {
    pub fn transport(exchange: impl Into<String>, message: impl ToString) -> Self {
        ExchangeError::Transport {
            exchange: exchange.into(),
            message: message.to_string(),
        }
    }

    pub fn protocol(exchange: impl Into<String>, message: impl ToString) -> Self {
        ExchangeError::Protocol {
            exchange: exchange.into(),
            message: message.to_string(),
        }
    }

    /// Whether reconnecting could plausibly clear the failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExchangeError::Transport { .. } | ExchangeError::Catalog { .. })
    }
}

/// Failures from the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Every slot is busy and none freed up within the acquire timeout.
    /// Callers may retry.
    #[error("pool exhausted for {exchange}/{kind} after waiting {waited:?}")]
    Exhausted {
        exchange: String,
        kind: ConnectionKind,
        waited: Duration,
    },

    /// The pool was shut down while the caller was waiting.
    #[error("pool closed for {exchange}/{kind}")]
    Closed {
        exchange: String,
        kind: ConnectionKind,
    },

    /// Creating a fresh connection failed.
    #[error("connect failed: {0}")]
    Connect(#[from] ExchangeError),
}

/// Failures surfaced by a gateway operation: either the pool could not
/// hand out a connection, or the venue call itself failed.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Pool(PoolError::Exhausted { .. }) => true,
            GatewayError::Pool(PoolError::Connect(e)) => e.is_transient(),
            GatewayError::Pool(PoolError::Closed { .. }) => false,
            GatewayError::Exchange(e) => e.is_transient(),
        }
    }
}

/// Failures from a cache backend. Logged and retried on the next drain
/// cycle; never propagated into the monitor.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("cache i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("redis cache operation failed: {0}")]
    Redis(#[from] redis::RedisError),
}
