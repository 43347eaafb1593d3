//! Pluggable persistence of the latest tick per (exchange, symbol).
//!
//! The monitor and batch writer only ever talk to the [`CacheSink`]
//! trait; which backend is live is a configuration decision. Backends:
//! in-process map (no durability), JSON files on disk, an external Redis
//! service, or a null sink that drops everything.
//!
//! Semantics are last-write-wins per key by `observed_at`, with a TTL
//! after which reads return nothing. There is exactly one writer (the
//! batch drain task); everything else is read-only.

use crate::config::{CacheBackend, CacheConfig};
use crate::errors::CacheError;
use crate::types::{Tick, TickKey};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub mod disk;
pub mod memory;
pub mod redis;

pub use disk::DiskCache;
pub use memory::MemoryCache;
pub use redis::RedisCache;

/// Latest-tick store keyed by (exchange, symbol).
#[async_trait]
pub trait CacheSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bulk write one drained batch. Later entries for the same key win
    /// within the batch.
    async fn put_many(&self, ticks: &[Tick]) -> Result<(), CacheError>;

    /// Latest tick for a key, or `None` when absent or TTL-expired.
    async fn get_latest(&self, key: &TickKey) -> Result<Option<Tick>, CacheError>;
}

/// Sink that drops every write. Useful when running the monitor purely
/// for its side channels (logs, stats) without a detector.
pub struct NullCache;

#[async_trait]
impl CacheSink for NullCache {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn put_many(&self, _ticks: &[Tick]) -> Result<(), CacheError> {
        Ok(())
    }

    async fn get_latest(&self, _key: &TickKey) -> Result<Option<Tick>, CacheError> {
        Ok(None)
    }
}

/// Build the configured sink. Only the Redis backend performs I/O here
/// (it connects eagerly so misconfiguration fails at startup).
pub async fn build_sink(config: &CacheConfig) -> anyhow::Result<Arc<dyn CacheSink>> {
    let sink: Arc<dyn CacheSink> = match config.backend {
        CacheBackend::Memory => Arc::new(MemoryCache::new(config.ttl)),
        CacheBackend::Disk => Arc::new(DiskCache::new(config.disk_dir.clone(), config.ttl).await?),
        CacheBackend::Redis => Arc::new(
            RedisCache::connect(&config.redis_url, config.key_prefix.clone(), config.ttl).await?,
        ),
        CacheBackend::None => Arc::new(NullCache),
    };
    info!(backend = sink.name(), "cache sink ready");
    Ok(sink)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketType;
    use chrono::Utc;

    pub(crate) fn tick_at(exchange: &str, symbol: &str, last: f64, offset_ms: i64) -> Tick {
        Tick {
            exchange_id: exchange.to_string(),
            symbol: symbol.to_string(),
            market_type: MarketType::Spot,
            quote: "USDT".to_string(),
            last,
            bid: last - 0.5,
            ask: last + 0.5,
            base_volume: 1.0,
            observed_at: Utc::now() + chrono::Duration::milliseconds(offset_ms),
        }
    }

    #[tokio::test]
    async fn test_null_cache_reads_nothing() {
        let sink = NullCache;
        let tick = tick_at("binance", "BTC/USDT", 100.0, 0);
        sink.put_many(&[tick.clone()]).await.unwrap();
        assert!(sink.get_latest(&tick.key()).await.unwrap().is_none());
    }
}
