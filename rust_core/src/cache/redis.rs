//! Redis cache backend.
//!
//! Batched writes go through a single pipeline per drain (`SET` with
//! `EX`), so a batch costs one round-trip and Redis expires stale keys by
//! itself. The connection manager reconnects transparently; a drain that
//! races a broken connection surfaces a `CacheError` and the batch is
//! retried on the next cycle.

use super::CacheSink;
use crate::errors::CacheError;
use crate::types::{Tick, TickKey};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Client;
use std::time::Duration;
use tracing::debug;

/// Latest ticks in an external Redis service.
pub struct RedisCache {
    manager: ConnectionManager,
    key_prefix: String,
    ttl_secs: u64,
}

impl RedisCache {
    /// Connect eagerly so a bad URL fails at startup rather than on the
    /// first drain.
    pub async fn connect(
        url: &str,
        key_prefix: String,
        ttl: Duration,
    ) -> Result<Self, CacheError> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        debug!("redis cache connected");
        Ok(Self {
            manager,
            key_prefix,
            ttl_secs: ttl.as_secs().max(1),
        })
    }

    fn redis_key(&self, key: &TickKey) -> String {
        format!("{}:{}:{}", self.key_prefix, key.exchange_id, key.symbol)
    }
}

#[async_trait]
impl CacheSink for RedisCache {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put_many(&self, ticks: &[Tick]) -> Result<(), CacheError> {
        if ticks.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for tick in ticks {
            let payload = serde_json::to_string(tick)?;
            pipe.cmd("SET")
                .arg(self.redis_key(&tick.key()))
                .arg(payload)
                .arg("EX")
                .arg(self.ttl_secs)
                .ignore();
        }
        let mut conn = self.manager.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_latest(&self, key: &TickKey) -> Result<Option<Tick>, CacheError> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.redis_key(key))
            .query_async(&mut conn)
            .await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::tick_at;
    use super::*;

    #[tokio::test]
    #[ignore] // Requires a running Redis server
    async fn test_round_trip_with_expiry() {
        let cache = RedisCache::connect(
            "redis://localhost:6379",
            "spreadscan:test".to_string(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let tick = tick_at("binance", "BTC/USDT", 100.5, 0);
        cache.put_many(&[tick.clone()]).await.unwrap();

        let latest = cache.get_latest(&tick.key()).await.unwrap().unwrap();
        assert_eq!(latest.last, 100.5);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.get_latest(&tick.key()).await.unwrap().is_none());
    }
}
