//! In-process cache backend. Fast, no durability.

use super::CacheSink;
use crate::errors::CacheError;
use crate::types::{Tick, TickKey};
use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::time::Duration;

/// Latest ticks in an in-process map with TTL checked on read.
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<FxHashMap<TickKey, Tick>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop TTL-expired entries. The map is otherwise bounded by the
    /// universe size, so this is optional housekeeping.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, tick| !tick.is_stale(self.ttl));
        before - entries.len()
    }
}

#[async_trait]
impl CacheSink for MemoryCache {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put_many(&self, ticks: &[Tick]) -> Result<(), CacheError> {
        let mut entries = self.entries.write();
        for tick in ticks {
            let key = tick.key();
            match entries.get(&key) {
                // An older observation never overwrites a newer one
                Some(existing) if existing.observed_at > tick.observed_at => {}
                _ => {
                    entries.insert(key, tick.clone());
                }
            }
        }
        Ok(())
    }

    async fn get_latest(&self, key: &TickKey) -> Result<Option<Tick>, CacheError> {
        let entries = self.entries.read();
        Ok(entries
            .get(key)
            .filter(|tick| !tick.is_stale(self.ttl))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::tick_at;
    use super::*;

    #[tokio::test]
    async fn test_last_write_wins_regardless_of_order() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        let key = TickKey::new("binance", "BTC/USDT");

        // Newest observation arrives in the middle of the interleaving
        cache
            .put_many(&[tick_at("binance", "BTC/USDT", 100.0, -300)])
            .await
            .unwrap();
        cache
            .put_many(&[tick_at("binance", "BTC/USDT", 103.0, -100)])
            .await
            .unwrap();
        cache
            .put_many(&[tick_at("binance", "BTC/USDT", 101.0, -200)])
            .await
            .unwrap();

        let latest = cache.get_latest(&key).await.unwrap().unwrap();
        assert_eq!(latest.last, 103.0);
    }

    #[tokio::test]
    async fn test_ttl_expires_reads() {
        let cache = MemoryCache::new(Duration::from_millis(50));
        let key = TickKey::new("binance", "BTC/USDT");

        cache
            .put_many(&[tick_at("binance", "BTC/USDT", 100.0, 0)])
            .await
            .unwrap();
        assert!(cache.get_latest(&key).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cache.get_latest(&key).await.unwrap().is_none());
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let cache = MemoryCache::new(Duration::from_secs(60));
        cache
            .put_many(&[
                tick_at("binance", "BTC/USDT", 100.0, 0),
                tick_at("okx", "BTC/USDT", 101.0, 0),
            ])
            .await
            .unwrap();

        let binance = cache
            .get_latest(&TickKey::new("binance", "BTC/USDT"))
            .await
            .unwrap()
            .unwrap();
        let okx = cache
            .get_latest(&TickKey::new("okx", "BTC/USDT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binance.last, 100.0);
        assert_eq!(okx.last, 101.0);
    }
}
