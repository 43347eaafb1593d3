//! On-disk cache backend: one JSON record per key under a cache
//! directory. Survives restarts; intended for dashboards and debugging,
//! not for high-frequency workloads.

use super::CacheSink;
use crate::errors::CacheError;
use crate::types::{Tick, TickKey};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// File-per-key JSON store.
pub struct DiskCache {
    dir: PathBuf,
    ttl: Duration,
}

impl DiskCache {
    pub async fn new(dir: PathBuf, ttl: Duration) -> Result<Self, CacheError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir, ttl })
    }

    fn path_for(&self, key: &TickKey) -> PathBuf {
        // '/' and ':' from canonical symbols are not filename-safe
        let file = format!(
            "{}__{}.json",
            key.exchange_id,
            key.symbol.replace('/', "-").replace(':', "_")
        );
        self.dir.join(file)
    }

    async fn read_record(&self, path: &PathBuf) -> Result<Option<Tick>, CacheError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CacheSink for DiskCache {
    fn name(&self) -> &'static str {
        "disk"
    }

    async fn put_many(&self, ticks: &[Tick]) -> Result<(), CacheError> {
        for tick in ticks {
            let path = self.path_for(&tick.key());
            // An older observation never overwrites a newer one
            if let Some(existing) = self.read_record(&path).await? {
                if existing.observed_at > tick.observed_at {
                    continue;
                }
            }
            let payload = serde_json::to_vec(tick)?;
            fs::write(&path, payload).await?;
        }
        Ok(())
    }

    async fn get_latest(&self, key: &TickKey) -> Result<Option<Tick>, CacheError> {
        let path = self.path_for(key);
        Ok(self
            .read_record(&path)
            .await?
            .filter(|tick| !tick.is_stale(self.ttl)))
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::tick_at;
    use super::*;
    use uuid::Uuid;

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("spreadscan-cache-test-{}", Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_round_trip_and_last_write_wins() {
        let dir = scratch_dir();
        let cache = DiskCache::new(dir.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        let key = TickKey::new("okx", "BTC/USDT");

        cache
            .put_many(&[tick_at("okx", "BTC/USDT", 100.0, -200)])
            .await
            .unwrap();
        cache
            .put_many(&[tick_at("okx", "BTC/USDT", 105.0, -50)])
            .await
            .unwrap();
        // Late arrival of an older observation is ignored
        cache
            .put_many(&[tick_at("okx", "BTC/USDT", 101.0, -100)])
            .await
            .unwrap();

        let latest = cache.get_latest(&key).await.unwrap().unwrap();
        assert_eq!(latest.last, 105.0);

        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_missing_key_reads_none() {
        let dir = scratch_dir();
        let cache = DiskCache::new(dir.clone(), Duration::from_secs(60))
            .await
            .unwrap();
        assert!(cache
            .get_latest(&TickKey::new("okx", "NOPE/USDT"))
            .await
            .unwrap()
            .is_none());
        let _ = fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn test_swap_symbols_get_distinct_files() {
        let dir = scratch_dir();
        let cache = DiskCache::new(dir.clone(), Duration::from_secs(60))
            .await
            .unwrap();

        let mut swap = tick_at("okx", "BTC/USDT:USDT", 200.0, 0);
        swap.market_type = crate::types::MarketType::Swap;
        cache
            .put_many(&[tick_at("okx", "BTC/USDT", 100.0, 0), swap])
            .await
            .unwrap();

        let spot = cache
            .get_latest(&TickKey::new("okx", "BTC/USDT"))
            .await
            .unwrap()
            .unwrap();
        let swap = cache
            .get_latest(&TickKey::new("okx", "BTC/USDT:USDT"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(spot.last, 100.0);
        assert_eq!(swap.last, 200.0);

        let _ = fs::remove_dir_all(&dir).await;
    }
}
