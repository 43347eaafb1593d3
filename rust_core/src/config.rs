//! Typed configuration for the aggregation core.
//!
//! Loaded once at startup from environment variables and treated as a
//! read-only snapshot afterwards. A rebuild of the symbol universe is the
//! only hot-reload hook, and it always swaps the whole set atomically.

use crate::types::MarketType;
use anyhow::{anyhow, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Which backend the cache sink writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackend {
    /// In-process map, no durability
    Memory,
    /// One JSON record per key under a cache directory
    Disk,
    /// External Redis service
    Redis,
    /// Drop every write (detector-less runs)
    None,
}

impl CacheBackend {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" | "local" => Ok(CacheBackend::Memory),
            "disk" | "file" => Ok(CacheBackend::Disk),
            "redis" => Ok(CacheBackend::Redis),
            "none" | "off" => Ok(CacheBackend::None),
            other => Err(anyhow!("unknown cache backend: {}", other)),
        }
    }
}

/// Symbol universe resolution settings.
#[derive(Debug, Clone)]
pub struct UniverseConfig {
    pub exchanges: Vec<String>,
    pub market_types: Vec<MarketType>,
    pub quote_currencies: Vec<String>,
    /// How often catalogs are refetched and the common set rebuilt
    pub refresh_interval: Duration,
}

/// Per-exchange connection pool settings.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_rest_size: usize,
    pub max_stream_size: usize,
    pub acquire_timeout: Duration,
    pub health_check_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_rest_size: 10,
            max_stream_size: 5,
            acquire_timeout: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(3),
        }
    }
}

/// How the monitor obtains ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// WebSocket ticker subscriptions (default)
    Stream,
    /// REST snapshots on a fixed interval, for venues with hostile
    /// stream limits
    Poll,
}

/// Price monitor settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub mode: MonitorMode,
    /// Global bound on simultaneously active watch loops
    pub max_concurrent_watchers: usize,
    pub queue_capacity: usize,
    /// How long a producer blocks on a full queue before dropping the tick
    pub queue_send_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub breaker_error_threshold: u32,
    pub breaker_window: Duration,
    pub breaker_cooldown: Duration,
    /// Snapshot cadence in `Poll` mode
    pub poll_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            mode: MonitorMode::Stream,
            max_concurrent_watchers: 100,
            queue_capacity: 1000,
            queue_send_timeout: Duration::from_millis(250),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            breaker_error_threshold: 10,
            breaker_window: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Batch ingestion settings.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Drain once this many ticks are buffered
    pub batch_size: usize,
    /// ... or once this much time has passed, whichever first
    pub flush_interval: Duration,
    /// Failed batches kept for retry; beyond this the oldest is dropped
    pub max_pending_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_millis(500),
            max_pending_batches: 10,
        }
    }
}

/// Cache sink settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub ttl: Duration,
    pub key_prefix: String,
    pub redis_url: String,
    pub disk_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            ttl: Duration::from_secs(60),
            key_prefix: "spreadscan:tick".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            disk_dir: PathBuf::from("./cache"),
        }
    }
}

/// Opportunity detector settings.
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub scan_interval: Duration,
    /// Minimum spread (percent of buy price) before a candidate is emitted
    pub min_spread_pct: f64,
    /// Ticks older than this are ignored during a scan
    pub max_tick_age: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(2),
            min_spread_pct: 0.1,
            max_tick_age: Duration::from_secs(30),
        }
    }
}

/// Aggregated configuration for the whole core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub universe: UniverseConfig,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub detector: DetectorConfig,
}

impl CoreConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// Configuration-level problems (no exchanges, no quote currencies,
    /// zero-sized pools) are the only fatal startup errors in this crate.
    pub fn from_env() -> Result<Self> {
        let exchanges = parse_list("SPREADSCAN_EXCHANGES", "binance,okx");
        let quote_currencies = parse_list("SPREADSCAN_QUOTE_CURRENCIES", "USDT");

        let market_types = parse_list("SPREADSCAN_MARKET_TYPES", "spot")
            .iter()
            .map(|s| {
                s.parse::<MarketType>()
                    .map_err(|e| anyhow!("SPREADSCAN_MARKET_TYPES: {}", e))
            })
            .collect::<Result<Vec<_>>>()?;

        let mode = match env::var("SPREADSCAN_MONITOR_MODE")
            .unwrap_or_else(|_| "stream".to_string())
            .to_lowercase()
            .as_str()
        {
            "stream" => MonitorMode::Stream,
            "poll" => MonitorMode::Poll,
            other => return Err(anyhow!("SPREADSCAN_MONITOR_MODE must be stream or poll, got {}", other)),
        };

        let backend = CacheBackend::parse(
            &env::var("SPREADSCAN_CACHE_BACKEND").unwrap_or_else(|_| "memory".to_string()),
        )?;

        let config = Self {
            universe: UniverseConfig {
                exchanges,
                market_types,
                quote_currencies,
                refresh_interval: secs("SPREADSCAN_UNIVERSE_REFRESH_SECS", 3600)?,
            },
            pool: PoolConfig {
                max_rest_size: parse_usize("SPREADSCAN_MAX_REST_POOL_SIZE", 10)?,
                max_stream_size: parse_usize("SPREADSCAN_MAX_STREAM_POOL_SIZE", 5)?,
                acquire_timeout: secs("SPREADSCAN_POOL_ACQUIRE_TIMEOUT_SECS", 10)?,
                health_check_timeout: secs("SPREADSCAN_HEALTH_CHECK_TIMEOUT_SECS", 3)?,
            },
            monitor: MonitorConfig {
                mode,
                max_concurrent_watchers: parse_usize("SPREADSCAN_MAX_WATCHERS", 100)?,
                queue_capacity: parse_usize("SPREADSCAN_QUEUE_CAPACITY", 1000)?,
                queue_send_timeout: millis("SPREADSCAN_QUEUE_SEND_TIMEOUT_MS", 250)?,
                backoff_base: millis("SPREADSCAN_BACKOFF_BASE_MS", 1000)?,
                backoff_max: millis("SPREADSCAN_BACKOFF_MAX_MS", 30_000)?,
                breaker_error_threshold: parse_u32("SPREADSCAN_BREAKER_ERRORS", 10)?,
                breaker_window: secs("SPREADSCAN_BREAKER_WINDOW_SECS", 60)?,
                breaker_cooldown: secs("SPREADSCAN_BREAKER_COOLDOWN_SECS", 30)?,
                poll_interval: secs("SPREADSCAN_POLL_INTERVAL_SECS", 5)?,
            },
            batch: BatchConfig {
                batch_size: parse_usize("SPREADSCAN_BATCH_SIZE", 100)?,
                flush_interval: millis("SPREADSCAN_FLUSH_INTERVAL_MS", 500)?,
                max_pending_batches: parse_usize("SPREADSCAN_MAX_PENDING_BATCHES", 10)?,
            },
            cache: CacheConfig {
                backend,
                ttl: secs("SPREADSCAN_CACHE_TTL_SECS", 60)?,
                key_prefix: env::var("SPREADSCAN_CACHE_KEY_PREFIX")
                    .unwrap_or_else(|_| "spreadscan:tick".to_string()),
                redis_url: env::var("REDIS_URL")
                    .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
                disk_dir: PathBuf::from(
                    env::var("SPREADSCAN_CACHE_DIR").unwrap_or_else(|_| "./cache".to_string()),
                ),
            },
            detector: DetectorConfig {
                scan_interval: secs("SPREADSCAN_SCAN_INTERVAL_SECS", 2)?,
                min_spread_pct: parse_f64("SPREADSCAN_MIN_SPREAD_PCT", 0.1)?,
                max_tick_age: secs("SPREADSCAN_MAX_TICK_AGE_SECS", 30)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.universe.exchanges.is_empty() {
            return Err(anyhow!("at least one exchange must be configured"));
        }
        if self.universe.quote_currencies.is_empty() {
            return Err(anyhow!("at least one quote currency must be configured"));
        }
        if self.universe.market_types.is_empty() {
            return Err(anyhow!("at least one market type must be configured"));
        }
        if self.pool.max_rest_size == 0 || self.pool.max_stream_size == 0 {
            return Err(anyhow!("pool sizes must be > 0"));
        }
        if self.monitor.max_concurrent_watchers == 0 {
            return Err(anyhow!("SPREADSCAN_MAX_WATCHERS must be > 0"));
        }
        if self.monitor.queue_capacity == 0 {
            return Err(anyhow!("SPREADSCAN_QUEUE_CAPACITY must be > 0"));
        }
        if self.detector.min_spread_pct < 0.0 {
            return Err(anyhow!("SPREADSCAN_MIN_SPREAD_PCT must be >= 0"));
        }
        Ok(())
    }
}

fn parse_list(var_name: &str, default: &str) -> Vec<String> {
    env::var(var_name)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse environment variable as usize with default fallback
fn parse_usize(var_name: &str, default: usize) -> Result<usize> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid integer", var_name)),
        Err(_) => Ok(default),
    }
}

/// Parse environment variable as u32 with default fallback
fn parse_u32(var_name: &str, default: u32) -> Result<u32> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid u32", var_name)),
        Err(_) => Ok(default),
    }
}

/// Parse environment variable as f64 with default fallback
fn parse_f64(var_name: &str, default: f64) -> Result<f64> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid f64", var_name)),
        Err(_) => Ok(default),
    }
}

fn secs(var_name: &str, default: u64) -> Result<Duration> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map(Duration::from_secs)
            .map_err(|_| anyhow!("{} must be a valid number of seconds", var_name)),
        Err(_) => Ok(Duration::from_secs(default)),
    }
}

fn millis(var_name: &str, default: u64) -> Result<Duration> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| anyhow!("{} must be a valid number of milliseconds", var_name)),
        Err(_) => Ok(Duration::from_millis(default)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests that set environment variables are avoided here: the process
    // environment is shared across the test binary and mutating it races
    // with other tests. Validation is covered against built structs.

    fn base_config() -> CoreConfig {
        CoreConfig {
            universe: UniverseConfig {
                exchanges: vec!["binance".to_string(), "okx".to_string()],
                market_types: vec![MarketType::Spot],
                quote_currencies: vec!["USDT".to_string()],
                refresh_interval: Duration::from_secs(3600),
            },
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            detector: DetectorConfig::default(),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_zero_exchanges_is_fatal() {
        let mut config = base_config();
        config.universe.exchanges.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_pool_size_is_fatal() {
        let mut config = base_config();
        config.pool.max_stream_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_helpers_use_defaults() {
        assert_eq!(parse_usize("SPREADSCAN_NON_EXISTENT_XYZ", 7).unwrap(), 7);
        assert_eq!(
            secs("SPREADSCAN_NON_EXISTENT_XYZ", 30).unwrap(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_cache_backend_parse() {
        assert_eq!(CacheBackend::parse("memory").unwrap(), CacheBackend::Memory);
        assert_eq!(CacheBackend::parse("Redis").unwrap(), CacheBackend::Redis);
        assert_eq!(CacheBackend::parse("file").unwrap(), CacheBackend::Disk);
        assert!(CacheBackend::parse("s3").is_err());
    }
}
