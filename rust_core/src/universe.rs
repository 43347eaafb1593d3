//! Symbol universe resolution.
//!
//! Fetches every configured venue's instrument catalog and intersects the
//! tradable symbols per (market type, quote currency). The result is the
//! set of pairs watchable on *all* venues that answered this round. The
//! current set is swapped atomically behind an `Arc`, so readers always
//! see either the previous complete set or the new complete set.

use crate::config::UniverseConfig;
use crate::exchange::ConnectorRegistry;
use crate::types::{Instrument, MarketType};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Map key for one bucket of the universe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UniverseKey {
    pub market_type: MarketType,
    pub quote: String,
}

impl UniverseKey {
    pub fn new(market_type: MarketType, quote: impl Into<String>) -> Self {
        Self {
            market_type,
            quote: quote.into(),
        }
    }
}

/// One (venue, symbol) pair the monitor should watch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchEntry {
    pub exchange_id: String,
    pub symbol: String,
    pub market_type: MarketType,
    pub quote: String,
}

/// Symbols tradable on every participating venue, bucketed per
/// (market type, quote currency). Immutable once built.
#[derive(Debug, Clone)]
pub struct CommonSymbolSet {
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    /// Venues whose catalog contributed to this round
    pub exchanges: Vec<String>,
    sets: HashMap<UniverseKey, BTreeSet<String>>,
}

impl CommonSymbolSet {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            built_at: Utc::now(),
            exchanges: Vec::new(),
            sets: HashMap::new(),
        }
    }

    /// Assemble a set directly from per-bucket symbol sets. Normally the
    /// resolver builds these; this is for callers wiring a fixed universe.
    pub fn from_sets(
        generation: u64,
        exchanges: Vec<String>,
        sets: HashMap<UniverseKey, BTreeSet<String>>,
    ) -> Self {
        Self {
            generation,
            built_at: Utc::now(),
            exchanges,
            sets,
        }
    }

    pub fn symbols(&self, market_type: MarketType, quote: &str) -> Option<&BTreeSet<String>> {
        self.sets.get(&UniverseKey::new(market_type, quote))
    }

    /// Iterate buckets as (key, symbols).
    pub fn buckets(&self) -> impl Iterator<Item = (&UniverseKey, &BTreeSet<String>)> {
        self.sets.iter()
    }

    /// Total symbols across every bucket.
    pub fn total_symbols(&self) -> usize {
        self.sets.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_symbols() == 0
    }

    /// The full (venue × symbol) product the monitor should watch.
    /// Deterministic order: buckets sorted by key, symbols sorted within.
    pub fn watch_entries(&self) -> Vec<WatchEntry> {
        let mut keys: Vec<&UniverseKey> = self.sets.keys().collect();
        keys.sort_by(|a, b| (a.market_type, &a.quote).cmp(&(b.market_type, &b.quote)));

        let mut entries = Vec::new();
        for key in keys {
            for symbol in &self.sets[key] {
                for exchange_id in &self.exchanges {
                    entries.push(WatchEntry {
                        exchange_id: exchange_id.clone(),
                        symbol: symbol.clone(),
                        market_type: key.market_type,
                        quote: key.quote.clone(),
                    });
                }
            }
        }
        entries
    }
}

#[derive(Debug, Default)]
pub struct ResolverStats {
    pub rounds: AtomicU64,
    pub catalog_failures: AtomicU64,
}

/// Builds and owns the current [`CommonSymbolSet`].
pub struct UniverseResolver {
    registry: Arc<ConnectorRegistry>,
    config: UniverseConfig,
    current: RwLock<Arc<CommonSymbolSet>>,
    last_catalogs: RwLock<HashMap<String, Arc<Vec<Instrument>>>>,
    generation: AtomicU64,
    stats: ResolverStats,
}

impl UniverseResolver {
    pub fn new(registry: Arc<ConnectorRegistry>, config: UniverseConfig) -> Self {
        Self {
            registry,
            config,
            current: RwLock::new(Arc::new(CommonSymbolSet::empty(0))),
            last_catalogs: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
            stats: ResolverStats::default(),
        }
    }

    /// The current set. Cheap; callers keep the `Arc` for a consistent
    /// view while the resolver may swap in a newer one.
    pub fn current(&self) -> Arc<CommonSymbolSet> {
        self.current.read().clone()
    }

    /// The catalog fetched from a venue during the last resolution round.
    pub fn catalog(&self, exchange_id: &str) -> Option<Arc<Vec<Instrument>>> {
        self.last_catalogs.read().get(exchange_id).cloned()
    }

    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    /// Fetch all catalogs and rebuild the common set, replacing the
    /// current one atomically. Venues whose catalog fetch fails are
    /// excluded from this round and logged; an empty result is valid.
    pub async fn refresh(&self) -> Arc<CommonSymbolSet> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.rounds.fetch_add(1, Ordering::Relaxed);

        let mut per_exchange: Vec<(String, HashMap<UniverseKey, BTreeSet<String>>)> = Vec::new();
        let mut catalogs: HashMap<String, Arc<Vec<Instrument>>> = HashMap::new();

        for exchange_id in &self.config.exchanges {
            let connector = match self.registry.get_required(exchange_id) {
                Ok(c) => c,
                Err(e) => {
                    warn!(exchange = %exchange_id, "excluded from universe: {}", e);
                    self.stats.catalog_failures.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
            };
            match connector.load_catalog().await {
                Ok(instruments) => {
                    let buckets = self.bucket(&instruments);
                    catalogs.insert(exchange_id.clone(), Arc::new(instruments));
                    per_exchange.push((exchange_id.clone(), buckets));
                }
                Err(e) => {
                    // Non-fatal: this venue just sits out the round
                    warn!(exchange = %exchange_id, "catalog fetch failed, excluded from round: {}", e);
                    self.stats.catalog_failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let set = Arc::new(self.intersect(generation, per_exchange));
        *self.last_catalogs.write() = catalogs;
        *self.current.write() = set.clone();

        info!(
            generation,
            exchanges = set.exchanges.len(),
            symbols = set.total_symbols(),
            "symbol universe rebuilt"
        );
        set
    }

    /// How often the service should call [`refresh`](Self::refresh).
    pub fn refresh_interval(&self) -> std::time::Duration {
        self.config.refresh_interval
    }

    /// Bucket one venue's instruments into configured (market type,
    /// quote) sets. Every configured key is present, possibly empty.
    fn bucket(&self, instruments: &[Instrument]) -> HashMap<UniverseKey, BTreeSet<String>> {
        let mut buckets = self.empty_buckets();
        for inst in instruments {
            if !inst.active {
                continue;
            }
            if !self.config.market_types.contains(&inst.market_type) {
                continue;
            }
            if !self.config.quote_currencies.contains(&inst.quote) {
                continue;
            }
            let key = UniverseKey::new(inst.market_type, inst.quote.clone());
            if let Some(set) = buckets.get_mut(&key) {
                set.insert(inst.symbol.clone());
            }
        }
        buckets
    }

    fn empty_buckets(&self) -> HashMap<UniverseKey, BTreeSet<String>> {
        let mut buckets = HashMap::new();
        for market_type in &self.config.market_types {
            for quote in &self.config.quote_currencies {
                buckets.insert(UniverseKey::new(*market_type, quote.clone()), BTreeSet::new());
            }
        }
        buckets
    }

    /// Intersect per-venue buckets. Set intersection is commutative, so
    /// the result is independent of venue iteration order.
    fn intersect(
        &self,
        generation: u64,
        per_exchange: Vec<(String, HashMap<UniverseKey, BTreeSet<String>>)>,
    ) -> CommonSymbolSet {
        let mut exchanges = Vec::with_capacity(per_exchange.len());
        let mut sets: Option<HashMap<UniverseKey, BTreeSet<String>>> = None;

        for (exchange_id, buckets) in per_exchange {
            exchanges.push(exchange_id);
            sets = Some(match sets {
                None => buckets,
                Some(mut acc) => {
                    for (key, symbols) in acc.iter_mut() {
                        let other = buckets.get(key).cloned().unwrap_or_default();
                        *symbols = symbols.intersection(&other).cloned().collect();
                    }
                    acc
                }
            });
        }

        CommonSymbolSet {
            generation,
            built_at: Utc::now(),
            exchanges,
            sets: sets.unwrap_or_else(|| self.empty_buckets()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ExchangeError;
    use crate::exchange::{ExchangeConnector, ExchangeSession};
    use crate::types::ConnectionKind;
    use async_trait::async_trait;

    struct FixedCatalog {
        id: String,
        instruments: Vec<Instrument>,
        fail: bool,
    }

    #[async_trait]
    impl ExchangeConnector for FixedCatalog {
        fn exchange_id(&self) -> &str {
            &self.id
        }

        fn to_venue_symbol(&self, symbol: &str) -> String {
            symbol.replace('/', "")
        }

        async fn load_catalog(&self) -> Result<Vec<Instrument>, ExchangeError> {
            if self.fail {
                return Err(ExchangeError::Catalog {
                    exchange: self.id.clone(),
                    source: anyhow::anyhow!("catalog endpoint down"),
                });
            }
            Ok(self.instruments.clone())
        }

        async fn connect(
            &self,
            _kind: ConnectionKind,
        ) -> Result<Box<dyn ExchangeSession>, ExchangeError> {
            Err(ExchangeError::transport(&self.id, "no sessions in this test"))
        }
    }

    fn spot(exchange: &str, base: &str, quote: &str, active: bool) -> Instrument {
        Instrument::new(exchange, base, quote, MarketType::Spot, active)
    }

    fn resolver_for(connectors: Vec<FixedCatalog>) -> UniverseResolver {
        let mut registry = ConnectorRegistry::new();
        let exchanges: Vec<String> = connectors.iter().map(|c| c.id.clone()).collect();
        for c in connectors {
            registry.register(Arc::new(c));
        }
        UniverseResolver::new(
            Arc::new(registry),
            UniverseConfig {
                exchanges,
                market_types: vec![MarketType::Spot],
                quote_currencies: vec!["USDT".to_string(), "BTC".to_string()],
                refresh_interval: std::time::Duration::from_secs(3600),
            },
        )
    }

    #[tokio::test]
    async fn test_intersection_is_exact() {
        let resolver = resolver_for(vec![
            FixedCatalog {
                id: "alpha".to_string(),
                instruments: vec![
                    spot("alpha", "BTC", "USDT", true),
                    spot("alpha", "ETH", "USDT", true),
                    spot("alpha", "SOL", "USDT", true),
                    spot("alpha", "ETH", "BTC", true),
                ],
                fail: false,
            },
            FixedCatalog {
                id: "beta".to_string(),
                instruments: vec![
                    spot("beta", "BTC", "USDT", true),
                    spot("beta", "ETH", "USDT", true),
                    spot("beta", "XRP", "USDT", true),
                ],
                fail: false,
            },
        ]);

        let set = resolver.refresh().await;
        let usdt = set.symbols(MarketType::Spot, "USDT").unwrap();
        assert_eq!(
            usdt.iter().cloned().collect::<Vec<_>>(),
            vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]
        );
        // ETH/BTC exists only on alpha, so the BTC bucket is empty
        assert!(set.symbols(MarketType::Spot, "BTC").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inactive_instruments_are_filtered() {
        let resolver = resolver_for(vec![
            FixedCatalog {
                id: "alpha".to_string(),
                instruments: vec![
                    spot("alpha", "BTC", "USDT", true),
                    spot("alpha", "ETH", "USDT", false),
                ],
                fail: false,
            },
            FixedCatalog {
                id: "beta".to_string(),
                instruments: vec![
                    spot("beta", "BTC", "USDT", true),
                    spot("beta", "ETH", "USDT", true),
                ],
                fail: false,
            },
        ]);

        let set = resolver.refresh().await;
        let usdt = set.symbols(MarketType::Spot, "USDT").unwrap();
        assert!(usdt.contains("BTC/USDT"));
        assert!(!usdt.contains("ETH/USDT"));
    }

    #[tokio::test]
    async fn test_failed_exchange_is_excluded_not_fatal() {
        let resolver = resolver_for(vec![
            FixedCatalog {
                id: "alpha".to_string(),
                instruments: vec![spot("alpha", "BTC", "USDT", true)],
                fail: false,
            },
            FixedCatalog {
                id: "broken".to_string(),
                instruments: vec![],
                fail: true,
            },
        ]);

        let set = resolver.refresh().await;
        assert_eq!(set.exchanges, vec!["alpha".to_string()]);
        assert!(set
            .symbols(MarketType::Spot, "USDT")
            .unwrap()
            .contains("BTC/USDT"));
        assert_eq!(resolver.stats().catalog_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_empty_intersection_is_valid() {
        let resolver = resolver_for(vec![
            FixedCatalog {
                id: "alpha".to_string(),
                instruments: vec![spot("alpha", "BTC", "USDT", true)],
                fail: false,
            },
            FixedCatalog {
                id: "beta".to_string(),
                instruments: vec![spot("beta", "ETH", "USDT", true)],
                fail: false,
            },
        ]);

        let set = resolver.refresh().await;
        assert!(set.is_empty());
        assert_eq!(set.exchanges.len(), 2);
    }

    #[tokio::test]
    async fn test_replacement_is_atomic_by_generation() {
        let resolver = resolver_for(vec![FixedCatalog {
            id: "alpha".to_string(),
            instruments: vec![spot("alpha", "BTC", "USDT", true)],
            fail: false,
        }]);

        let before = resolver.current();
        assert_eq!(before.generation, 0);

        resolver.refresh().await;
        let after = resolver.current();
        assert_eq!(after.generation, 1);
        // The old Arc still reads consistently
        assert_eq!(before.generation, 0);
        assert!(before.is_empty());
    }

    #[tokio::test]
    async fn test_watch_entries_product() {
        let resolver = resolver_for(vec![
            FixedCatalog {
                id: "alpha".to_string(),
                instruments: vec![
                    spot("alpha", "BTC", "USDT", true),
                    spot("alpha", "ETH", "USDT", true),
                ],
                fail: false,
            },
            FixedCatalog {
                id: "beta".to_string(),
                instruments: vec![
                    spot("beta", "BTC", "USDT", true),
                    spot("beta", "ETH", "USDT", true),
                ],
                fail: false,
            },
        ]);

        let set = resolver.refresh().await;
        let entries = set.watch_entries();
        // 2 symbols x 2 exchanges
        assert_eq!(entries.len(), 4);
        assert!(entries
            .iter()
            .any(|e| e.exchange_id == "beta" && e.symbol == "ETH/USDT"));
    }
}
