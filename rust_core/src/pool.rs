//! Bounded connection pools, one per (exchange, kind).
//!
//! This module provides:
//! - Lazy creation of venue sessions up to a per-pool cap
//! - Blocking acquire with timeout and a typed exhaustion error
//! - Exclusive ownership of checked-out connections (enforced by move)
//! - Health checking and replacement of dead connections
//! - Clean drain of every pool at shutdown
//!
//! Each pool is guarded by its own lock; different exchanges never
//! contend with each other.

use crate::config::PoolConfig;
use crate::errors::{ExchangeError, PoolError};
use crate::exchange::{ConnectorRegistry, ExchangeConnector, ExchangeSession};
use crate::types::ConnectionKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Upper bound on one wait slice while blocked on a full pool. Re-checking
/// the shelf on this cadence covers notify races between waiters.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// A live venue session checked out of, or shelved in, a pool.
///
/// While idle the pool owns it exclusively; while checked out exactly one
/// caller owns it. The ownership transfer is by move, so two callers can
/// never hold the same connection.
pub struct PooledConnection {
    id: u64,
    pub exchange_id: String,
    pub kind: ConnectionKind,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub last_health_check_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    session: Box<dyn ExchangeSession>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("exchange_id", &self.exchange_id)
            .field("kind", &self.kind)
            .field("created_at", &self.created_at)
            .field("last_used_at", &self.last_used_at)
            .field("last_health_check_at", &self.last_health_check_at)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    /// Identifier unique within this connection's (exchange, kind) pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_mut(&mut self) -> &mut dyn ExchangeSession {
        self.session.as_mut()
    }

    /// Flag the connection so the pool closes it on release instead of
    /// shelving it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    async fn close(&mut self) {
        self.session.close().await;
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<PooledConnection>,
    in_flight: usize,
    closed: bool,
}

#[derive(Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    exhausted: AtomicU64,
    health_check_failures: AtomicU64,
}

/// Point-in-time view of one pool, for logs and tests.
#[derive(Debug, Clone)]
pub struct PoolStatsSnapshot {
    pub idle: usize,
    pub in_flight: usize,
    pub max_size: usize,
    pub created: u64,
    pub closed: u64,
    pub exhausted: u64,
    pub health_check_failures: u64,
}

struct Pool {
    exchange_id: String,
    kind: ConnectionKind,
    max_size: usize,
    acquire_timeout: Duration,
    connector: Arc<dyn ExchangeConnector>,
    state: Mutex<PoolState>,
    released: Notify,
    next_id: AtomicU64,
    counters: PoolCounters,
}

impl Pool {
    fn new(
        connector: Arc<dyn ExchangeConnector>,
        kind: ConnectionKind,
        max_size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            exchange_id: connector.exchange_id().to_string(),
            kind,
            max_size,
            acquire_timeout,
            connector,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
            counters: PoolCounters::default(),
        }
    }

    async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            enum Plan {
                Reuse(PooledConnection),
                Create,
                Wait,
            }

            let plan = {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::Closed {
                        exchange: self.exchange_id.clone(),
                        kind: self.kind,
                    });
                }
                if let Some(mut conn) = state.idle.pop() {
                    state.in_flight += 1;
                    conn.last_used_at = Utc::now();
                    Plan::Reuse(conn)
                } else if state.idle.len() + state.in_flight < self.max_size {
                    // Reserve the slot before connecting so concurrent
                    // acquires cannot overshoot max_size
                    state.in_flight += 1;
                    Plan::Create
                } else {
                    Plan::Wait
                }
            };

            match plan {
                Plan::Reuse(conn) => return Ok(conn),
                Plan::Create => match self.connector.connect(self.kind).await {
                    Ok(session) => {
                        self.counters.created.fetch_add(1, Ordering::Relaxed);
                        let now = Utc::now();
                        debug!(
                            exchange = %self.exchange_id,
                            kind = %self.kind,
                            "created pooled connection"
                        );
                        return Ok(PooledConnection {
                            id: self.next_id.fetch_add(1, Ordering::Relaxed),
                            exchange_id: self.exchange_id.clone(),
                            kind: self.kind,
                            created_at: now,
                            last_used_at: now,
                            last_health_check_at: None,
                            healthy: true,
                            session,
                        });
                    }
                    Err(e) => {
                        {
                            let mut state = self.state.lock();
                            state.in_flight -= 1;
                        }
                        self.released.notify_one();
                        return Err(PoolError::Connect(e));
                    }
                },
                Plan::Wait => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            exchange = %self.exchange_id,
                            kind = %self.kind,
                            "pool exhausted after {:?}",
                            self.acquire_timeout
                        );
                        return Err(PoolError::Exhausted {
                            exchange: self.exchange_id.clone(),
                            kind: self.kind,
                            waited: self.acquire_timeout,
                        });
                    }
                    let slice = (deadline - now).min(WAIT_SLICE);
                    let _ = tokio::time::timeout(slice, self.released.notified()).await;
                }
            }
        }
    }

    fn release(&self, mut conn: PooledConnection) {
        let keep = {
            let mut state = self.state.lock();
            state.in_flight = state.in_flight.saturating_sub(1);
            let keep = !state.closed
                && conn.healthy
                && state.idle.len() + state.in_flight < self.max_size;
            if keep {
                conn.last_used_at = Utc::now();
                state.idle.push(conn);
            }
            keep
        };

        if !keep {
            // Dropped here; the underlying socket closes with the session
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
            debug!(
                exchange = %self.exchange_id,
                kind = %self.kind,
                "closed connection instead of shelving it"
            );
        }
        self.released.notify_one();
    }

    async fn close_all(&self) {
        let drained = {
            let mut state = self.state.lock();
            state.closed = true;
            std::mem::take(&mut state.idle)
        };
        let count = drained.len();
        for mut conn in drained {
            conn.close().await;
            self.counters.closed.fetch_add(1, Ordering::Relaxed);
        }
        // Wake every waiter so they observe the closed flag
        self.released.notify_waiters();
        if count > 0 {
            info!(
                exchange = %self.exchange_id,
                kind = %self.kind,
                "closed {} idle connections",
                count
            );
        }
    }

    fn snapshot(&self) -> PoolStatsSnapshot {
        let state = self.state.lock();
        PoolStatsSnapshot {
            idle: state.idle.len(),
            in_flight: state.in_flight,
            max_size: self.max_size,
            created: self.counters.created.load(Ordering::Relaxed),
            closed: self.counters.closed.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            health_check_failures: self.counters.health_check_failures.load(Ordering::Relaxed),
        }
    }
}

/// Owns every connection pool, one per (exchange, kind).
///
/// Constructed once at startup and passed by reference to the components
/// that need venue connections.
pub struct ConnectionPoolManager {
    pools: HashMap<(String, ConnectionKind), Arc<Pool>>,
    health_check_timeout: Duration,
}

impl ConnectionPoolManager {
    pub fn new(
        registry: &ConnectorRegistry,
        exchanges: &[String],
        config: &PoolConfig,
    ) -> Result<Self, ExchangeError> {
        let mut pools = HashMap::new();
        for exchange_id in exchanges {
            let connector = registry.get_required(exchange_id)?;
            pools.insert(
                (exchange_id.clone(), ConnectionKind::Rest),
                Arc::new(Pool::new(
                    connector.clone(),
                    ConnectionKind::Rest,
                    config.max_rest_size,
                    config.acquire_timeout,
                )),
            );
            pools.insert(
                (exchange_id.clone(), ConnectionKind::Stream),
                Arc::new(Pool::new(
                    connector,
                    ConnectionKind::Stream,
                    config.max_stream_size,
                    config.acquire_timeout,
                )),
            );
        }
        info!("Connection pools initialized for {} exchanges", exchanges.len());
        Ok(Self {
            pools,
            health_check_timeout: config.health_check_timeout,
        })
    }

    fn pool(&self, exchange_id: &str, kind: ConnectionKind) -> Result<&Arc<Pool>, PoolError> {
        self.pools
            .get(&(exchange_id.to_string(), kind))
            .ok_or_else(|| PoolError::Connect(ExchangeError::UnknownExchange(exchange_id.to_string())))
    }

    /// Check out a connection, creating one lazily if the pool has room.
    /// Blocks up to the configured acquire timeout when every slot is
    /// busy, then fails with `PoolError::Exhausted`.
    pub async fn acquire(
        &self,
        exchange_id: &str,
        kind: ConnectionKind,
    ) -> Result<PooledConnection, PoolError> {
        self.pool(exchange_id, kind)?.acquire().await
    }

    /// Return a connection. Healthy connections go back on the shelf
    /// unless it is already full (possible after a create/release race),
    /// in which case the connection is closed; unhealthy ones are always
    /// closed.
    pub fn release(&self, conn: PooledConnection) {
        match self.pools.get(&(conn.exchange_id.clone(), conn.kind)) {
            Some(pool) => pool.release(conn),
            // Unreachable with connections produced by this manager
            None => warn!(
                exchange = %conn.exchange_id,
                "released connection for unknown pool; dropping"
            ),
        }
    }

    /// Probe a checked-out connection with the venue's cheap liveness
    /// call. On failure the connection is marked unhealthy so release
    /// will close it; the replacement happens lazily on a later acquire.
    pub async fn health_check(&self, conn: &mut PooledConnection) -> bool {
        let exchange_id = conn.exchange_id.clone();
        let kind = conn.kind;
        let result =
            tokio::time::timeout(self.health_check_timeout, conn.session_mut().ping()).await;
        conn.last_health_check_at = Some(Utc::now());
        let ok = matches!(result, Ok(Ok(())));
        if !ok {
            conn.mark_unhealthy();
            if let Ok(pool) = self.pool(&exchange_id, kind) {
                pool.counters
                    .health_check_failures
                    .fetch_add(1, Ordering::Relaxed);
            }
            warn!(
                exchange = %conn.exchange_id,
                kind = %conn.kind,
                "health check failed, connection will be replaced"
            );
        }
        ok
    }

    /// Ping every idle connection in every pool, discarding dead ones.
    /// Intended to run on a timer from the service.
    pub async fn sweep_idle(&self) {
        for pool in self.pools.values() {
            let drained = {
                let mut state = pool.state.lock();
                if state.closed {
                    continue;
                }
                let drained = std::mem::take(&mut state.idle);
                // Swept connections count as in-flight so the size
                // invariant holds while they are being probed
                state.in_flight += drained.len();
                drained
            };
            for mut conn in drained {
                self.health_check(&mut conn).await;
                pool.release(conn);
            }
        }
    }

    /// Drain and close every connection across all exchanges and kinds.
    pub async fn close_all(&self) {
        for pool in self.pools.values() {
            pool.close_all().await;
        }
        info!("All connection pools closed");
    }

    pub fn stats(&self, exchange_id: &str, kind: ConnectionKind) -> Option<PoolStatsSnapshot> {
        self.pools
            .get(&(exchange_id.to_string(), kind))
            .map(|p| p.snapshot())
    }

    pub fn all_stats(&self) -> Vec<(String, ConnectionKind, PoolStatsSnapshot)> {
        self.pools
            .iter()
            .map(|((exchange, kind), pool)| (exchange.clone(), *kind, pool.snapshot()))
            .collect()
    }
}
