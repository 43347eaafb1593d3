//! Spreadscan core - cross-exchange quote aggregation and arbitrage scanning.
//!
//! This crate provides:
//! - Symbol universe resolution (instruments tradable on every venue)
//! - Bounded per-venue connection pools for request and stream handles
//! - Per-venue gateways with symbol normalization and validity caching
//! - A price monitor running one watch loop per (venue, symbol) pair
//!   under a global concurrency limit, with backoff and a circuit breaker
//! - Batched ingestion into a pluggable cache sink (memory, disk, Redis)
//! - A periodic opportunity scanner emitting arbitrage candidates
//!
//! Order execution, strategy logic and presentation layers are separate
//! consumers of this crate; they receive candidates over a channel and
//! read the cache, nothing more.

pub mod cache;
pub mod config;
pub mod detector;
pub mod errors;
pub mod exchange;
pub mod ingest;
pub mod monitor;
pub mod pool;
pub mod types;
pub mod universe;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use types::*;
