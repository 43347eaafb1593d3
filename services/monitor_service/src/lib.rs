//! Monitoring daemon around `spreadscan_core`.
//!
//! Wires configuration, connector registry, connection pools, the symbol
//! universe resolver, the price monitor, batched cache ingestion and the
//! opportunity detector into one runnable service with graceful shutdown.

pub mod config;
pub mod service;

pub use config::MonitorServiceConfig;
pub use service::MonitorService;
